// 退出码探针：通过纯文本输出判断命令是否完成及其退出码
use once_cell::sync::Lazy;
use regex::Regex;

/// 追加到命令末尾的探针，回显上一条命令的退出码
pub const EXIT_STATUS_PROBE: &str = "echo ----$?----";

/// 退出码为 0 时出现在输出中的标记
pub const SUCCESS_MARKER: &str = "----0----";

static MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"----(\d{1,3})----").unwrap());

/// 在命令后追加退出码探针
pub fn with_probe(command: &str) -> String {
    format!("{};{}", command.trim_end().trim_end_matches(';'), EXIT_STATUS_PROBE)
}

/// 某个退出码对应的输出标记
pub fn marker(code: u8) -> String {
    format!("----{}----", code)
}

pub fn succeeded(output: &str) -> bool {
    output.contains(SUCCESS_MARKER)
}

/// 解析输出中最后一个探针标记。回显的命令本身含 `$?`，不会被误认。
pub fn parse_exit_code(output: &str) -> Option<i32> {
    MARKER_RE
        .captures_iter(output)
        .filter_map(|caps| caps[1].parse::<i32>().ok())
        .filter(|code| (0..=255).contains(code))
        .last()
}
