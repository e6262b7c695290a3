use std::path::{Component, Path};

use crate::utils::error::{FleetError, Result};

/// 拼接远程路径，远程端始终使用 `/`
pub fn remote_join(base: &str, name: &str) -> String {
    let name = name.replace('\\', "/");
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        return name.to_string();
    }
    if base == "/" {
        return format!("/{}", name);
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// 本地路径的最后一段名称
pub fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| FleetError::InvalidConfig(format!("Cannot determine file name of {}", path.display())))
}

/// 将 `root` 下的本地目录映射为远程相对路径
pub fn relative_remote(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}
