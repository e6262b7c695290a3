// 命令行参数解析
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ssh-fleet")]
#[command(about = "Run commands, CLI sessions and mirror uploads on many SSH hosts at once")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Target hosts, comma separated (address or address:port)
    #[arg(short = 'H', long, value_delimiter = ',')]
    pub host: Vec<String>,

    /// JSON host inventory file
    #[arg(short, long)]
    pub inventory: Option<PathBuf>,

    /// Default SSH port
    #[arg(short, long, default_value = "22")]
    pub port: u16,

    /// SSH username
    #[arg(short, long, default_value = "root")]
    pub username: String,

    /// SSH password (if not provided, will prompt for input)
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// Shell prompt marker set on every session
    #[arg(long, default_value = "[dfv]# ")]
    pub prompt: String,

    /// Per-host command timeout in seconds
    #[arg(long, default_value = "120")]
    pub timeout: u64,

    /// Maximum number of hosts worked on at the same time (default: all)
    #[arg(short = 't', long)]
    pub max_parallel: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
#[derive(Debug)]
pub enum Commands {
    /// Run a shell command on every host and check its exit status
    Run {
        /// Shell command
        command: String,
    },
    /// Mirror a local file or directory to every host
    Upload {
        /// Local file or directory path
        local_path: PathBuf,
        /// Remote destination directory
        remote_path: String,
    },
    /// Run a command inside the management CLI on every host
    Cli {
        /// CLI command
        command: String,
        /// CLI account
        #[arg(long, default_value = "admin")]
        cli_user: String,
        /// CLI password (if not provided, will prompt for input)
        #[arg(long)]
        cli_password: Option<String>,
        /// Script that starts the CLI
        #[arg(long)]
        start_command: String,
        /// Normal CLI prompt
        #[arg(long, default_value = "admin:/>")]
        cli_prompt: String,
        /// Prompt expected after this command, if different from the normal prompt
        #[arg(long)]
        expect: Option<String>,
    },
}
