//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "weigh", version, about = "Scale telemetry agent")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/weigh.toml")]
    pub config: PathBuf,

    /// Log and report as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides logging.level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent until ctrl-c
    Run {
        /// Use the configured simulator instead of the serial port
        #[arg(long, action = ArgAction::SetTrue)]
        simulate: bool,
    },
    /// Load and validate the config, then print a summary
    CheckConfig,
    /// Judge the health snapshot written by a running agent; non-zero when unhealthy
    Health,
    /// Run the configured framing and regex over a literal frame
    Parse {
        /// Raw device output; `\r`, `\n` and `\xNN` escapes are expanded
        #[arg(long, value_name = "TEXT")]
        frame: String,
    },
}

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}
