use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hidmux_peer::AgentConfig;

use crate::exit::{peer_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent on a device and serve the controller until destroyed.
    Run(RunArgs),
    /// Accept an agent on a simulated device socket and call one method.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Run(_) => "run",
            Command::Call(_) => "call",
            Command::Version(_) => "version",
        }
    }
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Device node, or socket path with --socket.
    pub device: PathBuf,
    /// Treat DEVICE as a simulated device socket and connect to it.
    #[arg(long)]
    pub socket: bool,
    /// JSON configuration file.
    #[arg(long, value_name = "FILE", env = "HIDMUX_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Simulated device socket to bind.
    pub path: PathBuf,
    /// Method name.
    pub method: String,
    /// Raw string argument bytes.
    #[arg(long, conflicts_with_all = ["hex", "file", "arg"])]
    pub data: Option<String>,
    /// Argument bytes as hex (e.g. 010203).
    #[arg(long, conflicts_with_all = ["data", "file", "arg"])]
    pub hex: Option<String>,
    /// Read argument bytes from file.
    #[arg(long, conflicts_with_all = ["data", "hex", "arg"])]
    pub file: Option<PathBuf>,
    /// NUL-terminated string argument; repeat for several.
    #[arg(long, conflicts_with_all = ["data", "hex", "file"])]
    pub arg: Vec<String>,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// JSON configuration file.
    #[arg(long, value_name = "FILE", env = "HIDMUX_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn load_config(path: Option<&Path>) -> CliResult<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path)
            .map_err(|err| peer_error(&format!("failed loading {}", path.display()), err)),
        None => Ok(AgentConfig::default()),
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/hidmux.json"))).unwrap_err();
        assert!(err.message.starts_with("failed loading /nonexistent/hidmux.json"));
    }
}
