use hidmux_peer::{open_agent, ShutdownReason};
use tracing::info;

use crate::cmd::{load_config, RunArgs};
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT};

pub fn run(args: RunArgs) -> CliResult<i32> {
    let config = load_config(args.config.as_deref())?;

    let engine = if args.socket {
        connect_socket(&args, &config)
    } else {
        open_agent(&args.device, &config)
    }
    .map_err(|err| peer_error("link setup failed", err))?;

    let handle = engine.handle();
    ctrlc::set_handler(move || handle.shutdown())
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;

    let reason = engine.run();
    info!(?reason, "agent finished");
    match reason {
        ShutdownReason::LinkLost => Err(CliError::new(TIMEOUT, "link to controller timed out")),
        ShutdownReason::Destroyed | ShutdownReason::Local => Ok(SUCCESS),
    }
}

#[cfg(unix)]
fn connect_socket(
    args: &RunArgs,
    config: &hidmux_peer::AgentConfig,
) -> hidmux_peer::Result<hidmux_peer::Engine> {
    hidmux_peer::connect_agent_socket(&args.device, config)
}

#[cfg(not(unix))]
fn connect_socket(
    _args: &RunArgs,
    _config: &hidmux_peer::AgentConfig,
) -> hidmux_peer::Result<hidmux_peer::Engine> {
    Err(hidmux_peer::PeerError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "simulated device sockets require Unix domain sockets",
    )))
}
