use std::fs;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use hidmux_frame::WireWrite;
use hidmux_peer::PeerError;
use tracing::warn;

use crate::cmd::{load_config, parse_duration, CallArgs};
use crate::exit::{peer_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS};
use crate::output::{print_call, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;
    let config = load_config(args.config.as_deref())?;

    let controller = accept(&args, config)?;

    let started = Instant::now();
    let outcome = controller.call(&args.method, payload, timeout);
    let elapsed_ms = started.elapsed().as_millis();

    if let Err(err) = controller.destroy(timeout) {
        warn!(error = %err, "agent did not confirm shutdown");
    }

    match outcome {
        Ok(data) => {
            print_call(&args.method, Ok(data.as_ref()), elapsed_ms, format);
            Ok(SUCCESS)
        }
        Err(PeerError::Remote(message)) => {
            print_call(&args.method, Err(message.as_str()), elapsed_ms, format);
            Ok(FAILURE)
        }
        Err(err) => Err(peer_error("call failed", err)),
    }
}

#[cfg(unix)]
fn accept(args: &CallArgs, config: hidmux_peer::AgentConfig) -> CliResult<hidmux_peer::Controller> {
    let listener = hidmux_peer::ControllerListener::bind(&args.path)
        .map_err(|err| peer_error("bind failed", err))?
        .with_config(config);
    listener
        .accept()
        .map_err(|err| peer_error("accept failed", err))
}

#[cfg(not(unix))]
fn accept(
    _args: &CallArgs,
    _config: hidmux_peer::AgentConfig,
) -> CliResult<hidmux_peer::Controller> {
    Err(CliError::new(
        crate::exit::USAGE,
        "simulated device sockets require Unix domain sockets",
    ))
}

fn resolve_payload(args: &CallArgs) -> CliResult<Bytes> {
    if let Some(data) = &args.data {
        return Ok(Bytes::copy_from_slice(data.as_bytes()));
    }
    if let Some(hex) = &args.hex {
        return parse_hex(hex).map(Bytes::from);
    }
    if let Some(path) = &args.file {
        return fs::read(path).map(Bytes::from).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    let mut payload = BytesMut::new();
    for arg in &args.arg {
        if arg.contains('\0') {
            return Err(CliError::new(
                DATA_INVALID,
                "--arg values must not contain NUL bytes",
            ));
        }
        payload.put_cstring(arg);
    }
    Ok(payload.freeze())
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(digits)
        .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --hex payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: impl FnOnce(&mut CallArgs)) -> CallArgs {
        let mut args = CallArgs {
            path: "/tmp/hidmux.sock".into(),
            method: "echo".into(),
            data: None,
            hex: None,
            file: None,
            arg: Vec::new(),
            timeout: "5s".into(),
            config: None,
        };
        extra(&mut args);
        args
    }

    #[test]
    fn hex_payload() {
        assert_eq!(parse_hex("01 02ff").unwrap(), vec![1, 2, 0xff]);
        assert!(parse_hex("123").is_err());
        assert!(parse_hex("zz").is_err());
        assert_eq!(parse_hex("DeadBeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn string_args_are_nul_terminated() {
        let payload = resolve_payload(&args(|a| a.arg = vec!["/tmp".into(), "rb".into()])).unwrap();
        assert_eq!(payload.as_ref(), b"/tmp\0rb\0");
    }

    #[test]
    fn empty_payload_by_default() {
        assert!(resolve_payload(&args(|_| {})).unwrap().is_empty());
    }
}
