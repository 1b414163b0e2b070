//! Agent and controller in one process, joined by a simulated device pair.
//!
//! Run with:
//!   cargo run --example loopback --features peer

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use hidmux::device::DeviceStream;
use hidmux::peer::{accept_controller, connect_agent, AgentConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (agent_dev, controller_dev) = DeviceStream::pair()?;
    let config = AgentConfig::default();

    let accept = {
        let config = config.clone();
        thread::spawn(move || accept_controller(controller_dev, &config))
    };
    let engine = connect_agent(agent_dev, &config)?;
    let controller = accept
        .join()
        .map_err(|_| "controller thread panicked")??;
    let agent = thread::spawn(move || engine.run());

    let timeout = Duration::from_secs(5);
    let echoed = controller.call("echo", Bytes::from_static(b"hello over hid"), timeout)?;
    eprintln!("echo: {}", String::from_utf8_lossy(&echoed));

    let cwd = controller.call("pwd", Bytes::new(), timeout)?;
    eprintln!("agent working directory: {}", String::from_utf8_lossy(&cwd));

    controller.destroy(timeout)?;
    let reason = agent.join().map_err(|_| "agent thread panicked")?;
    eprintln!("agent stopped: {reason:?}");
    Ok(())
}
