use std::path::Path;
use std::sync::Arc;

use hidmux_device::{DeviceError, DeviceStream};
use hidmux_frame::{LinkConfig, LinkLayer, LinkRole, ReportReader, ReportWriter};
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::transport::Transport;

/// Open a device node and bring up the agent stack on it.
pub fn open_agent(path: impl AsRef<Path>, config: &AgentConfig) -> Result<Engine> {
    connect_agent(DeviceStream::open(path)?, config)
}

/// Connect to a simulated device socket and bring up the agent stack.
#[cfg(unix)]
pub fn connect_agent_socket(path: impl AsRef<Path>, config: &AgentConfig) -> Result<Engine> {
    connect_agent(hidmux_device::SimulatedDevice::connect(path)?, config)
}

/// Run the initiator handshake on `device`, start the link and transport
/// workers, and return an engine ready for [`Engine::run`].
pub fn connect_agent(device: DeviceStream, config: &AgentConfig) -> Result<Engine> {
    let link_config = LinkConfig {
        role: LinkRole::Initiator,
        ..config.link.clone()
    };
    let transport = start_stack(device, link_config, config)?;
    Ok(Engine::new(transport, config.engine.clone()))
}

/// Handshake, then start link and transport workers.
pub(crate) fn start_stack(
    device: DeviceStream,
    link_config: LinkConfig,
    config: &AgentConfig,
) -> Result<Arc<Transport>> {
    match device.set_read_timeout(config.device_read_timeout) {
        Ok(()) => {}
        Err(DeviceError::Unsupported(kind)) => {
            debug!(kind, "device does not support read timeouts, reads will block");
        }
        Err(err) => return Err(err.into()),
    }

    let mut reader = ReportReader::new(device.try_clone()?);
    let mut writer = ReportWriter::new(device);
    let role = link_config.role;
    let link = Arc::new(LinkLayer::new(link_config));
    let handshake = match role {
        LinkRole::Initiator => link.connect(&mut reader, &mut writer)?,
        LinkRole::Responder => link.accept(&mut reader, &mut writer)?,
    };
    info!(
        ?role,
        peer_seq = handshake.peer_seq,
        attempts = handshake.attempts,
        "link handshake complete"
    );
    link.start(reader, writer)?;

    let transport = Arc::new(Transport::new(link, config.transport.clone()));
    transport.start()?;
    Ok(transport)
}
