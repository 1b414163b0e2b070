use std::path::Path;

use hidmux_device::{DeviceStream, SimulatedDevice};
use hidmux_frame::{LinkConfig, LinkRole};

use crate::config::AgentConfig;
use crate::connector::start_stack;
use crate::controller::Controller;
use crate::error::Result;

/// Plays the device on a Unix socket and accepts one agent as controller.
pub struct ControllerListener {
    device: SimulatedDevice,
    config: AgentConfig,
}

impl ControllerListener {
    /// Bind a simulated device socket at `path`.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            device: SimulatedDevice::bind(path)?,
            config: AgentConfig::default(),
        })
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn path(&self) -> &Path {
        self.device.path()
    }

    /// Wait for an agent to connect and complete the responder handshake.
    pub fn accept(&self) -> Result<Controller> {
        accept_controller(self.device.accept()?, &self.config)
    }
}

/// Run the responder handshake on `device` and start a controller over it.
pub fn accept_controller(device: DeviceStream, config: &AgentConfig) -> Result<Controller> {
    let link_config = LinkConfig {
        role: LinkRole::Responder,
        ..config.link.clone()
    };
    Ok(Controller::new(start_stack(device, link_config, config)?))
}
