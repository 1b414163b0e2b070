use std::path::Path;
use std::time::Duration;

use hidmux_frame::LinkConfig;
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::error::Result;
use crate::transport::TransportConfig;

/// Configuration for one end of a hidmux stack.
///
/// Every field is optional in JSON; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub link: LinkConfig,
    pub transport: TransportConfig,
    pub engine: EngineConfig,
    /// Read timeout applied to socket devices so worker loops can notice
    /// shutdown. Device nodes always block.
    #[serde(with = "hidmux_frame::millis::option")]
    pub device_read_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            transport: TransportConfig::default(),
            engine: EngineConfig::default(),
            device_read_timeout: Some(Duration::from_millis(50)),
        }
    }
}

impl AgentConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_device_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.device_read_timeout = timeout;
        self
    }
}
