//! Reliable multiplexed channels and remote control over fixed-size HID
//! records.
//!
//! # Crate Structure
//!
//! - [`device`]: raw record devices (device nodes, simulated sockets)
//! - [`frame`]: record codec, handshake and the reliable link layer
//! - [`peer`]: channels, transport mux, command engine and controller
//!   (behind the `peer` feature)

/// Re-export device types.
pub mod device {
    pub use hidmux_device::*;
}

/// Re-export frame and link types.
pub mod frame {
    pub use hidmux_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use hidmux_peer::*;
}
