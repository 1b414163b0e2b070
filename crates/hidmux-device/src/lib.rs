//! Record device handles.
//!
//! The stack exchanges fixed 65-byte records with a device. This crate only
//! provides the byte handles; it does not enumerate or identify devices.
//! - Device nodes opened by path (e.g. a `hidraw` node)
//! - Simulated devices over Unix domain sockets (tests, local tooling)
//!
//! This is the lowest layer of hidmux. Everything else builds on top of
//! the [`DeviceStream`] type provided here.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{DeviceError, Result};
pub use traits::DeviceStream;

#[cfg(unix)]
pub use uds::SimulatedDevice;
