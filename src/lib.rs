/// Check if a device is a known HiDock model and describe how to reach it over USB.
pub mod device_ids;

/// Encode and decode the framed packets every command and response travels in.
pub mod frame;

/// Move raw bytes to and from a device over bulk USB endpoints.
pub mod transport;

/// An in-process stand-in for a device, driven by a responder closure.
pub mod sim;

/// Correlate responses with outstanding requests by sequence number.
pub mod dispatcher;

/// Payload layouts of individual commands.
pub mod protocol;

/// Download recordings block by block with per-block retry.
pub mod transfer;

/// Flash a firmware image through an explicit upgrade state machine.
pub mod firmware;

/// The public face of a connected device.
pub mod session;

pub use device_ids::DeviceIdentity;
pub use session::{DeviceSession, Error, SessionConfig};
