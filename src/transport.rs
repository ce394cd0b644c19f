use crate::device_ids::{DeviceIdentity, HIDOCK_VID, UsbId};
use log::{debug, info, trace, warn};
use rusb::{DeviceHandle, GlobalContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte-level link to one device: a bulk OUT endpoint for requests and a bulk IN endpoint for
/// responses. The dispatcher guarantees at most one concurrent writer and one concurrent reader.
pub trait Transport: Send + Sync {
    /// Write one complete frame to the device.
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until some bytes arrive or `timeout` passes. Never returns an empty buffer: no data
    /// is reported as [TransportError::Timeout].
    fn read(&self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the device. Every later call fails with [TransportError::NotConnected].
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Failures of the physical link. All of them except [Timeout](TransportError::Timeout) and
/// [Stalled](TransportError::Stalled) end the session.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    #[error("no HiDock with USB ID {0} is connected")]
    NotFound(UsbId),

    #[error("could not open device {id}")]
    Connect { id: UsbId, source: rusb::Error },

    #[error("USB transaction error while {action}")]
    Usb {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("endpoint stalled while {action}; halt cleared")]
    Stalled { action: &'static str },

    #[error("device was unplugged or stopped responding")]
    DeviceLost,

    #[error("device is not connected")]
    NotConnected,

    #[error("timed out waiting for data from device")]
    Timeout,
}

impl TransportError {
    /// Whether the session that produced this error is no longer usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Timeout | TransportError::Stalled { .. }
        )
    }
}

/// [Transport] over libusb bulk transfers.
pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    identity: DeviceIdentity,
    connected: AtomicBool,
}

impl UsbTransport {
    /// Open the first attached device matching `identity` and claim its command interface.
    pub fn connect(identity: &DeviceIdentity) -> Result<Self, TransportError> {
        let id = identity.usb_id();
        let devices = rusb::devices().map_err(|source| TransportError::Connect { id, source })?;

        let device = devices
            .iter()
            .find(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == id.vid && desc.product_id() == id.pid)
                    .unwrap_or(false)
            })
            .ok_or(TransportError::NotFound(id))?;

        let handle = device
            .open()
            .map_err(|source| TransportError::Connect { id, source })?;

        // Not supported on every platform; claiming below reports the real problem if any.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {e}");
        }

        handle
            .claim_interface(identity.interface_number)
            .map_err(|source| TransportError::Connect { id, source })?;

        info!(
            "Connected to {id} on bus {:03} address {:03}",
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            handle,
            identity: *identity,
            connected: AtomicBool::new(true),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// Translate a libusb error, invalidating the handle if the device is gone. A stalled
    /// `endpoint` is cleared and reported as [TransportError::Stalled] if that works.
    fn map_usb(&self, source: rusb::Error, endpoint: u8, action: &'static str) -> TransportError {
        match UsbFailure::classify(source) {
            UsbFailure::Timeout => TransportError::Timeout,
            UsbFailure::Stall => match self.handle.clear_halt(endpoint) {
                Ok(()) => {
                    warn!("Cleared stall on endpoint {endpoint:#04x} while {action}");
                    TransportError::Stalled { action }
                }
                Err(e) => {
                    debug!("Clearing stall on endpoint {endpoint:#04x} failed: {e}");
                    self.lose(source, action)
                }
            },
            UsbFailure::Lost => self.lose(source, action),
            UsbFailure::Other => TransportError::Usb { source, action },
        }
    }

    fn lose(&self, source: rusb::Error, action: &'static str) -> TransportError {
        warn!("Lost device {} while {action}: {source}", self.identity.usb_id());
        self.connected.store(false, Ordering::Release);
        TransportError::DeviceLost
    }
}

/// What a libusb error means for the link.
#[derive(Debug, PartialEq, Eq)]
enum UsbFailure {
    Timeout,
    /// Endpoint halted. Recoverable if the halt can be cleared.
    Stall,
    Lost,
    Other,
}

impl UsbFailure {
    fn classify(source: rusb::Error) -> Self {
        match source {
            rusb::Error::Timeout => UsbFailure::Timeout,
            rusb::Error::Pipe => UsbFailure::Stall,
            rusb::Error::NoDevice | rusb::Error::Io => UsbFailure::Lost,
            _ => UsbFailure::Other,
        }
    }
}

impl Transport for UsbTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;

        let mut sent = 0;
        while sent < bytes.len() {
            let n = self
                .handle
                .write_bulk(self.identity.endpoint_out, &bytes[sent..], WRITE_TIMEOUT)
                .map_err(|e| match self.map_usb(e, self.identity.endpoint_out, "writing frame") {
                    // A write that cannot complete leaves the link in an unknown state.
                    TransportError::Timeout => TransportError::Usb {
                        source: e,
                        action: "writing frame",
                    },
                    other => other,
                })?;
            sent += n;
        }

        trace!("Wrote {sent} bytes to endpoint {:#04x}", self.identity.endpoint_out);
        Ok(())
    }

    fn read(&self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;

        let mut buf = vec![0u8; max_bytes];
        let n = self
            .handle
            .read_bulk(self.identity.endpoint_in, &mut buf, timeout)
            .map_err(|e| self.map_usb(e, self.identity.endpoint_in, "reading response"))?;
        if n == 0 {
            return Err(TransportError::Timeout);
        }

        buf.truncate(n);
        trace!("Read {n} bytes from endpoint {:#04x}", self.identity.endpoint_in);
        Ok(buf)
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.handle.release_interface(self.identity.interface_number) {
                debug!("Releasing interface failed: {e}");
            }
            info!("Disconnected from {}", self.identity.usb_id());
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A HiDock found on the bus.
#[derive(Clone, Debug)]
pub struct AttachedDevice {
    pub id: UsbId,
    pub bus: u8,
    pub address: u8,
}

/// List every attached device carrying the HiDock vendor ID.
pub fn list_devices() -> Result<Vec<AttachedDevice>, TransportError> {
    let devices = rusb::devices().map_err(|source| TransportError::Usb {
        source,
        action: "enumerating devices",
    })?;

    Ok(devices
        .iter()
        .filter_map(|d| {
            let desc = d.device_descriptor().ok()?;
            (desc.vendor_id() == HIDOCK_VID).then(|| AttachedDevice {
                id: UsbId {
                    vid: desc.vendor_id(),
                    pid: desc.product_id(),
                },
                bus: d.bus_number(),
                address: d.address(),
            })
        })
        .collect())
}
