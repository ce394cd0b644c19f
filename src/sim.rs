//! An in-memory device that speaks the frame protocol, for exercising the driver without
//! hardware.
//!
//! Frames written by the host are decoded, recorded, and handed to a responder closure whose
//! return value is queued for the host to read. Tests that need precise control over timing can
//! use [SimulatedDevice::silent] and inject responses by hand.

use crate::frame::{self, Frame};
use crate::transport::{Transport, TransportError};
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Link {
    Up,
    Unplugged,
    Closed,
}

struct Inner {
    responder: Mutex<Responder>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    inbound_ready: Condvar,
    written: Mutex<Vec<Frame>>,
    written_changed: Condvar,
    link: Mutex<Link>,
}

/// Cloning yields another handle to the same simulated device.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Inner>,
}

impl SimulatedDevice {
    pub fn new(responder: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                responder: Mutex::new(Box::new(responder)),
                inbound: Mutex::new(VecDeque::new()),
                inbound_ready: Condvar::new(),
                written: Mutex::new(Vec::new()),
                written_changed: Condvar::new(),
                link: Mutex::new(Link::Up),
            }),
        }
    }

    /// A device that never answers on its own.
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Queue raw bytes for the host to read, exactly as given.
    pub fn inject(&self, bytes: Vec<u8>) {
        self.inner.inbound.lock().push_back(bytes);
        self.inner.inbound_ready.notify_all();
    }

    /// Queue an encoded response frame. Frames too large to encode are dropped.
    pub fn reply(&self, frame: &Frame) {
        match frame.to_bytes() {
            Ok(bytes) => self.inject(bytes),
            Err(e) => warn!(
                "Simulated device cannot send {} #{}: {e}",
                frame.command, frame.sequence
            ),
        }
    }

    /// Every frame the host has written so far, in write order.
    pub fn written(&self) -> Vec<Frame> {
        self.inner.written.lock().clone()
    }

    /// Wait until at least `count` frames have been written. Returns whether that happened
    /// before `timeout`.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut written = self.inner.written.lock();
        while written.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner
                .written_changed
                .wait_for(&mut written, deadline - now);
        }
        true
    }

    /// Simulate the cable being pulled.
    pub fn unplug(&self) {
        *self.inner.link.lock() = Link::Unplugged;
        self.inner.inbound_ready.notify_all();
    }

    fn check_link(&self) -> Result<(), TransportError> {
        match *self.inner.link.lock() {
            Link::Up => Ok(()),
            Link::Unplugged => Err(TransportError::DeviceLost),
            Link::Closed => Err(TransportError::NotConnected),
        }
    }
}

impl Transport for SimulatedDevice {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_link()?;

        // Hosts only ever write whole frames, so anything else is a driver bug worth surfacing.
        let request = frame::decode(bytes).map_err(|_| TransportError::Usb {
            source: rusb::Error::InvalidParam,
            action: "writing frame",
        })?;
        trace!("Simulated device got {} #{}", request.command, request.sequence);

        self.inner.written.lock().push(request.clone());
        self.inner.written_changed.notify_all();

        let replies = {
            let mut responder = self.inner.responder.lock();
            (*responder)(&request)
        };
        for reply in replies {
            self.reply(&reply);
        }
        Ok(())
    }

    fn read(&self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut inbound = self.inner.inbound.lock();
        loop {
            self.check_link()?;

            if let Some(mut chunk) = inbound.pop_front() {
                if chunk.len() > max_bytes {
                    let rest = chunk.split_off(max_bytes);
                    inbound.push_front(rest);
                }
                return Ok(chunk);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            self.inner
                .inbound_ready
                .wait_for(&mut inbound, deadline - now);
        }
    }

    fn disconnect(&self) {
        let mut link = self.inner.link.lock();
        if *link == Link::Up {
            *link = Link::Closed;
        }
        drop(link);
        self.inner.inbound_ready.notify_all();
    }

    fn is_connected(&self) -> bool {
        *self.inner.link.lock() == Link::Up
    }
}
