//! # Radio Driver Seam
//!
//! The transport drives a [`Radio`] and learns about outcomes through
//! [`RadioEvent`]s. Drivers raise events from interrupt context, so the
//! only thing they get is a [`RadioEventSink`]: a cloneable, non-blocking
//! sender onto a channel the application tick drains.

use crossbeam_channel::{Receiver, Sender};

use crate::error::RadioError;
use crate::frame::MacAddress;

/// Radio hardware as seen by the transport.
pub trait Radio {
    /// Starts transmitting one frame. Completion arrives later as
    /// [`RadioEvent::SendComplete`]; an `Err` here means the frame never
    /// left the driver.
    ///
    /// # Errors
    ///
    /// Returns the driver's refusal reason.
    fn send(&mut self, dest: MacAddress, frame: &[u8]) -> Result<(), RadioError>;

    /// Adds an address to the driver's peer registry.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::PeerTableFull`] if the driver has no room.
    fn register_peer(&mut self, addr: MacAddress) -> Result<(), RadioError>;

    /// Removes an address from the driver's peer registry.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::PeerNotRegistered`] if it was never added.
    fn unregister_peer(&mut self, addr: MacAddress) -> Result<(), RadioError>;
}

/// Something the radio reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioEvent {
    /// A frame handed to [`Radio::send`] finished transmitting.
    SendComplete {
        /// Where it was going.
        dest: MacAddress,
        /// Whether the link layer acknowledged it.
        success: bool,
    },
    /// A frame arrived.
    Received {
        /// Who sent it.
        from: MacAddress,
        /// Raw frame, header included.
        bytes: Vec<u8>,
    },
}

/// Interrupt-side handle for raising radio events.
#[derive(Clone, Debug)]
pub struct RadioEventSink {
    tx: Sender<RadioEvent>,
}

impl RadioEventSink {
    /// Reports a finished transmission. Returns false if the transport is gone.
    pub fn send_complete(&self, dest: MacAddress, success: bool) -> bool {
        self.tx.send(RadioEvent::SendComplete { dest, success }).is_ok()
    }

    /// Reports a received frame. Returns false if the transport is gone.
    pub fn received(&self, from: MacAddress, bytes: &[u8]) -> bool {
        self.tx
            .send(RadioEvent::Received {
                from,
                bytes: bytes.to_vec(),
            })
            .is_ok()
    }
}

/// Creates the event channel between a driver and its transport.
#[must_use]
pub fn event_channel() -> (RadioEventSink, Receiver<RadioEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (RadioEventSink { tx }, rx)
}
