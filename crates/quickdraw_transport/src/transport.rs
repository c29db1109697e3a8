//! # Packet Transport
//!
//! Fragmenting datagram transport over a [`Radio`].
//!
//! ## Design
//!
//! - One global FIFO of frames, not one per destination
//! - Only the head frame is ever in flight; its completion advances the queue
//! - A cluster is built off to the side and appended whole, so a failed
//!   reservation never leaves half a message queued
//! - A failing fragment is retried up to `max_retries` times, then dropped;
//!   the receiver then sees a gap and discards the message
//!
//! ```text
//! send(payload)
//!   |-- split into ceil(len / F) frames --> [h|p0] [h|p1] [h|p2]
//!   |-- append to queue ------------------> Q: .. .. [h|p0] [h|p1] [h|p2]
//!   '-- queue was empty? ------------------> transmit head
//!
//! SendComplete(ok)    -> pop head, retries = 0, transmit next
//! SendComplete(fail)  -> retries < max ? resend head : drop head
//! ```

use std::collections::VecDeque;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::frame::{FrameHeader, MacAddress, PayloadType};
use crate::peer::{PeerEntry, PeerTable};
use crate::radio::{Radio, RadioEvent};
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_PEER_CAPACITY, MAX_FRAGMENTS, MAX_FRAGMENT_PAYLOAD};

/// Callback for a fully reassembled message of one payload type.
pub type PayloadHandler = Box<dyn FnMut(MacAddress, &[u8])>;

/// Transport tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Retries of a failed fragment before it is dropped.
    pub max_retries: u8,
    /// Peer table size.
    pub peer_capacity: usize,
    /// Payload bytes per fragment.
    pub max_fragment_payload: usize,
    /// Frames the send queue may hold; a cluster that would overflow it is
    /// rejected as an allocation failure.
    pub send_queue_frames: usize,
    /// Partial clusters idle this long are freed.
    pub reassembly_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            peer_capacity: DEFAULT_PEER_CAPACITY,
            max_fragment_payload: MAX_FRAGMENT_PAYLOAD,
            send_queue_frames: 512,
            reassembly_timeout_ms: 1000,
        }
    }
}

/// Transport statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames handed to the radio, retries included.
    pub frames_sent: u64,
    /// Frames received from the radio.
    pub frames_received: u64,
    /// Fragment retries.
    pub retries: u64,
    /// Fragments dropped after exhausting retries.
    pub frames_dropped: u64,
    /// Received frames rejected before reassembly.
    pub frames_rejected: u64,
    /// Partial messages discarded because of a gap.
    pub sequence_violations: u64,
    /// Messages dispatched to a handler.
    pub messages_delivered: u64,
    /// Sends refused for lack of storage.
    pub allocation_failures: u64,
    /// Peers evicted from the table.
    pub peers_evicted: u64,
}

/// A queued frame.
#[derive(Debug)]
struct OutboundFrame {
    dest: MacAddress,
    bytes: Vec<u8>,
}

/// Fragmenting, retrying transport.
pub struct PacketTransport<R: Radio> {
    radio: R,
    events: Receiver<RadioEvent>,
    config: TransportConfig,
    queue: VecDeque<OutboundFrame>,
    retries: u8,
    peers: PeerTable,
    handlers: [Option<PayloadHandler>; PayloadType::COUNT],
    stats: TransportStats,
}

impl<R: Radio> PacketTransport<R> {
    /// Creates a transport driving `radio` and draining `events`.
    #[must_use]
    pub fn new(radio: R, events: Receiver<RadioEvent>, config: TransportConfig) -> Self {
        let peers = PeerTable::with_capacity(config.peer_capacity);
        Self {
            radio,
            events,
            queue: VecDeque::with_capacity(config.send_queue_frames.min(64)),
            retries: 0,
            peers,
            handlers: [None, None, None],
            stats: TransportStats::default(),
            config,
        }
    }

    /// Fragments `payload` and queues it for `dest`.
    ///
    /// Sending starts right away if nothing else is queued.
    ///
    /// # Errors
    ///
    /// - [`TransportError::PayloadTooLarge`] if more than 255 fragments are needed.
    /// - [`TransportError::AllocationFailure`] if the cluster does not fit;
    ///   nothing is queued in that case.
    pub fn send(
        &mut self,
        dest: MacAddress,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> TransportResult<()> {
        let fragment_payload = self.config.max_fragment_payload.clamp(1, MAX_FRAGMENT_PAYLOAD);
        let count = payload.len().div_ceil(fragment_payload).max(1);

        if count > MAX_FRAGMENTS {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_FRAGMENTS * fragment_payload,
            });
        }

        let cluster = match self.build_cluster(dest, payload_type, payload, fragment_payload, count) {
            Ok(cluster) => cluster,
            Err(err) => {
                self.stats.allocation_failures += 1;
                error!("send of {} bytes to {} aborted: {}", payload.len(), dest, err);
                return Err(err);
            }
        };

        let was_idle = self.queue.is_empty();
        self.queue.extend(cluster);
        trace!("queued {} fragments for {}", count, dest);

        if was_idle {
            self.transmit_head();
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn build_cluster(
        &self,
        dest: MacAddress,
        payload_type: PayloadType,
        payload: &[u8],
        fragment_payload: usize,
        count: usize,
    ) -> TransportResult<Vec<OutboundFrame>> {
        let failure = TransportError::AllocationFailure { needed_frames: count };

        if self.queue.len() + count > self.config.send_queue_frames {
            return Err(failure);
        }

        let mut cluster = Vec::new();
        cluster.try_reserve_exact(count).map_err(|_| failure.clone())?;

        for index in 0..count {
            let start = index * fragment_payload;
            let end = (start + fragment_payload).min(payload.len());
            let chunk = &payload[start..end];

            let mut bytes = Vec::new();
            bytes
                .try_reserve_exact(FrameHeader::SIZE + chunk.len())
                .map_err(|_| failure.clone())?;

            // count <= 255 and chunk <= 245, both checked above.
            let header = FrameHeader::new(index as u8, count as u8, chunk.len() as u16, payload_type);
            bytes.extend_from_slice(header.as_bytes());
            bytes.extend_from_slice(chunk);

            cluster.push(OutboundFrame { dest, bytes });
        }

        Ok(cluster)
    }

    /// Hands the head frame to the radio, retrying immediate driver errors
    /// under the same budget as failed completions.
    fn transmit_head(&mut self) {
        loop {
            let Some(frame) = self.queue.front() else {
                return;
            };
            let dest = frame.dest;

            // Inbound traffic may have churned the table since the last
            // fragment, so every unicast frame re-checks registration.
            if !dest.is_broadcast() {
                self.ensure_registered(dest);
            }

            let Some(frame) = self.queue.front() else {
                return;
            };
            match self.radio.send(dest, &frame.bytes) {
                Ok(()) => {
                    self.stats.frames_sent += 1;
                    return;
                }
                Err(err) => {
                    if self.retries < self.config.max_retries {
                        self.retries += 1;
                        self.stats.retries += 1;
                        warn!("radio refused frame to {}: {} (retry {})", dest, err, self.retries);
                    } else {
                        error!("radio refused frame to {}: {}, dropping after {} retries", dest, err, self.retries);
                        self.drop_head();
                    }
                }
            }
        }
    }

    fn on_send_complete(&mut self, dest: MacAddress, success: bool) {
        if self.queue.is_empty() {
            debug!("send completion for {} with empty queue", dest);
            return;
        }

        if success {
            self.queue.pop_front();
            self.retries = 0;
        } else if self.retries < self.config.max_retries {
            self.retries += 1;
            self.stats.retries += 1;
            warn!("send to {} failed (retry {})", dest, self.retries);
        } else {
            error!("send to {} failed, dropping fragment after {} retries", dest, self.retries);
            self.drop_head();
        }

        self.transmit_head();
    }

    fn drop_head(&mut self) {
        self.queue.pop_front();
        self.retries = 0;
        self.stats.frames_dropped += 1;
    }

    /// Registers `dest` with the radio, evicting the LRU peer if needed.
    /// Peers that still have frames queued are evicted only as a last resort.
    fn ensure_registered(&mut self, dest: MacAddress) {
        let queue = &self.queue;
        let claimed = self
            .peers
            .touch_or_insert_sparing(dest, |entry| queue.iter().any(|f| f.dest == entry.addr()));
        let Some((slot, evicted)) = claimed.or_else(|| self.peers.touch_or_insert(dest)) else {
            return;
        };
        if let Some(evicted) = evicted {
            self.release_peer(&evicted);
        }

        let Some(entry) = self.peers.slot_mut(slot) else {
            return;
        };
        if entry.is_registered() {
            return;
        }
        match self.radio.register_peer(dest) {
            Ok(()) => entry.set_registered(true),
            Err(err) => warn!("could not register peer {}: {}", dest, err),
        }
    }

    fn release_peer(&mut self, evicted: &PeerEntry) {
        self.stats.peers_evicted += 1;
        if evicted.is_registered() {
            if let Err(err) = self.radio.unregister_peer(evicted.addr()) {
                warn!("could not unregister evicted peer {}: {}", evicted.addr(), err);
            }
        }
    }

    /// Drains pending radio events. Returns how many were handled.
    ///
    /// Call once per application tick.
    pub fn poll(&mut self, now_ms: u64) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                RadioEvent::SendComplete { dest, success } => self.on_send_complete(dest, success),
                RadioEvent::Received { from, bytes } => {
                    if let Err(err) = self.receive_frame(from, &bytes, now_ms) {
                        match err {
                            TransportError::SequenceViolation { .. } => {}
                            TransportError::OrphanFragment { .. } => debug!("{}", err),
                            _ => warn!("rejected frame from {}: {}", from, err),
                        }
                    }
                }
            }
            handled += 1;
        }

        let expired = self.expire_stale_reassembly(now_ms);
        if expired > 0 {
            debug!("freed {} stale reassembly buffers", expired);
        }
        handled
    }

    /// Processes one received frame, dispatching the message if it completes.
    ///
    /// # Errors
    ///
    /// Returns why the frame was rejected or why a partial message was dropped.
    pub fn receive_frame(&mut self, from: MacAddress, frame: &[u8], now_ms: u64) -> TransportResult<()> {
        self.stats.frames_received += 1;

        let header = match Self::validate_frame(frame) {
            Ok(header) => header,
            Err(err) => {
                self.stats.frames_rejected += 1;
                return Err(err);
            }
        };
        let payload_type = PayloadType::try_from(header.payload_type).map_err(|err| {
            self.stats.frames_rejected += 1;
            err
        })?;
        let payload = &frame[FrameHeader::SIZE..];

        // Receiving never pushes out a peer mid-conversation.
        let queue = &self.queue;
        let claimed = self.peers.touch_or_insert_sparing(from, |entry| {
            entry.is_registered()
                || entry.is_reassembling()
                || queue.iter().any(|f| f.dest == entry.addr())
        });
        let Some((slot, evicted)) = claimed else {
            if header.fragment_count == 1 {
                self.dispatch(from, payload_type, payload);
                return Ok(());
            }
            self.stats.frames_rejected += 1;
            return Err(TransportError::NoPeerSlot { peer: from });
        };
        if let Some(evicted) = evicted {
            self.release_peer(&evicted);
        }
        let Some(entry) = self.peers.slot_mut(slot) else {
            return Ok(());
        };

        let message = match entry.accept_fragment(&header, payload_type, payload, now_ms) {
            Ok(message) => message,
            Err(err) => {
                if matches!(err, TransportError::SequenceViolation { .. }) {
                    self.stats.sequence_violations += 1;
                }
                return Err(err);
            }
        };

        if let Some(message) = message {
            self.dispatch(from, payload_type, &message);
        }
        Ok(())
    }

    fn validate_frame(frame: &[u8]) -> TransportResult<FrameHeader> {
        let header = FrameHeader::parse(frame).ok_or(TransportError::FrameTooShort { len: frame.len() })?;

        let declared = usize::from(header.frame_length());
        let actual = frame.len() - FrameHeader::SIZE;
        if declared != actual {
            return Err(TransportError::FrameLengthMismatch { declared, actual });
        }
        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            return Err(TransportError::MalformedHeader {
                index: header.fragment_index,
                count: header.fragment_count,
            });
        }
        Ok(header)
    }

    fn dispatch(&mut self, from: MacAddress, payload_type: PayloadType, message: &[u8]) {
        match self.handlers[payload_type.index()].as_mut() {
            Some(handler) => {
                handler(from, message);
                self.stats.messages_delivered += 1;
            }
            None => debug!("no handler for {:?}, dropped {} bytes from {}", payload_type, message.len(), from),
        }
    }

    /// Frees partial clusters idle longer than the reassembly timeout.
    pub fn expire_stale_reassembly(&mut self, now_ms: u64) -> usize {
        let timeout = self.config.reassembly_timeout_ms;
        self.peers
            .iter_mut()
            .map(|entry| entry.expire_reassembly(now_ms, timeout))
            .filter(|expired| *expired)
            .count()
    }

    /// Installs the handler for a payload type, replacing any previous one.
    pub fn set_handler(&mut self, payload_type: PayloadType, handler: PayloadHandler) {
        if self.handlers[payload_type.index()].replace(handler).is_some() {
            debug!("replaced handler for {:?}", payload_type);
        }
    }

    /// Removes the handler for a payload type.
    pub fn clear_handler(&mut self, payload_type: PayloadType) {
        self.handlers[payload_type.index()] = None;
    }

    /// True if a handler is installed for `payload_type`.
    #[must_use]
    pub fn has_handler(&self, payload_type: PayloadType) -> bool {
        self.handlers[payload_type.index()].is_some()
    }

    /// Frames waiting to be sent, head included.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Returns statistics.
    #[must_use]
    pub const fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Returns the peer table.
    #[must_use]
    pub const fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the radio.
    #[must_use]
    pub const fn radio(&self) -> &R {
        &self.radio
    }

    /// Returns the radio mutably.
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}
