//! # Link Simulation
//!
//! In-process radio medium for tests and benchmarks.
//!
//! ## Features
//!
//! - Any number of [`SimulatedRadio`]s sharing one [`SimulatedAir`]
//! - Deterministic, seeded packet loss (ChaCha)
//! - Forced send failures and targeted frame drops for fault injection
//! - Driver-side peer registry with the hardware ceiling
//!
//! Events are pushed onto each device's channel synchronously, exactly as a
//! driver ISR would; they are observed on the receiving transport's next
//! `poll`.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::error::RadioError;
use crate::frame::MacAddress;
use crate::radio::{event_channel, Radio, RadioEvent, RadioEventSink};
use crate::DEFAULT_PEER_CAPACITY;

/// Link quality for the simulated medium.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConditions {
    /// Chance (0-100) a frame never reaches its destination.
    pub loss_percent: u8,
}

impl LinkConditions {
    /// Every frame arrives.
    pub const PERFECT: Self = Self { loss_percent: 0 };

    /// Devices a few metres apart in a busy room.
    pub const NOISY: Self = Self { loss_percent: 10 };

    /// Edge of range.
    pub const POOR: Self = Self { loss_percent: 30 };

    /// Should this frame be lost? `roll` is uniform in 0..100.
    #[inline]
    #[must_use]
    pub const fn should_drop(&self, roll: u8) -> bool {
        roll < self.loss_percent
    }
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self::PERFECT
    }
}

/// Counters for the medium as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AirStats {
    /// Frames put on the air.
    pub transmitted: u64,
    /// Frame copies delivered to receivers.
    pub delivered: u64,
    /// Frames lost to link conditions or injected faults.
    pub lost: u64,
}

struct Node {
    addr: MacAddress,
    sink: RadioEventSink,
}

struct AirState {
    nodes: Vec<Node>,
    rng: ChaCha8Rng,
    conditions: LinkConditions,
    forced_failures: usize,
    stats: AirStats,
}

impl AirState {
    fn transmit(&mut self, from: MacAddress, dest: MacAddress, frame: &[u8]) {
        self.stats.transmitted += 1;

        let forced = self.forced_failures > 0;
        if forced {
            self.forced_failures -= 1;
        }
        let roll: u8 = self.rng.gen_range(0..100);
        let lost = forced || self.conditions.should_drop(roll);

        if lost {
            self.stats.lost += 1;
            trace!("air: frame {} -> {} lost", from, dest);
        } else {
            for node in &self.nodes {
                if node.addr != from && (dest.is_broadcast() || node.addr == dest) {
                    node.sink.received(from, frame);
                    self.stats.delivered += 1;
                }
            }
        }

        // Broadcast has no link-layer ack, so it always reports success.
        let success = dest.is_broadcast() || !lost;
        if let Some(sender) = self.nodes.iter().find(|n| n.addr == from) {
            sender.sink.send_complete(dest, success);
        }
    }
}

/// Shared medium connecting simulated radios.
#[derive(Clone)]
pub struct SimulatedAir {
    state: Arc<Mutex<AirState>>,
}

impl SimulatedAir {
    /// Creates a medium with deterministic loss.
    #[must_use]
    pub fn new(seed: u64, conditions: LinkConditions) -> Self {
        Self {
            state: Arc::new(Mutex::new(AirState {
                nodes: Vec::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                conditions,
                forced_failures: 0,
                stats: AirStats::default(),
            })),
        }
    }

    /// Adds a device to the medium. Returns its radio and the event
    /// receiver its transport should drain.
    #[must_use]
    pub fn attach(&self, addr: MacAddress) -> (SimulatedRadio, Receiver<RadioEvent>) {
        let (sink, rx) = event_channel();
        self.state.lock().nodes.push(Node { addr, sink });
        let radio = SimulatedRadio {
            addr,
            air: self.clone(),
            registered: Vec::new(),
            registry_capacity: DEFAULT_PEER_CAPACITY,
        };
        (radio, rx)
    }

    /// Changes link quality.
    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.state.lock().conditions = conditions;
    }

    /// Makes the next `count` transmissions fail regardless of conditions.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().forced_failures += count;
    }

    /// Returns medium statistics.
    #[must_use]
    pub fn stats(&self) -> AirStats {
        self.state.lock().stats
    }
}

/// Radio driver backed by a [`SimulatedAir`].
pub struct SimulatedRadio {
    addr: MacAddress,
    air: SimulatedAir,
    registered: Vec<MacAddress>,
    registry_capacity: usize,
}

impl SimulatedRadio {
    /// This radio's address.
    #[must_use]
    pub const fn addr(&self) -> MacAddress {
        self.addr
    }

    /// Addresses currently in the driver's peer registry.
    #[must_use]
    pub fn registered_peers(&self) -> &[MacAddress] {
        &self.registered
    }
}

impl Radio for SimulatedRadio {
    fn send(&mut self, dest: MacAddress, frame: &[u8]) -> Result<(), RadioError> {
        if !dest.is_broadcast() && !self.registered.contains(&dest) {
            return Err(RadioError::PeerNotRegistered(dest));
        }
        self.air.state.lock().transmit(self.addr, dest, frame);
        Ok(())
    }

    fn register_peer(&mut self, addr: MacAddress) -> Result<(), RadioError> {
        if self.registered.contains(&addr) {
            return Ok(());
        }
        if self.registered.len() >= self.registry_capacity {
            return Err(RadioError::PeerTableFull);
        }
        self.registered.push(addr);
        Ok(())
    }

    fn unregister_peer(&mut self, addr: MacAddress) -> Result<(), RadioError> {
        let before = self.registered.len();
        self.registered.retain(|a| *a != addr);
        if self.registered.len() == before {
            return Err(RadioError::PeerNotRegistered(addr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddress = MacAddress([0xAA, 0, 0, 0, 0, 1]);
    const B: MacAddress = MacAddress([0xBB, 0, 0, 0, 0, 2]);
    const C: MacAddress = MacAddress([0xCC, 0, 0, 0, 0, 3]);

    #[test]
    fn test_unicast_requires_registration() {
        let air = SimulatedAir::new(1, LinkConditions::PERFECT);
        let (mut a, _rx_a) = air.attach(A);
        assert_eq!(a.send(B, &[1]), Err(RadioError::PeerNotRegistered(B)));
        a.register_peer(B).unwrap();
        assert!(a.send(B, &[1]).is_ok());
    }

    #[test]
    fn test_broadcast_reaches_everyone_but_sender() {
        let air = SimulatedAir::new(1, LinkConditions::PERFECT);
        let (mut a, rx_a) = air.attach(A);
        let (_b, rx_b) = air.attach(B);
        let (_c, rx_c) = air.attach(C);

        a.send(MacAddress::BROADCAST, &[5]).unwrap();

        assert_eq!(rx_b.try_recv().unwrap(), RadioEvent::Received { from: A, bytes: vec![5] });
        assert_eq!(rx_c.try_recv().unwrap(), RadioEvent::Received { from: A, bytes: vec![5] });
        assert_eq!(
            rx_a.try_recv().unwrap(),
            RadioEvent::SendComplete { dest: MacAddress::BROADCAST, success: true }
        );
        assert_eq!(air.stats().delivered, 2);
    }

    #[test]
    fn test_forced_failure_reports_unicast_failure() {
        let air = SimulatedAir::new(1, LinkConditions::PERFECT);
        let (mut a, rx_a) = air.attach(A);
        let (_b, rx_b) = air.attach(B);
        a.register_peer(B).unwrap();

        air.fail_next(1);
        a.send(B, &[1]).unwrap();
        assert!(rx_b.try_recv().is_err());
        assert_eq!(rx_a.try_recv().unwrap(), RadioEvent::SendComplete { dest: B, success: false });
    }

    #[test]
    fn test_loss_is_deterministic_per_seed() {
        let run = |seed| {
            let air = SimulatedAir::new(seed, LinkConditions::POOR);
            let (mut a, _rx_a) = air.attach(A);
            let (_b, _rx_b) = air.attach(B);
            for _ in 0..200 {
                a.send(MacAddress::BROADCAST, &[0]).unwrap();
            }
            air.stats().lost
        };
        assert_eq!(run(7), run(7));
        let lost = run(7);
        assert!(lost > 20 && lost < 120);
    }

    #[test]
    fn test_driver_registry_ceiling() {
        let air = SimulatedAir::new(1, LinkConditions::PERFECT);
        let (mut a, _rx) = air.attach(A);
        for n in 0..20u8 {
            a.register_peer(MacAddress::new([1, 0, 0, 0, 0, n])).unwrap();
        }
        assert_eq!(a.register_peer(B), Err(RadioError::PeerTableFull));
        a.unregister_peer(MacAddress::new([1, 0, 0, 0, 0, 0])).unwrap();
        assert!(a.register_peer(B).is_ok());
        assert_eq!(a.registered_peers().len(), 20);
    }
}
