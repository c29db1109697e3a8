//! # Duel Protocol
//!
//! Fixed-size command packets carried as [`PayloadType::QuickdrawCommand`]
//! messages.
//!
//! ## Packet
//!
//! ```text
//! +-------------------------+---------+
//! | match record (55 bytes) | command |
//! |                         | i32 LE  |
//! +-------------------------+---------+
//! ```
//!
//! ## Listener Ownership
//!
//! At most one state listens at a time. Installing a listener hands back a
//! [`Listener`] (the receiving end of a channel) and drops the sender of the
//! previous one, so the previous holder can never be reached again. Nothing
//! in the protocol points back at a state: a dismounted state simply drops
//! its `Listener`, and commands arriving with nobody listening are dropped.

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::{Receiver, Sender};
use quickdraw_transport::{MacAddress, PacketTransport, PayloadType, Radio, RadioEvent, TransportConfig};
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, ProtocolResult};
use crate::match_record::{Match, MatchRecord};

/// Duel command set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CommandCode {
    /// Bounty to hunter: connection is up, here is the placeholder match.
    ConnectionConfirmed = 0,
    /// Hunter to bounty: match received, hunter id filled in.
    HunterReceiveMatch = 1,
    /// Bounty to hunter: final acknowledgment.
    BountyFinalAck = 4,
    /// Hunter to bounty: ready to duel.
    HunterReady = 5,
    /// Gameplay command.
    Hack = 6,
    /// Gameplay command.
    HackAck = 7,
    /// Gameplay command.
    HackConfirmed = 8,
    /// Gameplay command.
    Lockdown = 9,
    /// Gameplay command.
    LockdownAck = 10,
    /// Gameplay command.
    LockdownConfirmed = 11,
    /// Sender pressed; its draw time is in the match.
    DrawResult = 12,
    /// Sender never pressed; its pity time is in the match.
    NeverPressed = 13,
}

impl CommandCode {
    /// Every command, in wire-value order.
    pub const ALL: [Self; 12] = [
        Self::ConnectionConfirmed,
        Self::HunterReceiveMatch,
        Self::BountyFinalAck,
        Self::HunterReady,
        Self::Hack,
        Self::HackAck,
        Self::HackConfirmed,
        Self::Lockdown,
        Self::LockdownAck,
        Self::LockdownConfirmed,
        Self::DrawResult,
        Self::NeverPressed,
    ];

    /// Wire value.
    #[inline]
    #[must_use]
    pub const fn wire_value(self) -> i32 {
        self as i32
    }

    fn slot(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0)
    }
}

impl TryFrom<i32> for CommandCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| c.wire_value() == value)
            .ok_or(ProtocolError::UnknownCommand(value))
    }
}

/// Packed duel command.
///
/// Size: 59 bytes
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct DuelPacket {
    record: MatchRecord,
    command: [u8; 4],
}

impl DuelPacket {
    /// Size in bytes.
    pub const SIZE: usize = MatchRecord::SIZE + 4;

    /// Packs a command.
    #[must_use]
    pub fn new(code: CommandCode, match_record: &Match) -> Self {
        Self {
            record: match_record.to_record(),
            command: code.wire_value().to_le_bytes(),
        }
    }

    /// Raw command value.
    #[must_use]
    pub const fn command(&self) -> i32 {
        i32::from_le_bytes(self.command)
    }

    /// Bytes as sent.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Parses a received payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PacketLength`] unless exactly
    /// [`Self::SIZE`] bytes are given.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(ProtocolError::PacketLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

/// A decoded inbound command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuelCommand {
    /// Radio address of the sender.
    pub sender: MacAddress,
    /// What the sender is saying.
    pub code: CommandCode,
    /// Match embedded in the packet.
    pub match_record: Match,
}

impl DuelCommand {
    /// Decodes a received payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PacketLength`] or
    /// [`ProtocolError::UnknownCommand`].
    pub fn decode(sender: MacAddress, bytes: &[u8]) -> ProtocolResult<Self> {
        let packet = DuelPacket::parse(bytes)?;
        let code = CommandCode::try_from(packet.command())?;
        Ok(Self {
            sender,
            code,
            match_record: Match::from_record(&packet.record),
        })
    }
}

/// Receiving end of the protocol's single listener slot.
#[derive(Debug)]
pub struct Listener {
    token: u64,
    rx: Receiver<DuelCommand>,
}

impl Listener {
    /// Identifies this registration for [`DuelProtocol::remove_listener`].
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.token
    }

    /// Takes every command delivered so far.
    pub fn drain(&self) -> Vec<DuelCommand> {
        self.rx.try_iter().collect()
    }
}

/// Protocol counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    /// Commands sent.
    pub commands_sent: u64,
    /// Commands decoded.
    pub commands_received: u64,
    /// Payloads rejected.
    pub commands_rejected: u64,
    /// Commands dropped for lack of a listener.
    pub commands_unheard: u64,
}

/// Duel command codec and listener registry on top of the transport.
pub struct DuelProtocol<R: Radio> {
    transport: PacketTransport<R>,
    inbound: Receiver<(MacAddress, Vec<u8>)>,
    listener: Option<(u64, Sender<DuelCommand>)>,
    next_token: u64,
    last_seen: [Option<DuelCommand>; CommandCode::ALL.len()],
    stats: ProtocolStats,
}

impl<R: Radio> DuelProtocol<R> {
    /// Wraps a new transport and claims its duel-command handler.
    #[must_use]
    pub fn new(radio: R, events: Receiver<RadioEvent>, config: TransportConfig) -> Self {
        let mut transport = PacketTransport::new(radio, events, config);
        let (tx, inbound) = crossbeam_channel::unbounded();
        transport.set_handler(
            PayloadType::QuickdrawCommand,
            Box::new(move |from, bytes| {
                // Receiver lives as long as the protocol that owns this handler.
                tx.send((from, bytes.to_vec())).ok();
            }),
        );

        Self {
            transport,
            inbound,
            listener: None,
            next_token: 0,
            last_seen: std::array::from_fn(|_| None),
            stats: ProtocolStats::default(),
        }
    }

    /// Sends `code` with `match_record` to `dest`. An unspecified address
    /// falls back to broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Transport`] if the transport refuses it.
    pub fn broadcast(&mut self, dest: MacAddress, code: CommandCode, match_record: &Match) -> ProtocolResult<()> {
        let dest = if dest.is_unspecified() { MacAddress::BROADCAST } else { dest };
        let packet = DuelPacket::new(code, match_record);
        self.transport
            .send(dest, PayloadType::QuickdrawCommand, packet.as_bytes())?;
        self.stats.commands_sent += 1;
        debug!("sent {:?} for match {} to {}", code, match_record.match_id(), dest);
        Ok(())
    }

    /// Decodes a received payload and hands it to the listener, if any.
    ///
    /// # Errors
    ///
    /// Returns why the payload was rejected. The listener is not invoked.
    pub fn on_received(&mut self, from: MacAddress, bytes: &[u8]) -> ProtocolResult<()> {
        let command = match DuelCommand::decode(from, bytes) {
            Ok(command) => command,
            Err(err) => {
                self.stats.commands_rejected += 1;
                return Err(err);
            }
        };
        self.stats.commands_received += 1;
        trace!("received {:?} from {}", command.code, from);
        self.last_seen[command.code.slot()] = Some(command.clone());

        let delivered = match &self.listener {
            Some((_, tx)) => tx.send(command).is_ok(),
            None => false,
        };
        if !delivered {
            self.stats.commands_unheard += 1;
            debug!("no listener, dropped command from {}", from);
        }
        Ok(())
    }

    /// Drains the transport and routes completed commands to the listener.
    pub fn poll(&mut self, now_ms: u64) {
        self.transport.poll(now_ms);
        while let Ok((from, bytes)) = self.inbound.try_recv() {
            if let Err(err) = self.on_received(from, &bytes) {
                warn!("rejected duel packet from {}: {}", from, err);
            }
        }
    }

    /// Claims the listener slot, disconnecting any previous holder.
    pub fn install_listener(&mut self) -> Listener {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.next_token += 1;
        let token = self.next_token;
        if let Some((previous, _)) = self.listener.replace((token, tx)) {
            debug!("listener {} replaced by {}", previous, token);
        }
        Listener { token, rx }
    }

    /// Releases the listener slot if `token` still owns it.
    pub fn remove_listener(&mut self, token: u64) -> bool {
        match &self.listener {
            Some((owner, _)) if *owner == token => {
                self.listener = None;
                true
            }
            _ => false,
        }
    }

    /// True while some state is listening.
    #[must_use]
    pub const fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Most recent command received with `code`.
    #[must_use]
    pub fn last_command(&self, code: CommandCode) -> Option<&DuelCommand> {
        self.last_seen[code.slot()].as_ref()
    }

    /// Forgets every remembered command.
    pub fn clear_command_log(&mut self) {
        self.last_seen = std::array::from_fn(|_| None);
    }

    /// Returns statistics.
    #[must_use]
    pub const fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &PacketTransport<R> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use quickdraw_transport::{LinkConditions, SimulatedAir, SimulatedRadio};

    use super::*;
    use crate::match_record::Role;

    const ID: &str = "5a6b7c8d-9e0f-4a1b-8c2d-3e4f5a6b7c8d";
    const A: MacAddress = MacAddress([0x10, 0, 0, 0, 0, 1]);
    const B: MacAddress = MacAddress([0x20, 0, 0, 0, 0, 2]);

    fn pair() -> (DuelProtocol<SimulatedRadio>, DuelProtocol<SimulatedRadio>) {
        let air = SimulatedAir::new(1, LinkConditions::PERFECT);
        let (ra, ea) = air.attach(A);
        let (rb, eb) = air.attach(B);
        (
            DuelProtocol::new(ra, ea, TransportConfig::default()),
            DuelProtocol::new(rb, eb, TransportConfig::default()),
        )
    }

    fn sample() -> Match {
        let mut m = Match::new(ID, "h001", "b002");
        m.set_draw_time_ms(Role::Hunter, 187);
        m
    }

    #[test]
    fn test_packet_size() {
        assert_eq!(std::mem::size_of::<DuelPacket>(), DuelPacket::SIZE);
        assert_eq!(DuelPacket::SIZE, 59);
    }

    #[test]
    fn test_packet_layout() {
        let packet = DuelPacket::new(CommandCode::DrawResult, &sample());
        let bytes = packet.as_bytes();
        assert_eq!(&bytes[..36], ID.as_bytes());
        assert_eq!(&bytes[47..51], &187u32.to_le_bytes());
        assert_eq!(&bytes[55..59], &12i32.to_le_bytes());
    }

    #[test]
    fn test_wrong_length_rejected_without_callback() {
        let (mut a, _b) = pair();
        let listener = a.install_listener();
        let packet = DuelPacket::new(CommandCode::DrawResult, &sample());

        let err = a.on_received(B, &packet.as_bytes()[..58]).unwrap_err();
        assert_eq!(err, ProtocolError::PacketLength { expected: 59, actual: 58 });
        assert!(listener.drain().is_empty());
        assert_eq!(a.stats().commands_rejected, 1);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (mut a, _b) = pair();
        let mut bytes = DuelPacket::new(CommandCode::DrawResult, &sample()).as_bytes().to_vec();
        bytes[55..59].copy_from_slice(&2i32.to_le_bytes());
        assert_eq!(a.on_received(B, &bytes), Err(ProtocolError::UnknownCommand(2)));
    }

    #[test]
    fn test_round_trip_over_air() {
        let (mut a, mut b) = pair();
        let listener = b.install_listener();

        a.broadcast(B, CommandCode::DrawResult, &sample()).unwrap();
        a.poll(0);
        b.poll(0);

        let received = listener.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, A);
        assert_eq!(received[0].code, CommandCode::DrawResult);
        assert_eq!(received[0].match_record, sample());
        assert_eq!(b.last_command(CommandCode::DrawResult).unwrap().sender, A);
    }

    #[test]
    fn test_unspecified_destination_broadcasts() {
        let (mut a, mut b) = pair();
        let listener = b.install_listener();
        a.broadcast(MacAddress::UNSPECIFIED, CommandCode::HunterReady, &sample()).unwrap();
        b.poll(0);
        assert_eq!(listener.drain().len(), 1);
        assert!(a.transport().peers().is_empty());
    }

    #[test]
    fn test_single_listener_slot() {
        let (mut a, _b) = pair();
        let first = a.install_listener();
        let second = a.install_listener();
        let bytes = DuelPacket::new(CommandCode::HunterReady, &sample()).as_bytes().to_vec();

        a.on_received(B, &bytes).unwrap();
        assert!(first.drain().is_empty());
        assert_eq!(second.drain().len(), 1);

        // The stale token cannot release the current registration.
        assert!(!a.remove_listener(first.token()));
        assert!(a.remove_listener(second.token()));
        assert!(!a.has_listener());
    }

    #[test]
    fn test_command_without_listener_is_dropped() {
        let (mut a, _b) = pair();
        let bytes = DuelPacket::new(CommandCode::NeverPressed, &sample()).as_bytes().to_vec();
        a.on_received(B, &bytes).unwrap();
        assert_eq!(a.stats().commands_unheard, 1);

        a.clear_command_log();
        assert!(a.last_command(CommandCode::NeverPressed).is_none());
    }
}
