//! # Peer Table
//!
//! Bounded table of known radio addresses.
//!
//! ## Design
//!
//! - Fixed capacity matching the radio's peer registry ceiling
//! - Least-recently-used eviction when a new address needs a slot
//! - One in-flight reassembly buffer per source address
//! - The broadcast address never occupies a slot
//!
//! Entries are created on first contact in either direction. An entry is
//! only registered with the radio once something is unicast to it, so the
//! transport tracks that separately in [`PeerEntry::is_registered`].

use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::frame::{FrameHeader, MacAddress, PayloadType};
use crate::MAX_FRAGMENT_PAYLOAD;

/// Partially received cluster from one source.
#[derive(Debug)]
struct Reassembly {
    buffer: Vec<u8>,
    expected_index: u8,
    fragment_count: u8,
    payload_type: PayloadType,
    last_activity_ms: u64,
}

/// One known radio address.
#[derive(Debug)]
pub struct PeerEntry {
    addr: MacAddress,
    registered: bool,
    last_used: u64,
    reassembly: Option<Reassembly>,
}

impl PeerEntry {
    fn new(addr: MacAddress, stamp: u64) -> Self {
        Self {
            addr,
            registered: false,
            last_used: stamp,
            reassembly: None,
        }
    }

    /// Radio address of this peer.
    #[inline]
    #[must_use]
    pub const fn addr(&self) -> MacAddress {
        self.addr
    }

    /// Whether the radio driver knows this address as a peer.
    #[inline]
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.registered
    }

    /// Marks the entry as registered with the radio.
    #[inline]
    pub fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    /// True while a cluster from this peer is partially received.
    #[inline]
    #[must_use]
    pub const fn is_reassembling(&self) -> bool {
        self.reassembly.is_some()
    }

    /// Next fragment index the reassembly buffer is waiting for.
    #[must_use]
    pub fn expected_fragment(&self) -> Option<u8> {
        self.reassembly.as_ref().map(|r| r.expected_index)
    }

    /// Frees the reassembly buffer if it has been idle longer than `timeout_ms`.
    pub fn expire_reassembly(&mut self, now_ms: u64, timeout_ms: u64) -> bool {
        let stale = self
            .reassembly
            .as_ref()
            .is_some_and(|r| now_ms.saturating_sub(r.last_activity_ms) > timeout_ms);
        if stale {
            self.reassembly = None;
        }
        stale
    }

    /// Feeds one received fragment into this peer's reassembly buffer.
    ///
    /// Returns the complete payload when the final fragment lands.
    ///
    /// # Errors
    ///
    /// - [`TransportError::SequenceViolation`] if the index is not the one
    ///   expected next; the partial message is discarded.
    /// - [`TransportError::OrphanFragment`] for a mid-cluster fragment with
    ///   no buffer.
    /// - [`TransportError::AllocationFailure`] if a fresh buffer cannot be
    ///   reserved.
    pub fn accept_fragment(
        &mut self,
        header: &FrameHeader,
        payload_type: PayloadType,
        payload: &[u8],
        now_ms: u64,
    ) -> TransportResult<Option<Vec<u8>>> {
        if header.fragment_index == 0 {
            if self.reassembly.take().is_some() {
                debug!("discarding stale partial cluster from {}", self.addr);
            }

            if header.fragment_count == 1 {
                return Ok(Some(payload.to_vec()));
            }

            let needed = usize::from(header.fragment_count) * MAX_FRAGMENT_PAYLOAD;
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(needed)
                .map_err(|_| TransportError::AllocationFailure {
                    needed_frames: usize::from(header.fragment_count),
                })?;

            self.reassembly = Some(Reassembly {
                buffer,
                expected_index: 0,
                fragment_count: header.fragment_count,
                payload_type,
                last_activity_ms: now_ms,
            });
        }

        let Some(reassembly) = self.reassembly.as_mut() else {
            return Err(TransportError::OrphanFragment {
                peer: self.addr,
                index: header.fragment_index,
            });
        };

        let in_sequence = header.fragment_index == reassembly.expected_index
            && header.fragment_count == reassembly.fragment_count
            && payload_type == reassembly.payload_type;

        if !in_sequence {
            let expected = reassembly.expected_index;
            self.reassembly = None;
            warn!(
                "fragment {} from {} out of sequence (expected {}), message dropped",
                header.fragment_index, self.addr, expected
            );
            return Err(TransportError::SequenceViolation {
                peer: self.addr,
                expected,
                received: header.fragment_index,
            });
        }

        reassembly.buffer.extend_from_slice(payload);
        reassembly.expected_index = reassembly.expected_index.wrapping_add(1);
        reassembly.last_activity_ms = now_ms;

        if reassembly.expected_index == reassembly.fragment_count {
            return Ok(self.reassembly.take().map(|r| r.buffer));
        }

        Ok(None)
    }
}

/// Bounded LRU table of peers.
#[derive(Debug)]
pub struct PeerTable {
    entries: Vec<PeerEntry>,
    capacity: usize,
    stamp: u64,
}

impl PeerTable {
    /// Creates an empty table. A capacity of zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            stamp: 0,
        }
    }

    /// Maximum number of entries.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no peers are known.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `addr` has an entry.
    #[must_use]
    pub fn contains(&self, addr: MacAddress) -> bool {
        self.position(addr).is_some()
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, addr: MacAddress) -> Option<&PeerEntry> {
        self.entries.iter().find(|e| e.addr == addr)
    }

    /// Iterates entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.entries.iter()
    }

    /// Iterates entries mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerEntry> {
        self.entries.iter_mut()
    }

    /// Marks `addr` as most recently used, inserting it if unknown.
    ///
    /// Returns the entry's slot and, when the table was full, the entry
    /// that was evicted to make room. Broadcast is never stored; it yields
    /// `None`.
    pub fn touch_or_insert(&mut self, addr: MacAddress) -> Option<(usize, Option<PeerEntry>)> {
        self.touch_or_insert_sparing(addr, |_| false)
    }

    /// Like [`Self::touch_or_insert`], but never evicts an entry for which
    /// `spare` returns true. Yields `None` when the table is full and every
    /// entry is spared.
    pub fn touch_or_insert_sparing(
        &mut self,
        addr: MacAddress,
        spare: impl Fn(&PeerEntry) -> bool,
    ) -> Option<(usize, Option<PeerEntry>)> {
        if addr.is_broadcast() {
            return None;
        }

        if let Some(slot) = self.position(addr) {
            self.stamp += 1;
            self.entries[slot].last_used = self.stamp;
            return Some((slot, None));
        }

        if self.entries.len() < self.capacity {
            self.stamp += 1;
            self.entries.push(PeerEntry::new(addr, self.stamp));
            return Some((self.entries.len() - 1, None));
        }

        let victim = self.least_recently_used(spare)?;
        self.stamp += 1;
        let stamp = self.stamp;
        let evicted = std::mem::replace(&mut self.entries[victim], PeerEntry::new(addr, stamp));
        debug!("peer table full, evicted {} for {}", evicted.addr, addr);
        Some((victim, Some(evicted)))
    }

    /// Entry at a slot returned by [`Self::touch_or_insert`].
    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut PeerEntry> {
        self.entries.get_mut(slot)
    }

    /// Removes an entry.
    pub fn remove(&mut self, addr: MacAddress) -> Option<PeerEntry> {
        let slot = self.position(addr)?;
        Some(self.entries.swap_remove(slot))
    }

    fn position(&self, addr: MacAddress) -> Option<usize> {
        self.entries.iter().position(|e| e.addr == addr)
    }

    fn least_recently_used(&self, spare: impl Fn(&PeerEntry) -> bool) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !spare(*e))
            .min_by_key(|(_, e)| e.last_used)
            .map(|(slot, _)| slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0x24, 0x6F, 0, 0, 0, n])
    }

    fn header(index: u8, count: u8, len: usize) -> FrameHeader {
        FrameHeader::new(index, count, len as u16, PayloadType::Debug)
    }

    #[test]
    fn test_table_never_exceeds_capacity() {
        let mut table = PeerTable::with_capacity(3);
        for n in 0..10 {
            table.touch_or_insert(mac(n));
            assert!(table.len() <= 3);
        }
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_lru_eviction_picks_oldest() {
        let mut table = PeerTable::with_capacity(3);
        table.touch_or_insert(mac(1));
        table.touch_or_insert(mac(2));
        table.touch_or_insert(mac(3));
        // Refresh 1 so 2 becomes the oldest.
        table.touch_or_insert(mac(1));

        let (_, evicted) = table.touch_or_insert(mac(4)).unwrap();
        assert_eq!(evicted.unwrap().addr(), mac(2));
        assert!(table.contains(mac(1)));
        assert!(table.contains(mac(3)));
        assert!(table.contains(mac(4)));
        assert!(!table.contains(mac(2)));
    }

    #[test]
    fn test_one_past_capacity_evicts_exactly_one() {
        let mut table = PeerTable::with_capacity(20);
        for n in 0..20 {
            let (_, evicted) = table.touch_or_insert(mac(n)).unwrap();
            assert!(evicted.is_none());
        }
        let (_, evicted) = table.touch_or_insert(mac(20)).unwrap();
        assert_eq!(evicted.map(|e| e.addr()), Some(mac(0)));
        assert_eq!(table.len(), 20);
    }

    #[test]
    fn test_broadcast_never_stored() {
        let mut table = PeerTable::with_capacity(2);
        assert!(table.touch_or_insert(MacAddress::BROADCAST).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_spared_entries_survive_eviction() {
        let mut table = PeerTable::with_capacity(3);
        for n in 1..=3 {
            table.touch_or_insert(mac(n));
        }

        // mac(1) is the oldest but spared, so mac(2) goes instead.
        let (_, evicted) = table.touch_or_insert_sparing(mac(4), |e| e.addr() == mac(1)).unwrap();
        assert_eq!(evicted.unwrap().addr(), mac(2));
        assert!(table.contains(mac(1)));

        // Nothing evictable: the newcomer is turned away.
        assert!(table.touch_or_insert_sparing(mac(5), |_| true).is_none());
        assert!(!table.contains(mac(5)));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_reassembly_in_order() {
        let mut entry = PeerEntry::new(mac(1), 0);
        assert_eq!(entry.accept_fragment(&header(0, 3, 2), PayloadType::Debug, &[1, 2], 0), Ok(None));
        assert_eq!(entry.expected_fragment(), Some(1));
        assert_eq!(entry.accept_fragment(&header(1, 3, 2), PayloadType::Debug, &[3, 4], 1), Ok(None));
        let done = entry
            .accept_fragment(&header(2, 3, 1), PayloadType::Debug, &[5], 2)
            .unwrap();
        assert_eq!(done, Some(vec![1, 2, 3, 4, 5]));
        assert!(!entry.is_reassembling());
    }

    #[test]
    fn test_sequence_violation_discards_buffer() {
        let mut entry = PeerEntry::new(mac(1), 0);
        entry.accept_fragment(&header(0, 3, 1), PayloadType::Debug, &[1], 0).unwrap();

        let err = entry
            .accept_fragment(&header(2, 3, 1), PayloadType::Debug, &[3], 1)
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::SequenceViolation { peer: mac(1), expected: 1, received: 2 }
        );
        assert!(!entry.is_reassembling());

        // Fragment 0 starts a fresh buffer.
        entry.accept_fragment(&header(0, 2, 1), PayloadType::Debug, &[7], 2).unwrap();
        let done = entry.accept_fragment(&header(1, 2, 1), PayloadType::Debug, &[8], 3).unwrap();
        assert_eq!(done, Some(vec![7, 8]));
    }

    #[test]
    fn test_fragment_zero_replaces_stale_buffer() {
        let mut entry = PeerEntry::new(mac(1), 0);
        entry.accept_fragment(&header(0, 3, 1), PayloadType::Debug, &[1], 0).unwrap();
        entry.accept_fragment(&header(1, 3, 1), PayloadType::Debug, &[2], 0).unwrap();

        // Final fragment lost; next message begins.
        let done = entry.accept_fragment(&header(0, 1, 2), PayloadType::Debug, &[9, 9], 5).unwrap();
        assert_eq!(done, Some(vec![9, 9]));
        assert!(!entry.is_reassembling());
    }

    #[test]
    fn test_orphan_fragment_rejected() {
        let mut entry = PeerEntry::new(mac(4), 0);
        let err = entry
            .accept_fragment(&header(1, 2, 1), PayloadType::Debug, &[1], 0)
            .unwrap_err();
        assert_eq!(err, TransportError::OrphanFragment { peer: mac(4), index: 1 });
    }

    #[test]
    fn test_reassembly_expiry() {
        let mut entry = PeerEntry::new(mac(1), 0);
        entry.accept_fragment(&header(0, 2, 1), PayloadType::Debug, &[1], 100).unwrap();
        assert!(!entry.expire_reassembly(1100, 1000));
        assert!(entry.expire_reassembly(1101, 1000));
        assert!(!entry.is_reassembling());
    }
}
