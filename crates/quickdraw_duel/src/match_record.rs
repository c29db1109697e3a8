//! # Match Record
//!
//! One duel: a match id, the two role identifiers and the two draw times.
//!
//! ## Binary Layout
//!
//! The same 55 bytes are used on the wire (inside a duel packet) and in
//! storage:
//!
//! ```text
//! offset  size  field
//!      0    37  match_id             UUID text, NUL terminated
//!     37     5  hunter_id            4 chars, NUL terminated
//!     42     5  bounty_id            4 chars, NUL terminated
//!     47     4  hunter_draw_time_ms  u32 LE, 0 = not recorded
//!     51     4  bounty_draw_time_ms  u32 LE, 0 = not recorded
//! ```

use bytemuck::{Pod, Zeroable};
use rand::RngCore;

/// Characters in a UUID string.
pub const MATCH_ID_LEN: usize = 36;

/// Characters in a role identifier.
pub const PLAYER_ID_LEN: usize = 4;

/// Which side of the duel a device plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Starts the handshake by waiting for the bounty; draws with the
    /// primary button.
    Hunter,
    /// Confirms the connection and creates the match; draws with the
    /// secondary button.
    Bounty,
}

impl Role {
    /// The other side.
    #[inline]
    #[must_use]
    pub const fn opponent(self) -> Self {
        match self {
            Self::Hunter => Self::Bounty,
            Self::Bounty => Self::Hunter,
        }
    }
}

/// Packed match, as stored and sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MatchRecord {
    match_id: [u8; MATCH_ID_LEN + 1],
    hunter_id: [u8; PLAYER_ID_LEN + 1],
    bounty_id: [u8; PLAYER_ID_LEN + 1],
    hunter_draw_time_ms: [u8; 4],
    bounty_draw_time_ms: [u8; 4],
}

impl MatchRecord {
    /// Size in bytes.
    pub const SIZE: usize = 55;
}

/// One duel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Match {
    match_id: String,
    hunter_id: String,
    bounty_id: String,
    hunter_draw_time_ms: u32,
    bounty_draw_time_ms: u32,
}

impl Match {
    /// Creates a match with no draw times recorded. Identifiers longer than
    /// their fixed fields are truncated.
    #[must_use]
    pub fn new(match_id: &str, hunter_id: &str, bounty_id: &str) -> Self {
        Self {
            match_id: truncate(match_id, MATCH_ID_LEN),
            hunter_id: truncate(hunter_id, PLAYER_ID_LEN),
            bounty_id: truncate(bounty_id, PLAYER_ID_LEN),
            hunter_draw_time_ms: 0,
            bounty_draw_time_ms: 0,
        }
    }

    /// Generates a random (version 4) match id.
    #[must_use]
    pub fn generate_id(rng: &mut impl RngCore) -> String {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
    }

    /// Match id.
    #[must_use]
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    /// Hunter's identifier.
    #[must_use]
    pub fn hunter_id(&self) -> &str {
        &self.hunter_id
    }

    /// Bounty's identifier.
    #[must_use]
    pub fn bounty_id(&self) -> &str {
        &self.bounty_id
    }

    /// Identifier of the player in `role`.
    #[must_use]
    pub fn player_id(&self, role: Role) -> &str {
        match role {
            Role::Hunter => &self.hunter_id,
            Role::Bounty => &self.bounty_id,
        }
    }

    /// Hunter's draw time, 0 if not recorded.
    #[must_use]
    pub const fn hunter_draw_time_ms(&self) -> u32 {
        self.hunter_draw_time_ms
    }

    /// Bounty's draw time, 0 if not recorded.
    #[must_use]
    pub const fn bounty_draw_time_ms(&self) -> u32 {
        self.bounty_draw_time_ms
    }

    /// Draw time of the player in `role`.
    #[must_use]
    pub const fn draw_time_ms(&self, role: Role) -> u32 {
        match role {
            Role::Hunter => self.hunter_draw_time_ms,
            Role::Bounty => self.bounty_draw_time_ms,
        }
    }

    /// Records a draw time. A measured 0 is stored as 1 so it can never be
    /// mistaken for "not recorded".
    pub fn set_draw_time_ms(&mut self, role: Role, ms: u32) {
        let ms = ms.max(1);
        match role {
            Role::Hunter => self.hunter_draw_time_ms = ms,
            Role::Bounty => self.bounty_draw_time_ms = ms,
        }
    }

    /// Fills in the hunter's identifier on a bounty-side placeholder.
    pub(crate) fn set_hunter_id(&mut self, hunter_id: &str) {
        self.hunter_id = truncate(hunter_id, PLAYER_ID_LEN);
    }

    /// Packs into the fixed binary layout.
    #[must_use]
    pub fn to_record(&self) -> MatchRecord {
        MatchRecord {
            match_id: pack_str(&self.match_id),
            hunter_id: pack_str(&self.hunter_id),
            bounty_id: pack_str(&self.bounty_id),
            hunter_draw_time_ms: self.hunter_draw_time_ms.to_le_bytes(),
            bounty_draw_time_ms: self.bounty_draw_time_ms.to_le_bytes(),
        }
    }

    /// Unpacks from the fixed binary layout.
    #[must_use]
    pub fn from_record(record: &MatchRecord) -> Self {
        Self {
            match_id: unpack_str(&record.match_id),
            hunter_id: unpack_str(&record.hunter_id),
            bounty_id: unpack_str(&record.bounty_id),
            hunter_draw_time_ms: u32::from_le_bytes(record.hunter_draw_time_ms),
            bounty_draw_time_ms: u32::from_le_bytes(record.bounty_draw_time_ms),
        }
    }

    /// Binary form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MatchRecord::SIZE] {
        bytemuck::cast(self.to_record())
    }

    /// Parses the binary form. Returns `None` unless exactly
    /// [`MatchRecord::SIZE`] bytes are given.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MatchRecord::SIZE {
            return None;
        }
        let record: MatchRecord = bytemuck::pod_read_unaligned(bytes);
        Some(Self::from_record(&record))
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Copies `s` into a NUL-terminated fixed field, truncating on a char
/// boundary if needed.
fn pack_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut len = s.len().min(N - 1);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

fn unpack_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    const ID: &str = "3f2c5d1e-8a4b-4c6d-9e7f-0a1b2c3d4e5f";

    #[test]
    fn test_record_size() {
        assert_eq!(std::mem::size_of::<MatchRecord>(), MatchRecord::SIZE);
    }

    #[test]
    fn test_binary_layout() {
        let mut m = Match::new(ID, "h001", "b002");
        m.set_draw_time_ms(Role::Hunter, 0x0102);
        let bytes = m.to_bytes();

        assert_eq!(&bytes[..36], ID.as_bytes());
        assert_eq!(bytes[36], 0);
        assert_eq!(&bytes[37..42], b"h001\0");
        assert_eq!(&bytes[42..47], b"b002\0");
        assert_eq!(&bytes[47..51], &[0x02, 0x01, 0, 0]);
        assert_eq!(&bytes[51..55], &[0, 0, 0, 0]);
        assert_eq!(Match::from_bytes(&bytes).unwrap(), m);
    }

    #[test]
    fn test_from_bytes_requires_exact_length() {
        let bytes = Match::new(ID, "h001", "b002").to_bytes();
        assert!(Match::from_bytes(&bytes[..54]).is_none());
    }

    #[test]
    fn test_long_ids_truncated() {
        let m = Match::new(ID, "hunter", "bounty");
        assert_eq!(m.hunter_id(), "hunt");
        assert_eq!(m.bounty_id(), "boun");
    }

    #[test]
    fn test_zero_draw_time_guarded() {
        let mut m = Match::new(ID, "h001", "b002");
        m.set_draw_time_ms(Role::Bounty, 0);
        assert_eq!(m.bounty_draw_time_ms(), 1);
        assert_eq!(m.draw_time_ms(Role::Hunter), 0);
    }

    #[test]
    fn test_generated_ids_are_uuids() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let a = Match::generate_id(&mut rng);
        let b = Match::generate_id(&mut rng);
        assert_eq!(a.len(), MATCH_ID_LEN);
        assert_ne!(a, b);
        assert_eq!(uuid::Uuid::parse_str(&a).unwrap().get_version_num(), 4);
    }
}
