//! Player seats within a conversation.

use crate::id::Id;

/// Per-player state flags, broadcast to clients as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerFlags(u8);

impl PlayerFlags {
    pub const CONNECTED: u8 = 1 << 0;
    pub const TYPING: u8 = 1 << 1;
    pub const NEXT_TURN: u8 = 1 << 2;

    pub fn from_bits(bits: u8) -> PlayerFlags {
        PlayerFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// A seat in a conversation.
///
/// Seat numbers are handed out densely from zero and never change; the
/// player's position in the conversation's player table is its number.
#[derive(Debug)]
pub struct Player {
    /// The player's unguessable identity, used to reconnect.
    pub id: Id,

    /// Seat number within the owning conversation.
    pub number: u8,

    pub name: String,

    pub flags: PlayerFlags,

    /// Whether this player sent a turn command since the last shout. Used
    /// for the end-of-game vote; not visible on the wire.
    pub turned_since_shout: bool,

    /// Set once the player has left for good. A departed player keeps its
    /// seat (numbers are stable) but never rejoins the rotation and cannot
    /// reconnect.
    pub departed: bool,
}

impl Player {
    pub fn new(id: Id, number: u8, name: String, flags: PlayerFlags) -> Player {
        Player {
            id,
            number,
            name,
            flags,
            turned_since_shout: false,
            departed: false,
        }
    }

    /// A player counts for turn rotation and game-end votes only while it
    /// is connected and has not left.
    pub fn in_rotation(&self) -> bool {
        self.flags.contains(PlayerFlags::CONNECTED) && !self.departed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_round_trip() {
        let mut flags = PlayerFlags::default();
        assert_eq!(flags.bits(), 0);

        flags.set(PlayerFlags::CONNECTED);
        flags.set(PlayerFlags::NEXT_TURN);
        assert!(flags.contains(PlayerFlags::CONNECTED));
        assert!(!flags.contains(PlayerFlags::TYPING));
        assert_eq!(flags.bits(), 0b101);

        flags.clear(PlayerFlags::NEXT_TURN);
        assert_eq!(flags.bits(), 0b001);
    }
}
