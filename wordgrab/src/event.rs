//! The conversation event log.
//!
//! Every successful mutating operation on a conversation appends one or
//! more events here. The log is the single source of truth for what a
//! connection still has to send: each connection keeps a cursor and drains
//! events in order, so all attached clients observe the same history.
//!
//! The log is a bounded ring. When it fills up, the whole backlog is
//! replaced by a single snapshot event that is sufficient on its own to
//! rebuild client state, and sequence numbers keep counting past it.

use crate::letters::Language;
use crate::player::PlayerFlags;
use crate::tile::Tile;
use std::collections::VecDeque;

/// How many events a conversation retains before compacting.
pub const LOG_CAPACITY: usize = 1024;

/// Version byte of the [`Snapshot`] format.
pub const SNAPSHOT_FORMAT: u8 = 1;

/// One entry in a conversation's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A player took a seat. Carries the name announcement for the new
    /// seat.
    PlayerAdded { number: u8, name: String },

    /// A seat's flags changed.
    PlayerFlags { number: u8, flags: PlayerFlags },

    /// A tile appeared on the table or moved.
    TileChanged {
        index: u8,
        x: i16,
        y: i16,
        letter: &'static str,
        last_player: u8,
    },

    /// A player shouted.
    Shout { number: u8 },

    /// A chat message.
    Message { number: u8, text: String },

    /// Compaction baseline carrying a full state dump.
    Sync { snapshot: Snapshot },

    /// The game is over.
    End,

    /// The tile count for the game changed.
    NTiles { n: u8 },

    /// The conversation language changed.
    Language { language: Language },
}

/// A full dump of conversation state, standing in for every event that
/// was dropped by compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Format version of this dump. Bumped if fields change meaning.
    pub format: u8,

    pub language: Language,
    pub n_tile_targets: u8,
    pub finished: bool,
    pub players: Vec<SnapshotPlayer>,

    /// Tiles currently on the table, in index order. Bagged tiles are not
    /// part of the dump; clients only ever see drawn tiles.
    pub tiles: Vec<Tile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPlayer {
    pub number: u8,
    pub name: String,
    pub flags: PlayerFlags,
}

/// Outcome of looking up a sequence number in the log.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The event is still in the ring.
    Event(&'a Event),

    /// The sequence number predates the ring baseline; the reader must
    /// catch up from the baseline instead.
    Compacted,

    /// The sequence number has not been assigned yet.
    NotYet,
}

pub struct EventLog {
    events: VecDeque<Event>,
    base_seq: u64,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> EventLog {
        assert!(capacity >= 2, "log must hold a snapshot plus one event");
        EventLog {
            events: VecDeque::with_capacity(capacity),
            base_seq: 0,
            capacity,
        }
    }

    /// Sequence number of the oldest retained event.
    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Sequence number the next appended event will receive.
    pub fn next_seq(&self) -> u64 {
        self.base_seq + self.events.len() as u64
    }

    /// True when the next append must be preceded by compaction.
    pub fn is_full(&self) -> bool {
        self.events.len() == self.capacity
    }

    /// Appends `event`, returning its sequence number. The caller is
    /// responsible for compacting first when [`is_full`](Self::is_full).
    pub fn push(&mut self, event: Event) -> u64 {
        debug_assert!(!self.is_full());
        let seq = self.next_seq();
        self.events.push_back(event);
        seq
    }

    /// Replaces the whole backlog with `snapshot`, which becomes the new
    /// baseline and takes the next sequence number.
    pub fn compact(&mut self, snapshot: Snapshot) -> u64 {
        let seq = self.next_seq();
        self.events.clear();
        self.base_seq = seq;
        self.events.push_back(Event::Sync { snapshot });
        seq
    }

    pub fn get(&self, seq: u64) -> Lookup<'_> {
        if seq < self.base_seq {
            Lookup::Compacted
        } else {
            match self.events.get((seq - self.base_seq) as usize) {
                Some(event) => Lookup::Event(event),
                None => Lookup::NotYet,
            }
        }
    }

    /// Resolves the truncated 16-bit sequence number a reconnecting client
    /// sends into a full sequence number.
    ///
    /// If exactly one retained sequence number has the requested low 16
    /// bits, catch-up starts there; anything else (dropped from the ring,
    /// ambiguous after wrap, or in the future) falls back to the baseline
    /// so the client resynchronizes from the oldest retained event.
    pub fn resolve_wire_seq(&self, want: u16) -> u64 {
        let mut found = None;

        for seq in self.base_seq..self.next_seq() {
            if seq as u16 == want {
                if found.is_some() {
                    return self.base_seq;
                }
                found = Some(seq);
            }
        }

        found.unwrap_or(self.base_seq)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_event(number: u8) -> Event {
        Event::PlayerFlags {
            number,
            flags: PlayerFlags::from_bits(PlayerFlags::CONNECTED),
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            format: SNAPSHOT_FORMAT,
            language: Language::Esperanto,
            n_tile_targets: 50,
            finished: false,
            players: vec![],
            tiles: vec![],
        }
    }

    #[test]
    fn sequence_numbers_are_dense() {
        let mut log = EventLog::with_capacity(8);

        for i in 0..5 {
            assert_eq!(log.push(flags_event(i)), i as u64);
        }

        assert_eq!(log.base_seq(), 0);
        assert_eq!(log.next_seq(), 5);
        assert!(matches!(log.get(0), Lookup::Event(_)));
        assert!(matches!(log.get(4), Lookup::Event(_)));
        assert_eq!(log.get(5), Lookup::NotYet);
    }

    #[test]
    fn compaction_moves_the_baseline() {
        let mut log = EventLog::with_capacity(4);

        for i in 0..4 {
            log.push(flags_event(i));
        }
        assert!(log.is_full());

        let seq = log.compact(snapshot());
        assert_eq!(seq, 4);
        assert_eq!(log.base_seq(), 4);
        assert_eq!(log.next_seq(), 5);

        assert_eq!(log.get(3), Lookup::Compacted);
        assert!(matches!(log.get(4), Lookup::Event(Event::Sync { .. })));

        // The log keeps counting past the snapshot.
        assert_eq!(log.push(flags_event(9)), 5);
        assert!(matches!(log.get(5), Lookup::Event(Event::PlayerFlags { .. })));
    }

    #[test]
    fn wire_seq_resolution() {
        let mut log = EventLog::with_capacity(8);
        for i in 0..6 {
            log.push(flags_event(i));
        }

        assert_eq!(log.resolve_wire_seq(3), 3);
        // Not retained any more (or not yet): fall back to the baseline.
        assert_eq!(log.resolve_wire_seq(100), 0);

        let mut log = EventLog::with_capacity(4);
        for i in 0..4 {
            log.push(flags_event(i));
        }
        log.compact(snapshot());
        log.push(flags_event(9));

        // Seqs 0..=3 are gone; 4 is the snapshot baseline, 5 is live.
        assert_eq!(log.resolve_wire_seq(5), 5);
        assert_eq!(log.resolve_wire_seq(2), 4);
    }
}
