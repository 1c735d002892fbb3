//! The game core of the wordgrab server.
//!
//! Everything in this crate is transport-free: conversations, players,
//! tiles, the event log and the wire codec are plain data structures the
//! server drives from its reactor thread. Clocks and randomness are passed
//! in by the caller so the whole crate can be tested deterministically.

// Re-export any crates that we also want to use on the server side. This has the
// dual benefits of making it so that we don't need to declare the dependency twice,
// and ensuring that both crates use the same versions of any shared dependencies.
pub use bytes;
pub use rand;

pub mod conversation;
pub mod event;
pub mod id;
pub mod id_map;
pub mod letters;
pub mod player;
pub mod proto;
pub mod tile;
