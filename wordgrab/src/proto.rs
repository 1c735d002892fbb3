//! The binary message codec spoken inside WebSocket binary frames.
//!
//! Every message is a one-byte type followed by its payload. Integers are
//! little-endian; strings are nul-terminated UTF-8 with a per-field
//! maximum length. A message is only produced once its whole payload is
//! buffered: partial input never advances the cursor, so feeding the
//! decoder any prefix of a stream followed by the rest yields the same
//! messages as feeding it everything at once.

use crate::id::Id;
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// The protocol version a client must announce in NEW_PLAYER.
pub const PROTOCOL_VERSION: u8 = 2;

/// Bounds on string payload fields, in content bytes (the terminator is
/// not counted).
pub const MIN_LANGUAGE_LEN: usize = 2;
pub const MAX_LANGUAGE_LEN: usize = 7;
pub const MIN_NAME_LEN: usize = 1;
pub const MAX_NAME_LEN: usize = 256;
pub const MIN_TEXT_LEN: usize = 1;
pub const MAX_TEXT_LEN: usize = 1000;
pub const MIN_LETTER_LEN: usize = 1;
pub const MAX_LETTER_LEN: usize = 4;

/// Client-to-server message types.
mod c2s {
    pub const NEW_PLAYER: u8 = 0x80;
    pub const RECONNECT: u8 = 0x81;
    pub const KEEP_ALIVE: u8 = 0x82;
    pub const LEAVE: u8 = 0x83;
    pub const SHOUT: u8 = 0x84;
    pub const TURN: u8 = 0x85;
    pub const MOVE_TILE: u8 = 0x86;
    pub const SEND_MESSAGE: u8 = 0x87;
    pub const SET_TYPING: u8 = 0x88;
    pub const SET_N_TILES: u8 = 0x89;
    pub const SET_LANGUAGE: u8 = 0x8a;
    pub const NEW_PRIVATE_GAME: u8 = 0x8b;
    pub const JOIN_GAME: u8 = 0x8c;
}

/// Server-to-client message types.
mod s2c {
    pub const PLAYER_ID: u8 = 0x00;
    pub const MESSAGE: u8 = 0x01;
    pub const N_TILES: u8 = 0x02;
    pub const LANGUAGE: u8 = 0x03;
    pub const PLAYER_NAME: u8 = 0x04;
    pub const PLAYER_FLAGS: u8 = 0x05;
    pub const TILE: u8 = 0x06;
    pub const PLAYER_SHOUTED: u8 = 0x07;
    pub const SYNC: u8 = 0x08;
    pub const END: u8 = 0x09;
    pub const CONVERSATION_ID: u8 = 0x0a;
}

/// A malformed message. Any of these closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),

    #[error("string field unterminated or not valid UTF-8")]
    BadString,

    #[error("field value out of bounds")]
    OutOfBounds,

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
}

impl ProtoError {
    /// The WebSocket close code reported for this kind of wire error.
    pub fn close_code(self) -> u16 {
        match self {
            ProtoError::UnknownMessage(_) => 4001,
            ProtoError::BadString => 4002,
            ProtoError::OutOfBounds => 4003,
            ProtoError::BadVersion(_) => 4004,
        }
    }
}

enum DecodeError {
    /// Not enough input buffered yet; try again after the next read.
    Incomplete,
    Bad(ProtoError),
}

impl From<ProtoError> for DecodeError {
    fn from(e: ProtoError) -> DecodeError {
        DecodeError::Bad(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    NewPlayer { language: String, name: String },
    Reconnect { player_id: Id, next_event: u16 },
    KeepAlive,
    Leave,
    Shout,
    Turn,
    MoveTile { index: u8, x: i16, y: i16 },
    SendMessage { text: String },
    SetTyping { typing: bool },
    SetNTiles { n: u8 },
    SetLanguage { code: String },
    NewPrivateGame { language: String, name: String },
    JoinGame { conversation_id: Id, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    PlayerId {
        player_id: Id,
        conversation_id: Id,
        number: u8,
    },
    Message {
        seq: u16,
        number: u8,
        text: String,
    },
    NTiles {
        seq: u16,
        n: u8,
    },
    Language {
        seq: u16,
        code: String,
    },
    PlayerName {
        seq: u16,
        number: u8,
        name: String,
    },
    PlayerFlags {
        seq: u16,
        number: u8,
        flags: u8,
    },
    Tile {
        seq: u16,
        index: u8,
        x: i16,
        y: i16,
        letter: String,
        last_player: u8,
    },
    PlayerShouted {
        seq: u16,
        number: u8,
    },
    Sync {
        seq: u16,
    },
    End {
        seq: u16,
    },
    ConversationId {
        conversation_id: Id,
    },
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn id(&mut self) -> Result<Id, DecodeError> {
        Id::from_raw(self.u64()?).ok_or_else(|| ProtoError::OutOfBounds.into())
    }

    /// Reads a nul-terminated string of `min..=max` content bytes.
    ///
    /// Missing terminator is only an error once `max + 1` bytes are
    /// actually available; before that the message is just incomplete.
    fn string(&mut self, min: usize, max: usize) -> Result<String, DecodeError> {
        let avail = &self.buf[self.pos..];

        match avail.iter().take(max + 1).position(|&b| b == 0) {
            Some(len) => {
                if len < min {
                    return Err(ProtoError::OutOfBounds.into());
                }
                let s = std::str::from_utf8(&avail[..len])
                    .map_err(|_| ProtoError::BadString)?;
                self.pos += len + 1;
                Ok(s.to_owned())
            }
            None if avail.len() > max => Err(ProtoError::BadString.into()),
            None => Err(DecodeError::Incomplete),
        }
    }
}

fn finish<T>(result: Result<(T, usize), DecodeError>) -> Result<Option<(T, usize)>, ProtoError> {
    match result {
        Ok(decoded) => Ok(Some(decoded)),
        Err(DecodeError::Incomplete) => Ok(None),
        Err(DecodeError::Bad(e)) => Err(e),
    }
}

impl ClientMessage {
    /// Decodes one client message from the front of `buf`.
    ///
    /// Returns the message and the number of bytes it consumed, or `None`
    /// when more input is needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(ClientMessage, usize)>, ProtoError> {
        finish(Self::decode_inner(buf))
    }

    fn decode_inner(buf: &[u8]) -> Result<(ClientMessage, usize), DecodeError> {
        let mut r = Reader::new(buf);

        let message = match r.u8()? {
            c2s::NEW_PLAYER => {
                let version = r.u8()?;
                if version != PROTOCOL_VERSION {
                    return Err(ProtoError::BadVersion(version).into());
                }
                ClientMessage::NewPlayer {
                    language: r.string(MIN_LANGUAGE_LEN, MAX_LANGUAGE_LEN)?,
                    name: r.string(MIN_NAME_LEN, MAX_NAME_LEN)?,
                }
            }
            c2s::RECONNECT => ClientMessage::Reconnect {
                player_id: r.id()?,
                next_event: r.u16()?,
            },
            c2s::KEEP_ALIVE => ClientMessage::KeepAlive,
            c2s::LEAVE => ClientMessage::Leave,
            c2s::SHOUT => ClientMessage::Shout,
            c2s::TURN => ClientMessage::Turn,
            c2s::MOVE_TILE => ClientMessage::MoveTile {
                index: r.u8()?,
                x: r.i16()?,
                y: r.i16()?,
            },
            c2s::SEND_MESSAGE => ClientMessage::SendMessage {
                text: r.string(MIN_TEXT_LEN, MAX_TEXT_LEN)?,
            },
            c2s::SET_TYPING => ClientMessage::SetTyping {
                typing: r.u8()? != 0,
            },
            c2s::SET_N_TILES => ClientMessage::SetNTiles { n: r.u8()? },
            c2s::SET_LANGUAGE => ClientMessage::SetLanguage {
                code: r.string(MIN_LANGUAGE_LEN, MAX_LANGUAGE_LEN)?,
            },
            c2s::NEW_PRIVATE_GAME => {
                let version = r.u8()?;
                if version != PROTOCOL_VERSION {
                    return Err(ProtoError::BadVersion(version).into());
                }
                ClientMessage::NewPrivateGame {
                    language: r.string(MIN_LANGUAGE_LEN, MAX_LANGUAGE_LEN)?,
                    name: r.string(MIN_NAME_LEN, MAX_NAME_LEN)?,
                }
            }
            c2s::JOIN_GAME => ClientMessage::JoinGame {
                conversation_id: r.id()?,
                name: r.string(MIN_NAME_LEN, MAX_NAME_LEN)?,
            },
            other => return Err(ProtoError::UnknownMessage(other).into()),
        };

        Ok((message, r.pos))
    }

    /// Encodes the message as the peer would send it. The server itself
    /// never emits client messages; this is the other half of the codec
    /// for clients and tests.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            ClientMessage::NewPlayer { language, name } => {
                out.put_u8(c2s::NEW_PLAYER);
                out.put_u8(PROTOCOL_VERSION);
                put_string(out, language);
                put_string(out, name);
            }
            ClientMessage::Reconnect {
                player_id,
                next_event,
            } => {
                out.put_u8(c2s::RECONNECT);
                out.put_u64_le(player_id.as_raw());
                out.put_u16_le(*next_event);
            }
            ClientMessage::KeepAlive => out.put_u8(c2s::KEEP_ALIVE),
            ClientMessage::Leave => out.put_u8(c2s::LEAVE),
            ClientMessage::Shout => out.put_u8(c2s::SHOUT),
            ClientMessage::Turn => out.put_u8(c2s::TURN),
            ClientMessage::MoveTile { index, x, y } => {
                out.put_u8(c2s::MOVE_TILE);
                out.put_u8(*index);
                out.put_i16_le(*x);
                out.put_i16_le(*y);
            }
            ClientMessage::SendMessage { text } => {
                out.put_u8(c2s::SEND_MESSAGE);
                put_string(out, text);
            }
            ClientMessage::SetTyping { typing } => {
                out.put_u8(c2s::SET_TYPING);
                out.put_u8(*typing as u8);
            }
            ClientMessage::SetNTiles { n } => {
                out.put_u8(c2s::SET_N_TILES);
                out.put_u8(*n);
            }
            ClientMessage::SetLanguage { code } => {
                out.put_u8(c2s::SET_LANGUAGE);
                put_string(out, code);
            }
            ClientMessage::NewPrivateGame { language, name } => {
                out.put_u8(c2s::NEW_PRIVATE_GAME);
                out.put_u8(PROTOCOL_VERSION);
                put_string(out, language);
                put_string(out, name);
            }
            ClientMessage::JoinGame {
                conversation_id,
                name,
            } => {
                out.put_u8(c2s::JOIN_GAME);
                out.put_u64_le(conversation_id.as_raw());
                put_string(out, name);
            }
        }
    }
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

impl ServerMessage {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            ServerMessage::PlayerId {
                player_id,
                conversation_id,
                number,
            } => {
                out.put_u8(s2c::PLAYER_ID);
                out.put_u64_le(player_id.as_raw());
                out.put_u64_le(conversation_id.as_raw());
                out.put_u8(*number);
            }
            ServerMessage::Message { seq, number, text } => {
                out.put_u8(s2c::MESSAGE);
                out.put_u16_le(*seq);
                out.put_u8(*number);
                put_string(out, text);
            }
            ServerMessage::NTiles { seq, n } => {
                out.put_u8(s2c::N_TILES);
                out.put_u16_le(*seq);
                out.put_u8(*n);
            }
            ServerMessage::Language { seq, code } => {
                out.put_u8(s2c::LANGUAGE);
                out.put_u16_le(*seq);
                put_string(out, code);
            }
            ServerMessage::PlayerName { seq, number, name } => {
                out.put_u8(s2c::PLAYER_NAME);
                out.put_u16_le(*seq);
                out.put_u8(*number);
                put_string(out, name);
            }
            ServerMessage::PlayerFlags { seq, number, flags } => {
                out.put_u8(s2c::PLAYER_FLAGS);
                out.put_u16_le(*seq);
                out.put_u8(*number);
                out.put_u8(*flags);
            }
            ServerMessage::Tile {
                seq,
                index,
                x,
                y,
                letter,
                last_player,
            } => {
                out.put_u8(s2c::TILE);
                out.put_u16_le(*seq);
                out.put_u8(*index);
                out.put_i16_le(*x);
                out.put_i16_le(*y);
                put_string(out, letter);
                out.put_u8(*last_player);
            }
            ServerMessage::PlayerShouted { seq, number } => {
                out.put_u8(s2c::PLAYER_SHOUTED);
                out.put_u16_le(*seq);
                out.put_u8(*number);
            }
            ServerMessage::Sync { seq } => {
                out.put_u8(s2c::SYNC);
                out.put_u16_le(*seq);
            }
            ServerMessage::End { seq } => {
                out.put_u8(s2c::END);
                out.put_u16_le(*seq);
            }
            ServerMessage::ConversationId { conversation_id } => {
                out.put_u8(s2c::CONVERSATION_ID);
                out.put_u64_le(conversation_id.as_raw());
            }
        }
    }

    /// Decodes one server message, the inverse of
    /// [`encode`](Self::encode). The server never parses its own output;
    /// clients and the round-trip tests do.
    pub fn decode(buf: &[u8]) -> Result<Option<(ServerMessage, usize)>, ProtoError> {
        finish(Self::decode_inner(buf))
    }

    fn decode_inner(buf: &[u8]) -> Result<(ServerMessage, usize), DecodeError> {
        let mut r = Reader::new(buf);

        let message = match r.u8()? {
            s2c::PLAYER_ID => ServerMessage::PlayerId {
                player_id: r.id()?,
                conversation_id: r.id()?,
                number: r.u8()?,
            },
            s2c::MESSAGE => ServerMessage::Message {
                seq: r.u16()?,
                number: r.u8()?,
                text: r.string(MIN_TEXT_LEN, MAX_TEXT_LEN)?,
            },
            s2c::N_TILES => ServerMessage::NTiles {
                seq: r.u16()?,
                n: r.u8()?,
            },
            s2c::LANGUAGE => ServerMessage::Language {
                seq: r.u16()?,
                code: r.string(MIN_LANGUAGE_LEN, MAX_LANGUAGE_LEN)?,
            },
            s2c::PLAYER_NAME => ServerMessage::PlayerName {
                seq: r.u16()?,
                number: r.u8()?,
                name: r.string(MIN_NAME_LEN, MAX_NAME_LEN)?,
            },
            s2c::PLAYER_FLAGS => ServerMessage::PlayerFlags {
                seq: r.u16()?,
                number: r.u8()?,
                flags: r.u8()?,
            },
            s2c::TILE => ServerMessage::Tile {
                seq: r.u16()?,
                index: r.u8()?,
                x: r.i16()?,
                y: r.i16()?,
                letter: r.string(MIN_LETTER_LEN, MAX_LETTER_LEN)?,
                last_player: r.u8()?,
            },
            s2c::PLAYER_SHOUTED => ServerMessage::PlayerShouted {
                seq: r.u16()?,
                number: r.u8()?,
            },
            s2c::SYNC => ServerMessage::Sync { seq: r.u16()? },
            s2c::END => ServerMessage::End { seq: r.u16()? },
            s2c::CONVERSATION_ID => ServerMessage::ConversationId {
                conversation_id: r.id()?,
            },
            other => return Err(ProtoError::UnknownMessage(other).into()),
        };

        Ok((message, r.pos))
    }
}
