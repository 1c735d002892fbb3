//! Unguessable 64-bit identifiers and their invite-URL encoding.
//!
//! Players and conversations are both identified by a random 64-bit value
//! drawn from a cryptographic source. Knowing an ID is the only credential
//! the server requires, so the zero value is reserved as "no ID" and is
//! never handed out.
//!
//! An ID can be shared as an invite link. The link ends with 11 characters
//! of URL-safe base64 (`+` becomes `-`, `/` becomes `_`). No padding is
//! added because the length is fixed; the final character only carries the
//! low 4 bits of the ID, so its 6-bit value must be below 16:
//!
//! ```text
//! https://gemelo.org/j/yv7K_sr-yvO    <- 0xcafecafecafecafe
//! ```

use derive_more::Display;
use rand::{CryptoRng, Rng};

/// An identifier for a player or a conversation.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{:016x}", _0)]
pub struct Id(u64);

impl Id {
    /// Draws a fresh ID from `rng`.
    ///
    /// Only cryptographic generators are accepted; the ID is the sole
    /// credential protecting a session. Zero is reserved, so the draw is
    /// repeated on the (astronomically unlikely) all-zero result.
    pub fn fresh<R: Rng + CryptoRng + ?Sized>(rng: &mut R) -> Id {
        loop {
            let raw: u64 = rng.gen();
            if raw != 0 {
                return Id(raw);
            }
        }
    }

    /// Wraps a raw wire value, rejecting the reserved zero.
    pub fn from_raw(raw: u64) -> Option<Id> {
        (raw != 0).then_some(Id(raw))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

const BITS_PER_CHAR: u32 = 6;
const BITS_PER_ID: u32 = u64::BITS;
/// Number of bits carried by the final character.
const LAST_CHAR_BITS: u32 = BITS_PER_ID % BITS_PER_CHAR;
const FULL_CHARS: u32 = BITS_PER_ID / BITS_PER_CHAR;

/// Length of the base64 part of an invite URL.
pub const ID_PART_LEN: usize = (FULL_CHARS + 1) as usize;

const REST_URL: &str = "://gemelo.org/j/";
const URL_PREFIX: &str = "https://gemelo.org/j/";

fn encode_char(value: u64) -> char {
    match value {
        0..=25 => (b'A' + value as u8) as char,
        26..=51 => (b'a' + (value - 26) as u8) as char,
        52..=61 => (b'0' + (value - 52) as u8) as char,
        62 => '-',
        _ => '_',
    }
}

fn char_value(ch: u8) -> Option<u64> {
    match ch {
        b'A'..=b'Z' => Some((ch - b'A') as u64),
        b'a'..=b'z' => Some((ch - b'a') as u64 + 26),
        b'0'..=b'9' => Some((ch - b'0') as u64 + 52),
        b'-' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

/// Encodes `id` as the 11-character base64 tail of an invite URL.
pub fn encode_id_part(id: Id) -> String {
    let mut raw = id.as_raw();
    let mut out = String::with_capacity(ID_PART_LEN);

    for _ in 0..FULL_CHARS {
        out.push(encode_char(raw >> (BITS_PER_ID - BITS_PER_CHAR)));
        raw <<= BITS_PER_CHAR;
    }

    out.push(encode_char(raw >> (BITS_PER_ID - LAST_CHAR_BITS)));

    out
}

/// Decodes an 11-character ID part. The characters are case-sensitive and
/// nothing may follow them.
pub fn decode_id_part(part: &str) -> Option<Id> {
    let bytes = part.as_bytes();

    if bytes.len() != ID_PART_LEN {
        return None;
    }

    let mut raw = 0u64;

    for &ch in &bytes[..FULL_CHARS as usize] {
        raw = (raw << BITS_PER_CHAR) | char_value(ch)?;
    }

    let last = char_value(bytes[FULL_CHARS as usize])?;
    if last >= 1 << LAST_CHAR_BITS {
        return None;
    }
    raw = (raw << LAST_CHAR_BITS) | last;

    Id::from_raw(raw)
}

/// Builds the full invite URL for `id`.
pub fn encode_url(id: Id) -> String {
    let mut url = String::with_capacity(URL_PREFIX.len() + ID_PART_LEN);
    url.push_str(URL_PREFIX);
    url.push_str(&encode_id_part(id));
    url
}

fn strip_prefix_no_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Decodes an invite URL back into the ID it carries.
///
/// The scheme and host are matched case-insensitively and both `http` and
/// `https` are accepted. The ID part itself is strict: exactly 11 valid
/// characters, then the end of the string.
pub fn decode_url(url: &str) -> Option<Id> {
    let rest = strip_prefix_no_case(url, "http")?;

    // Allow HTTPS as well.
    let rest = match rest.as_bytes().first() {
        Some(b's') | Some(b'S') => &rest[1..],
        _ => rest,
    };

    let part = strip_prefix_no_case(rest, REST_URL)?;

    decode_id_part(part)
}
