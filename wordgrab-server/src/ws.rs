//! Server-side WebSocket handshake and framing.
//!
//! Only the slice of RFC 6455 the game protocol needs: one upgrade
//! handshake per connection, then binary frames of at most 64 KiB. Client
//! frames must be masked, fragmentation and text frames are protocol
//! errors, pings are answered and close frames start a graceful close.
//!
//! Everything here works over byte buffers so the connection code owns the
//! socket and the tests need none.

use base64::prelude::*;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Hard cap on a single frame's payload.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Hard cap on the size of the handshake request.
const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xa;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WsError {
    #[error("malformed handshake: {0}")]
    BadHandshake(&'static str),

    #[error("unexpected opcode {0:#03x}")]
    BadOpcode(u8),

    #[error("text frames are not part of the protocol")]
    TextFrame,

    #[error("fragmented frames are not supported")]
    Fragmented,

    #[error("client frame is not masked")]
    Unmasked,

    #[error("reserved frame bits are set")]
    ReservedBits,

    #[error("frame payload of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),

    #[error("oversized control frame")]
    BadControlFrame,
}

/// A decoded frame from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16> },
}

/// The parts of the upgrade request the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub key: String,
}

/// Tries to parse a complete upgrade request from the front of `buf`.
///
/// Returns the handshake and the bytes it consumed, or `None` while the
/// request is still incomplete.
pub fn try_parse_handshake(buf: &[u8]) -> Result<Option<(Handshake, usize)>, WsError> {
    let Some(end) = find_header_end(buf) else {
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(WsError::BadHandshake("request too large"));
        }
        return Ok(None);
    };

    let request = std::str::from_utf8(&buf[..end])
        .map_err(|_| WsError::BadHandshake("request is not valid UTF-8"))?;

    let mut lines = request.split("\r\n");

    let request_line = lines
        .next()
        .ok_or(WsError::BadHandshake("missing request line"))?;
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("");
    let _path = parts
        .next()
        .ok_or(WsError::BadHandshake("missing request path"))?;
    let version = parts.next().unwrap_or("");

    if method != "GET" {
        return Err(WsError::BadHandshake("method is not GET"));
    }
    if version != "HTTP/1.1" {
        return Err(WsError::BadHandshake("not an HTTP/1.1 request"));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut version_ok = false;
    let mut key = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(WsError::BadHandshake("malformed header line"));
        };
        let value = value.trim();

        // Header names are case-insensitive ASCII.
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade_ok = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection_ok = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version_ok = value == "13";
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_owned());
        }
    }

    if !upgrade_ok {
        return Err(WsError::BadHandshake("missing websocket upgrade header"));
    }
    if !connection_ok {
        return Err(WsError::BadHandshake("missing connection upgrade header"));
    }
    if !version_ok {
        return Err(WsError::BadHandshake("unsupported websocket version"));
    }
    let key = key.ok_or(WsError::BadHandshake("missing websocket key"))?;

    Ok(Some((Handshake { key }, end)))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Computes the `Sec-WebSocket-Accept` digest for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Builds the 101 response completing the handshake.
pub fn handshake_response(handshake: &Handshake) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(&handshake.key)
    )
}

/// Tries to decode one client frame from the front of `buf`.
///
/// Returns the frame and the bytes it consumed, or `None` while the frame
/// is still incomplete. Oversized frames are rejected as soon as their
/// length is known.
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(WsError::ReservedBits);
    }
    let opcode = buf[0] & 0x0f;

    let masked = buf[1] & 0x80 != 0;
    if !masked {
        return Err(WsError::Unmasked);
    }

    let (payload_len, mut pos) = match buf[1] & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            (u64::from_be_bytes(buf[2..10].try_into().unwrap()), 10)
        }
        n => (u64::from(n), 2),
    };

    if payload_len > MAX_FRAME_PAYLOAD as u64 {
        return Err(WsError::FrameTooLarge(payload_len));
    }
    let payload_len = payload_len as usize;

    match opcode {
        OPCODE_CONTINUATION => return Err(WsError::Fragmented),
        OPCODE_TEXT => return Err(WsError::TextFrame),
        OPCODE_BINARY => {
            if !fin {
                return Err(WsError::Fragmented);
            }
        }
        OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG => {
            if !fin || payload_len > 125 {
                return Err(WsError::BadControlFrame);
            }
        }
        other => return Err(WsError::BadOpcode(other)),
    }

    if buf.len() < pos + 4 + payload_len {
        return Ok(None);
    }

    let mask: [u8; 4] = buf[pos..pos + 4].try_into().unwrap();
    pos += 4;

    let mut payload = buf[pos..pos + payload_len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    pos += payload_len;

    let frame = match opcode {
        OPCODE_BINARY => Frame::Binary(payload),
        OPCODE_PING => Frame::Ping(payload),
        OPCODE_PONG => Frame::Pong(payload),
        _ => Frame::Close {
            code: (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]])),
        },
    };

    Ok(Some((frame, pos)))
}

fn encode_frame(opcode: u8, payload: &[u8], out: &mut BytesMut) {
    out.put_u8(0x80 | opcode);

    if payload.len() < 126 {
        out.put_u8(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.put_u8(126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(127);
        out.put_u64(payload.len() as u64);
    }

    out.put_slice(payload);
}

/// Frames a binary message for the client. Server frames are not masked.
pub fn encode_binary(payload: &[u8], out: &mut BytesMut) {
    encode_frame(OPCODE_BINARY, payload, out);
}

pub fn encode_ping(out: &mut BytesMut) {
    encode_frame(OPCODE_PING, &[], out);
}

pub fn encode_pong(payload: &[u8], out: &mut BytesMut) {
    encode_frame(OPCODE_PONG, payload, out);
}

pub fn encode_close(code: u16, out: &mut BytesMut) {
    encode_frame(OPCODE_CLOSE, &code.to_be_bytes(), out);
}

/// Frames a masked binary message the way a client would. The server
/// never masks; connection tests use this to play the client side.
pub fn encode_masked_binary(payload: &[u8], mask: [u8; 4], out: &mut BytesMut) {
    out.put_u8(0x80 | OPCODE_BINARY);

    if payload.len() < 126 {
        out.put_u8(0x80 | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.put_u8(0x80 | 126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(0x80 | 127);
        out.put_u64(payload.len() as u64);
    }

    out.put_slice(&mask);
    for (i, &byte) in payload.iter().enumerate() {
        out.put_u8(byte ^ mask[i % 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const REQUEST: &str = "GET /game HTTP/1.1\r\n\
        Host: gemelo.org\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[test]
    fn accept_key_matches_the_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_a_complete_handshake() {
        let (handshake, used) = try_parse_handshake(REQUEST.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(used, REQUEST.len());
        assert_eq!(handshake.key, "dGhlIHNhbXBsZSBub25jZQ==");

        let response = handshake_response(&handshake);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let request = REQUEST
            .replace("Upgrade:", "UPGRADE:")
            .replace("Connection:", "connection:")
            .replace("Sec-WebSocket-Key:", "SEC-WEBSOCKET-KEY:");
        assert!(try_parse_handshake(request.as_bytes()).unwrap().is_some());
    }

    #[test]
    fn incomplete_handshake_waits_for_more_input() {
        for end in [0, 10, REQUEST.len() - 1] {
            assert_eq!(
                try_parse_handshake(&REQUEST.as_bytes()[..end]).unwrap(),
                None,
                "cut at {end}"
            );
        }
    }

    #[test]
    fn handshakes_missing_required_headers_are_rejected() {
        for header in ["Upgrade", "Connection", "Sec-WebSocket-Key", "Sec-WebSocket-Version"] {
            let request: String = REQUEST
                .split("\r\n")
                .filter(|line| !line.starts_with(header))
                .collect::<Vec<_>>()
                .join("\r\n");
            assert!(
                try_parse_handshake(request.as_bytes()).is_err(),
                "{header} should be required"
            );
        }
    }

    #[test]
    fn non_get_requests_are_rejected() {
        let request = REQUEST.replace("GET", "POST");
        assert_eq!(
            try_parse_handshake(request.as_bytes()),
            Err(WsError::BadHandshake("method is not GET"))
        );
    }

    fn masked(payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_masked_binary(payload, [0x12, 0x34, 0x56, 0x78], &mut out);
        out.to_vec()
    }

    #[test]
    fn masked_binary_frames_round_trip() {
        for payload in [&b""[..], b"hello", &[0u8; 200], &[0xabu8; 1000]] {
            let bytes = masked(payload);
            let (frame, used) = try_decode_frame(&bytes).unwrap().unwrap();
            assert_eq!(used, bytes.len());
            assert_eq!(frame, Frame::Binary(payload.to_vec()));
        }
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let bytes = masked(b"partial payload");
        for end in 0..bytes.len() {
            assert_eq!(
                try_decode_frame(&bytes[..end]).unwrap(),
                None,
                "cut at {end}"
            );
        }
    }

    #[test]
    fn unmasked_client_frames_are_rejected() {
        let mut out = BytesMut::new();
        encode_binary(b"nope", &mut out);
        assert_eq!(try_decode_frame(&out), Err(WsError::Unmasked));
    }

    #[test]
    fn oversized_frames_are_rejected_from_the_header_alone() {
        // 16-bit length just above the cap; no payload follows yet.
        let header = [0x82u8, 0x80 | 127, 0, 0, 0, 0, 0, 1, 0, 1];
        assert_eq!(
            try_decode_frame(&header),
            Err(WsError::FrameTooLarge(65537))
        );
    }

    #[test]
    fn text_and_fragmented_frames_are_rejected() {
        // Text frame.
        assert_eq!(
            try_decode_frame(&[0x81, 0x80, 0, 0, 0, 0]),
            Err(WsError::TextFrame)
        );
        // Binary frame without FIN.
        assert_eq!(
            try_decode_frame(&[0x02, 0x80, 0, 0, 0, 0]),
            Err(WsError::Fragmented)
        );
        // Continuation frame.
        assert_eq!(
            try_decode_frame(&[0x80, 0x80, 0, 0, 0, 0]),
            Err(WsError::Fragmented)
        );
    }

    #[test]
    fn control_frames_decode() {
        // Ping with a masked payload.
        let mask = [1u8, 2, 3, 4];
        let payload: Vec<u8> = b"ping!".iter().zip([1, 2, 3, 4, 1]).map(|(&b, m)| b ^ m).collect();
        let mut bytes = vec![0x89, 0x80 | 5];
        bytes.extend(mask);
        bytes.extend(&payload);

        let (frame, _) = try_decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Ping(b"ping!".to_vec()));

        // Close with a status code.
        let code = 1000u16.to_be_bytes();
        let mut bytes = vec![0x88, 0x80 | 2, 0, 0, 0, 0];
        bytes.extend(code);
        let (frame, _) = try_decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Close { code: Some(1000) });

        // Bare close.
        let bytes = [0x88, 0x80, 0, 0, 0, 0];
        let (frame, _) = try_decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Close { code: None });
    }

    #[test]
    fn server_frames_use_the_extended_length_forms() {
        let mut out = BytesMut::new();
        encode_binary(&[0u8; 300], &mut out);
        assert_eq!(out[0], 0x82);
        assert_eq!(out[1], 126);
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 300);
        assert_eq!(out.len(), 4 + 300);

        let mut out = BytesMut::new();
        encode_ping(&mut out);
        assert_eq!(&out[..], &[0x89, 0]);

        let mut out = BytesMut::new();
        encode_close(4001, &mut out);
        assert_eq!(&out[..], &[0x88, 2, 0x0f, 0xa1]);
    }
}
