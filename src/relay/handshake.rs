// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental WebSocket upgrade detection.
//!
//! A connection whose first byte is `G` is treated as an HTTP upgrade
//! request: chunks are buffered until the blank line that ends the header
//! block, the headers are checked, and the peer gets either a
//! `101 Switching Protocols` or a `400 Bad Request`. Any other first byte
//! makes the connection raw for good. After a successful upgrade the bytes
//! are passed through untouched; frames are not decoded.

use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::{info, trace};

use crate::{AppError, AppResult};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const SUBPROTOCOL: &str = "supertux";
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

const KEY_PREFIX: &[u8] = b"Sec-WebSocket-Key: ";
const VERSION_PREFIX: &[u8] = b"Sec-WebSocket-Version: ";
const ORIGIN_PREFIX: &[u8] = b"Origin: ";
const SUPPORTED_VERSION: u32 = 1;

/// `base64(sha1(key + GUID))`, the value of `Sec-WebSocket-Accept`.
pub fn accept_key(client_key: &str) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

pub fn switching_protocols_response(accept: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         Sec-WebSocket-Protocol: {SUBPROTOCOL}\r\n\r\n"
    ))
}

/// Splits a header block on CRLF.
fn header_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(block);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.windows(2).position(|pair| pair == b"\r\n") {
            Some(end) => {
                rest = Some(&current[end + 2..]);
                Some(&current[..end])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

/// A header block that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub request_line: String,
    pub key: String,
    pub origin: Option<String>,
}

impl UpgradeRequest {
    /// Parses the header block, without its terminating blank line.
    ///
    /// Header lines are compared exactly, byte for byte, case included. Lines
    /// that match no known header are ignored whatever their encoding.
    pub fn parse(header_block: &[u8]) -> AppResult<UpgradeRequest> {
        let mut lines = header_lines(header_block);
        let request_line = String::from_utf8_lossy(lines.next().unwrap_or_default()).into_owned();
        trace!("upgrade request line: {}", request_line);

        let mut has_connection = false;
        let mut has_upgrade = false;
        let mut has_protocol = false;
        let mut key = String::new();
        let mut version = None;
        let mut origin = None;

        for line in lines {
            trace!("upgrade header: {}", String::from_utf8_lossy(line));
            if line == b"Connection: Upgrade" {
                has_connection = true;
            } else if line == b"Upgrade: websocket" {
                has_upgrade = true;
            } else if line == b"Sec-WebSocket-Protocol: supertux" {
                has_protocol = true;
            } else if let Some(value) = line.strip_prefix(KEY_PREFIX) {
                // a key that is not text cannot be echoed back
                key = std::str::from_utf8(value).unwrap_or_default().to_string();
            } else if let Some(value) = line.strip_prefix(VERSION_PREFIX) {
                version = std::str::from_utf8(value)
                    .ok()
                    .and_then(|value| value.trim().parse::<u32>().ok());
            } else if let Some(value) = line.strip_prefix(ORIGIN_PREFIX) {
                let value = String::from_utf8_lossy(value).into_owned();
                info!("websocket comes from: {}", value);
                origin = Some(value);
            }
        }

        let mut missing = Vec::new();
        if !has_connection {
            missing.push("Connection: Upgrade");
        }
        if !has_upgrade {
            missing.push("Upgrade: websocket");
        }
        if !has_protocol {
            missing.push("Sec-WebSocket-Protocol: supertux");
        }
        if key.is_empty() {
            missing.push("Sec-WebSocket-Key");
        }
        if version != Some(SUPPORTED_VERSION) {
            missing.push("Sec-WebSocket-Version: 1");
        }
        if !missing.is_empty() {
            return Err(AppError::HandshakeValidation(format!(
                "missing or invalid headers: {}",
                missing.join(", ")
            )));
        }

        Ok(UpgradeRequest {
            request_line,
            key,
            origin,
        })
    }
}

/// Per-connection handshake progress.
#[derive(Debug, Default)]
pub enum HandshakeState {
    #[default]
    AwaitingFirstByte,
    Accumulating {
        buffer: BytesMut,
        /// when the last chunk arrived
        last_activity: Instant,
    },
    /// handshake done, bytes are application payload
    Upgraded,
    /// not a websocket peer
    Raw,
    /// a 400 has been issued, the connection is going away
    Rejected,
}

/// What the caller should do with a chunk after feeding it.
#[derive(Debug)]
pub enum Step {
    /// nothing to do until more bytes arrive
    Wait,
    /// application payload
    Forward(Bytes),
    /// send `response`; `payload` holds bytes that followed the header block
    Upgrade {
        response: Bytes,
        request: UpgradeRequest,
        payload: Option<Bytes>,
    },
    /// send `response`, then close the connection
    Reject { response: Bytes, reason: AppError },
}

impl HandshakeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the state with one received chunk. The result does not
    /// depend on how the bytes were split into chunks.
    pub fn feed(&mut self, chunk: Bytes, now: Instant, max_header_bytes: usize) -> Step {
        if chunk.is_empty() {
            return Step::Wait;
        }
        match self {
            HandshakeState::AwaitingFirstByte => {
                if chunk[0] == b'G' {
                    *self = HandshakeState::Accumulating {
                        buffer: BytesMut::with_capacity(chunk.len()),
                        last_activity: now,
                    };
                    self.accumulate(&chunk, now, max_header_bytes)
                } else {
                    *self = HandshakeState::Raw;
                    Step::Forward(chunk)
                }
            }
            HandshakeState::Accumulating { .. } => self.accumulate(&chunk, now, max_header_bytes),
            HandshakeState::Upgraded | HandshakeState::Raw => Step::Forward(chunk),
            HandshakeState::Rejected => Step::Wait,
        }
    }

    fn accumulate(&mut self, chunk: &[u8], now: Instant, max_header_bytes: usize) -> Step {
        let HandshakeState::Accumulating {
            buffer,
            last_activity,
        } = self
        else {
            return Step::Wait;
        };
        *last_activity = now;
        // the terminator may straddle the previous chunk
        let search_from = buffer.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        buffer.extend_from_slice(chunk);

        let Some(offset) = buffer[search_from..]
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
        else {
            if buffer.len() > max_header_bytes {
                let pending = buffer.len();
                return self.reject(AppError::HandshakeValidation(format!(
                    "header block exceeds {} bytes ({} buffered)",
                    max_header_bytes, pending
                )));
            }
            return Step::Wait;
        };

        let header_end = search_from + offset;
        if header_end + HEADER_TERMINATOR.len() > max_header_bytes {
            return self.reject(AppError::HandshakeValidation(format!(
                "header block exceeds {} bytes",
                max_header_bytes
            )));
        }

        let mut buffer = std::mem::take(buffer);
        let header_block = buffer.split_to(header_end);
        buffer.advance(HEADER_TERMINATOR.len());

        match UpgradeRequest::parse(&header_block) {
            Ok(request) => {
                *self = HandshakeState::Upgraded;
                let response = switching_protocols_response(&accept_key(&request.key));
                let payload = (!buffer.is_empty()).then(|| buffer.freeze());
                Step::Upgrade {
                    response,
                    request,
                    payload,
                }
            }
            Err(reason) => self.reject(reason),
        }
    }

    fn reject(&mut self, reason: AppError) -> Step {
        *self = HandshakeState::Rejected;
        Step::Reject {
            response: Bytes::from_static(BAD_REQUEST_RESPONSE),
            reason,
        }
    }

    /// `None` until the first byte has been seen.
    pub fn is_websocket(&self) -> Option<bool> {
        match self {
            HandshakeState::AwaitingFirstByte => None,
            HandshakeState::Raw => Some(false),
            _ => Some(true),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, HandshakeState::Accumulating { .. })
    }

    /// True when a pending handshake has received nothing for `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        match self {
            HandshakeState::Accumulating { last_activity, .. } => {
                now.saturating_duration_since(*last_activity) >= timeout
            }
            _ => false,
        }
    }

    /// Rejects a pending handshake from outside, e.g. on idle timeout.
    /// Returns `None` if the handshake is not pending.
    pub fn expire(&mut self) -> Option<Step> {
        if !self.is_pending() {
            return None;
        }
        Some(self.reject(AppError::HandshakeValidation(
            "handshake timed out".into(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const MAX: usize = 8 * 1024;

    const VALID_REQUEST: &str = "GET / HTTP/1.1\r\n\
        Connection: Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Protocol: supertux\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 1\r\n\r\n";

    /// Feeds every chunk and collects the non-Wait steps.
    fn run(chunks: &[&[u8]]) -> (HandshakeState, Vec<Step>) {
        let mut state = HandshakeState::new();
        let now = Instant::now();
        let steps: Vec<Step> = chunks
            .iter()
            .map(|chunk| state.feed(Bytes::copy_from_slice(chunk), now, MAX))
            .filter(|step| !matches!(step, Step::Wait))
            .collect();
        (state, steps)
    }

    fn response_text(step: &Step) -> String {
        match step {
            Step::Upgrade { response, .. } | Step::Reject { response, .. } => {
                String::from_utf8(response.to_vec()).unwrap()
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_key_matches_rfc6455_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_valid_upgrade() {
        let (state, steps) = run(&[VALID_REQUEST.as_bytes()]);
        assert!(matches!(state, HandshakeState::Upgraded));
        assert_eq!(steps.len(), 1);

        let text = response_text(&steps[0]);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: supertux\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        match &steps[0] {
            Step::Upgrade {
                request, payload, ..
            } => {
                assert_eq!(request.request_line, "GET / HTTP/1.1");
                assert!(payload.is_none());
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_missing_protocol_is_rejected() {
        let request = VALID_REQUEST.replace("Sec-WebSocket-Protocol: supertux\r\n", "");
        let (state, steps) = run(&[request.as_bytes()]);
        assert!(matches!(state, HandshakeState::Rejected));
        assert_eq!(response_text(&steps[0]), "HTTP/1.1 400 Bad Request\r\n\r\n");
        assert!(matches!(
            &steps[0],
            Step::Reject { reason: AppError::HandshakeValidation(msg), .. } if msg.contains("Sec-WebSocket-Protocol")
        ));
    }

    #[rstest]
    #[case("Connection: Upgrade\r\n", "Connection: keep-alive\r\n")]
    #[case("Upgrade: websocket\r\n", "Upgrade: WebSocket\r\n")]
    #[case("Sec-WebSocket-Protocol: supertux\r\n", "Sec-WebSocket-Protocol: chat\r\n")]
    #[case("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "Sec-WebSocket-Key: \r\n")]
    #[case("Sec-WebSocket-Version: 1\r\n", "Sec-WebSocket-Version: 13\r\n")]
    #[case("Sec-WebSocket-Version: 1\r\n", "Sec-WebSocket-Version: one\r\n")]
    fn test_invalid_header_is_rejected(#[case] from: &str, #[case] to: &str) {
        let request = VALID_REQUEST.replace(from, to);
        let (state, steps) = run(&[request.as_bytes()]);
        assert!(matches!(state, HandshakeState::Rejected));
        assert!(matches!(steps[0], Step::Reject { .. }));
    }

    #[test]
    fn test_split_header_matches_single_chunk() {
        let first = b"GET / HTTP/1.1\r\nConnection: Upg".as_slice();
        let second = b"rade\r\nUpgrade: websocket\r\nSec-WebSocket-Protocol: supertux\r\n\
            Sec-WebSocket-Key: x\r\nSec-WebSocket-Version: 1\r\n\r\n"
            .as_slice();
        let whole = [first, second].concat();

        let (split_state, split_steps) = run(&[first, second]);
        let (whole_state, whole_steps) = run(&[whole.as_slice()]);

        assert!(matches!(split_state, HandshakeState::Upgraded));
        assert!(matches!(whole_state, HandshakeState::Upgraded));
        assert_eq!(split_steps.len(), 1);
        assert_eq!(response_text(&split_steps[0]), response_text(&whole_steps[0]));
        assert!(response_text(&split_steps[0]).contains(&accept_key("x")));
    }

    #[test]
    fn test_every_split_point_gives_same_outcome() {
        let request = format!("{}first message", VALID_REQUEST);
        let bytes = request.as_bytes();
        let (_, expected) = run(&[bytes]);
        let expected_response = response_text(&expected[0]);

        for split in 1..bytes.len() {
            let (state, steps) = run(&[&bytes[..split], &bytes[split..]]);
            assert!(matches!(state, HandshakeState::Upgraded), "split at {}", split);
            assert_eq!(response_text(&steps[0]), expected_response, "split at {}", split);

            // payload is reassembled exactly once, whichever chunk carried it
            let mut payload = Vec::new();
            for step in &steps {
                match step {
                    Step::Upgrade {
                        payload: Some(p), ..
                    } => payload.extend_from_slice(p),
                    Step::Forward(p) => payload.extend_from_slice(p),
                    _ => {}
                }
            }
            assert_eq!(payload, b"first message", "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let chunks: Vec<&[u8]> = VALID_REQUEST.as_bytes().chunks(1).collect();
        let (state, steps) = run(&chunks);
        assert!(matches!(state, HandshakeState::Upgraded));
        assert_eq!(steps.len(), 1);
        assert!(response_text(&steps[0]).contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_trailing_payload_forwarded_once() {
        let request = format!("{}hello", VALID_REQUEST);
        let (_, steps) = run(&[request.as_bytes(), b" again"]);
        assert_eq!(steps.len(), 2);
        match &steps[0] {
            Step::Upgrade {
                payload: Some(payload),
                ..
            } => assert_eq!(payload.as_ref(), b"hello"),
            other => panic!("unexpected step {:?}", other),
        }
        assert!(matches!(&steps[1], Step::Forward(p) if p.as_ref() == b" again"));
    }

    #[test]
    fn test_non_get_connection_stays_raw() {
        let (state, steps) = run(&[b"0101", VALID_REQUEST.as_bytes(), b"G"]);
        assert_eq!(state.is_websocket(), Some(false));
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|step| matches!(step, Step::Forward(_))));
        assert!(matches!(&steps[1], Step::Forward(p) if p.as_ref() == VALID_REQUEST.as_bytes()));
    }

    #[test]
    fn test_empty_chunks_are_ignored() {
        let mut state = HandshakeState::new();
        let step = state.feed(Bytes::new(), Instant::now(), MAX);
        assert!(matches!(step, Step::Wait));
        assert_eq!(state.is_websocket(), None);
    }

    #[test]
    fn test_rejected_state_swallows_input() {
        let mut state = HandshakeState::new();
        let now = Instant::now();
        let step = state.feed(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), now, MAX);
        assert!(matches!(step, Step::Reject { .. }));
        let step = state.feed(Bytes::from_static(b"more"), now, MAX);
        assert!(matches!(step, Step::Wait));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut state = HandshakeState::new();
        let now = Instant::now();
        assert!(matches!(
            state.feed(Bytes::from_static(b"GET / HTTP/1.1\r\n"), now, 32),
            Step::Wait
        ));
        let step = state.feed(Bytes::from(vec![b'a'; 64]), now, 32);
        assert!(matches!(
            step,
            Step::Reject {
                reason: AppError::HandshakeValidation(_),
                ..
            }
        ));
        assert!(matches!(state, HandshakeState::Rejected));
    }

    #[test]
    fn test_oversized_complete_header_is_rejected() {
        let mut state = HandshakeState::new();
        let step = state.feed(Bytes::from_static(VALID_REQUEST.as_bytes()), Instant::now(), 64);
        assert!(matches!(step, Step::Reject { .. }));
    }

    #[test]
    fn test_expiry() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut state = HandshakeState::new();
        state.feed(Bytes::from_static(b"GET / HTTP/1.1\r\n"), start, MAX);

        assert!(state.is_pending());
        assert!(!state.is_expired(start + Duration::from_secs(9), timeout));
        assert!(state.is_expired(start + Duration::from_secs(10), timeout));

        let step = state.expire().unwrap();
        assert!(matches!(step, Step::Reject { .. }));
        assert!(state.expire().is_none());
        assert!(!state.is_expired(start + Duration::from_secs(60), timeout));
    }

    #[test]
    fn test_expiry_counts_from_last_chunk() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut state = HandshakeState::new();
        state.feed(Bytes::from_static(b"GET / HTTP/1.1\r\n"), start, MAX);

        let later = start + Duration::from_secs(8);
        let step = state.feed(Bytes::from_static(b"Connection: Upgrade\r\n"), later, MAX);
        assert!(matches!(step, Step::Wait));

        assert!(!state.is_expired(start + Duration::from_secs(12), timeout));
        assert!(state.is_expired(later + timeout, timeout));
    }

    #[test]
    fn test_non_utf8_unknown_header_is_ignored() {
        let mut request = b"GET / HTTP/1.1\r\nUser-Agent: caf\xe9\r\n".to_vec();
        request.extend_from_slice(&VALID_REQUEST.as_bytes()["GET / HTTP/1.1\r\n".len()..]);

        let (state, steps) = run(&[request.as_slice()]);
        assert!(matches!(state, HandshakeState::Upgraded));
        assert!(response_text(&steps[0]).contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_non_utf8_key_is_rejected() {
        let request = VALID_REQUEST
            .as_bytes()
            .split(|&b| b == b'\n')
            .map(|line| {
                if line.starts_with(b"Sec-WebSocket-Key: ") {
                    b"Sec-WebSocket-Key: \xff\xfe\r".to_vec()
                } else {
                    line.to_vec()
                }
            })
            .collect::<Vec<_>>()
            .join(&b'\n');
        let (state, _) = run(&[request.as_slice()]);
        assert!(matches!(state, HandshakeState::Rejected));
    }

    #[test]
    fn test_origin_is_captured() {
        let request = VALID_REQUEST.replace(
            "GET / HTTP/1.1\r\n",
            "GET / HTTP/1.1\r\nOrigin: https://supertux.org\r\n",
        );
        let header_end = request.find("\r\n\r\n").unwrap();
        let parsed = UpgradeRequest::parse(request[..header_end].as_bytes()).unwrap();
        assert_eq!(parsed.origin.as_deref(), Some("https://supertux.org"));
        assert_eq!(parsed.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }
}
