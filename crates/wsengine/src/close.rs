//! Close codes and close-frame payloads ([RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4)).
//!
//! A close frame carries an optional payload made of a big-endian status code followed by a
//! UTF-8 reason. Like every control frame, the payload is limited to 125 bytes, so outgoing
//! reasons are truncated here, always on a character boundary.

use bytes::Bytes;

use crate::frame::MAX_CONTROL_PAYLOAD;

/// Status code sent in a close frame.
///
/// The well-known codes are available as associated constants; any other value can be
/// wrapped with [`CloseCode::from`].
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct CloseCode(u16);

impl CloseCode {
    /// The purpose for which the connection was established has been fulfilled.
    pub const NORMAL: Self = Self(1000);
    /// The endpoint is going away (server shutdown, page navigation).
    pub const GOING_AWAY: Self = Self(1001);
    /// The peer violated the protocol.
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// The endpoint received a type of data it cannot accept.
    pub const UNSUPPORTED: Self = Self(1003);
    /// No status code was present. Must never be sent on the wire.
    pub const NO_STATUS: Self = Self(1005);
    /// The connection dropped without a close frame. Must never be sent on the wire.
    pub const ABNORMAL: Self = Self(1006);
    /// Message data was inconsistent with its type, such as non UTF-8 text.
    pub const INVALID_PAYLOAD: Self = Self(1007);
    /// Generic policy violation.
    pub const POLICY: Self = Self(1008);
    /// The message is too big to process.
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    /// The client expected an extension the server did not negotiate.
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    /// Unexpected condition on the server.
    pub const INTERNAL_ERROR: Self = Self(1011);
    /// The server is restarting.
    pub const SERVICE_RESTART: Self = Self(1012);
    /// Temporary overload, try again later.
    pub const TRY_AGAIN_LATER: Self = Self(1013);
    /// TLS handshake failure. Must never be sent on the wire.
    pub const TLS_HANDSHAKE: Self = Self(1015);

    /// Returns `true` if a peer may legally put this code in a close frame.
    ///
    /// Codes below 1000, codes at or above 5000, the unassigned range `1016..3000` and the
    /// codes reserved for local use (1004, 1005, 1006, 1014, 1015) are rejected.
    pub fn is_allowed(self) -> bool {
        match self.0 {
            1004 | 1005 | 1006 | 1014 | 1015 => false,
            code => (1000..1016).contains(&code) || (3000..5000).contains(&code),
        }
    }

    /// Code sent back when acknowledging a peer close carrying `self`.
    ///
    /// Codes registered by RFC 6455 are acknowledged with [`CloseCode::NORMAL`], codes in the
    /// IANA and private ranges are echoed, and forbidden codes get
    /// [`CloseCode::PROTOCOL_ERROR`].
    pub fn acknowledgement(self) -> Self {
        if !self.is_allowed() {
            Self::PROTOCOL_ERROR
        } else if self.0 < 1016 {
            Self::NORMAL
        } else {
            self
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code.0
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side started the close handshake.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseOrigin {
    /// The connection was closed locally: an explicit close, a write failure or a protocol
    /// violation detected while reading.
    Local,
    /// The peer sent a close frame.
    Peer,
}

/// Close information delivered to [`EventHandler::on_close`](crate::EventHandler::on_close).
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    /// Status code. For a peer close this is the code the peer sent (0 when the close frame
    /// was empty); for a local close it is the code that was sent.
    pub code: u16,
    /// Close reason, or the error text for failures detected locally.
    pub reason: Bytes,
    /// Side that started the close.
    pub origin: CloseOrigin,
}

impl CloseOutcome {
    /// Reason as text, if it is valid UTF-8.
    pub fn reason_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.reason).ok()
    }
}

/// Builds an outgoing close payload: big-endian `code` followed by `reason`.
///
/// A `code` of zero produces an empty payload. The reason is cut so the whole payload fits in
/// a control frame; when the reason is valid UTF-8 the cut never splits a character.
pub fn close_payload(code: u16, reason: &[u8]) -> Vec<u8> {
    if code == 0 {
        return Vec::new();
    }

    let reason = truncate_reason(reason, MAX_CONTROL_PAYLOAD - 2);
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}

fn truncate_reason(reason: &[u8], limit: usize) -> &[u8] {
    if reason.len() <= limit {
        return reason;
    }

    match std::str::from_utf8(reason) {
        Ok(text) => {
            let mut end = limit;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &reason[..end]
        }
        Err(_) => &reason[..limit],
    }
}

/// A close frame received from the peer, with the acknowledgement to send back.
#[derive(Debug, Clone)]
pub(crate) struct PeerClose {
    /// Code to put in the acknowledging close frame; `None` sends an empty payload.
    pub(crate) response: Option<CloseCode>,
    /// Code the peer sent, 0 when absent.
    pub(crate) code: u16,
    /// Reason bytes the peer sent.
    pub(crate) reason: Bytes,
}

impl PeerClose {
    /// Interprets a close payload received from the peer.
    pub(crate) fn parse(payload: &[u8], check_utf8: bool) -> Self {
        match payload {
            [] => Self {
                response: None,
                code: 0,
                reason: Bytes::new(),
            },
            // a status code is two bytes, a lone byte is malformed
            [byte] => Self {
                response: Some(CloseCode::PROTOCOL_ERROR),
                code: u16::from(*byte),
                reason: Bytes::new(),
            },
            [hi, lo, reason @ ..] => {
                let code = u16::from_be_bytes([*hi, *lo]);
                let mut response = CloseCode::from(code).acknowledgement();
                if check_utf8 && !crate::is_valid_utf8(reason) {
                    response = CloseCode::INVALID_PAYLOAD;
                }
                Self {
                    response: Some(response),
                    code,
                    reason: Bytes::copy_from_slice(reason),
                }
            }
        }
    }
}
