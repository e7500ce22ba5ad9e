//! # Frame
//!
//! Frame header codec for [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data frames**: `Text`, `Binary` and `Continuation`. Only these may be fragmented or
//!   compressed.
//! - **Control frames**: `Close`, `Ping` and `Pong`. They must carry FIN and at most 125
//!   bytes of payload.
//!
//! A header is never longer than [`MAX_HEADER_SIZE`] bytes: 2 fixed bytes, up to 8 bytes of
//! extended length and a 4 byte masking key.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Result, WebSocketError};

/// Upper bound on the encoded size of a frame header.
pub const MAX_HEADER_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const FIN: u8 = 0b1000_0000;
const RSV1: u8 = 0b0100_0000;
const RSV2: u8 = 0b0010_0000;
const RSV3: u8 = 0b0001_0000;
const MASK: u8 = 0b1000_0000;

/// WebSocket operation code that determines the semantic meaning of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected as protocol errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and their payload must not exceed 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that may start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::ProtocolError("invalid opcode")),
        }
    }
}

impl From<OpCode> for u8 {
    #[inline]
    fn from(opcode: OpCode) -> u8 {
        opcode as u8
    }
}

/// Side of the connection. Clients mask every frame they send, servers never do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Returns `true` for [`Role::Client`].
    #[inline]
    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message.
    pub fin: bool,
    /// Set on the first frame of a compressed message.
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Masking key, present on every client-to-server frame.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Builds the header for an outgoing frame.
    ///
    /// # Parameters
    /// - `role`: sender role; clients get a fresh random masking key
    /// - `fin`: whether this frame ends the message
    /// - `compressed`: sets RSV1, ignored for anything but `Text` and `Binary`
    /// - `opcode`: frame opcode
    /// - `payload_len`: length of the payload as it will be written
    pub fn generate(
        role: Role,
        fin: bool,
        compressed: bool,
        opcode: OpCode,
        payload_len: usize,
    ) -> Self {
        Self {
            fin,
            rsv1: compressed && opcode.is_data(),
            rsv2: false,
            rsv3: false,
            opcode,
            mask: role.is_client().then(rand::random::<[u8; 4]>),
            payload_len: payload_len as u64,
        }
    }

    /// Number of bytes [`FrameHeader::encode`] writes for this header.
    pub fn encoded_len(&self) -> usize {
        let length_bytes = match self.payload_len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        2 + length_bytes + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Encodes the header into `out` and returns the number of bytes written.
    ///
    /// The length uses the shortest form: 7 bits up to 125, 16 bits up to 65535 and 64 bits
    /// above that.
    pub fn encode(&self, out: &mut [u8; MAX_HEADER_SIZE]) -> usize {
        let mut b0 = u8::from(self.opcode);
        if self.fin {
            b0 |= FIN;
        }
        if self.rsv1 {
            b0 |= RSV1;
        }
        if self.rsv2 {
            b0 |= RSV2;
        }
        if self.rsv3 {
            b0 |= RSV3;
        }
        out[0] = b0;

        let mask_bit = if self.mask.is_some() { MASK } else { 0 };
        let mut offset = match self.payload_len {
            len @ 0..=125 => {
                out[1] = mask_bit | len as u8;
                2
            }
            len @ 126..=65535 => {
                out[1] = mask_bit | 126;
                out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
                4
            }
            len => {
                out[1] = mask_bit | 127;
                out[2..10].copy_from_slice(&len.to_be_bytes());
                10
            }
        };

        if let Some(key) = self.mask {
            out[offset..offset + 4].copy_from_slice(&key);
            offset += 4;
        }
        offset
    }

    /// Decodes a header from the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not hold the whole header yet, otherwise the header
    /// and the number of bytes it occupied.
    ///
    /// # Errors
    /// [`WebSocketError::ProtocolError`] for reserved opcodes, fragmented or oversized control
    /// frames, and 64-bit lengths with the most significant bit set.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let needed = header_len(buf[1]);
        if buf.len() < needed {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let opcode = OpCode::try_from(b0 & 0x0F)?;
        let fin = b0 & FIN != 0;

        let (payload_len, mut offset) = match b1 & 0x7F {
            126 => (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(WebSocketError::ProtocolError(
                        "payload length has the most significant bit set",
                    ));
                }
                (len, 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ProtocolError("fragmented control frame"));
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ProtocolError("control frame too large"));
            }
        }

        let mask = if b1 & MASK != 0 {
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some((
            Self {
                fin,
                rsv1: b0 & RSV1 != 0,
                rsv2: b0 & RSV2 != 0,
                rsv3: b0 & RSV3 != 0,
                opcode,
                mask,
                payload_len,
            },
            offset,
        )))
    }

    /// Reads and decodes one header from `reader`.
    ///
    /// Reads the two fixed bytes first, then exactly the extended length and masking key they
    /// announce, so no payload byte is consumed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; MAX_HEADER_SIZE];
        reader.read_exact(&mut buf[..2]).await?;

        let needed = header_len(buf[1]);
        if needed > 2 {
            reader.read_exact(&mut buf[2..needed]).await?;
        }

        match Self::parse(&buf[..needed])? {
            Some((header, _)) => Ok(header),
            None => Err(WebSocketError::ProtocolError("truncated frame header")),
        }
    }
}

/// Header length implied by the second header byte.
#[inline]
fn header_len(b1: u8) -> usize {
    let length_bytes = match b1 & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    2 + length_bytes + if b1 & MASK != 0 { 4 } else { 0 }
}
