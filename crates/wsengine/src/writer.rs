//! Outgoing frame generation.
//!
//! [`FrameWriter::generate`] turns an opcode and a payload into a [`Frame`]: one pooled buffer
//! holding the header and the (possibly compressed, possibly masked) payload, ready to be
//! written with a single call.
//!
//! Uncompressed frames know their length up front, so the header is written first. Compressed
//! frames only learn it after deflating, so the payload is compressed behind
//! [`MAX_HEADER_SIZE`] bytes of padding and the header is copied into the end of that padding
//! afterwards. The unused leading padding is skipped through [`Frame::start`].

use crate::{
    Result, WebSocketError,
    frame::{FrameHeader, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE, OpCode, Role},
    mask::apply_mask,
    options::Config,
    pool::PooledBuf,
};

/// Deflate is expected to shrink payloads at least this much; used to size buffers.
const COMPRESSION_RATE: usize = 4;

/// An encoded frame in a pooled buffer. Dropping it returns the buffer to the pool.
#[derive(Debug)]
pub struct Frame {
    buf: PooledBuf,
    start: usize,
}

impl Frame {
    /// Wire bytes of the frame, header included.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Offset of the first wire byte inside the underlying buffer.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds frames for one side of a connection.
///
/// Obtained from [`Conn::frame_writer`](crate::Conn::frame_writer), or built directly for
/// connection-less encoding.
#[derive(Debug, Clone, Copy)]
pub struct FrameWriter<'a> {
    role: Role,
    compress: bool,
    config: &'a Config,
}

impl<'a> FrameWriter<'a> {
    /// # Parameters
    /// - `role`: client frames are masked
    /// - `compress`: whether permessage-deflate is in effect for the connection
    /// - `config`: limits, threshold and pools
    pub fn new(role: Role, compress: bool, config: &'a Config) -> Self {
        Self {
            role,
            compress,
            config,
        }
    }

    /// Encodes a complete, unfragmented message or control frame.
    ///
    /// Data payloads of at least `compress_threshold` bytes are deflated when compression is
    /// in effect.
    ///
    /// # Errors
    /// - [`WebSocketError::UnsupportedData`]: invalid UTF-8 text with `check_utf8` set
    /// - [`WebSocketError::ProtocolError`]: `Continuation` opcode, or a control payload over
    ///   125 bytes
    /// - [`WebSocketError::MessageTooLarge`]: payload, after compression, over
    ///   `write_max_payload_size`
    /// - [`WebSocketError::Compression`]: deflate failure
    pub fn generate(&self, opcode: OpCode, payload: &[u8]) -> Result<Frame> {
        if opcode == OpCode::Text && self.config.check_utf8 && !crate::is_valid_utf8(payload) {
            return Err(WebSocketError::UnsupportedData);
        }
        if opcode == OpCode::Continuation {
            return Err(WebSocketError::ProtocolError(
                "continuation frames cannot start a message",
            ));
        }
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ProtocolError("control frame too large"));
        }

        if self.compress && opcode.is_data() && payload.len() >= self.config.compress_threshold {
            return self.compressed(opcode, payload);
        }

        if payload.len() > self.config.write_max_payload_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        let header = FrameHeader::generate(self.role, true, false, opcode, payload.len());
        let mut head = [0u8; MAX_HEADER_SIZE];
        let n = header.encode(&mut head);

        let mut buf = self.config.buffers().get(n + payload.len());
        buf.extend_from_slice(&head[..n]);
        buf.extend_from_slice(payload);
        if let Some(mask) = header.mask {
            apply_mask(&mut buf[n..], mask);
        }

        Ok(Frame { buf, start: 0 })
    }

    fn compressed(&self, opcode: OpCode, payload: &[u8]) -> Result<Frame> {
        let mut buf = self
            .config
            .buffers()
            .get(payload.len() / COMPRESSION_RATE + MAX_HEADER_SIZE);
        buf.resize(MAX_HEADER_SIZE, 0);

        self.config
            .compressors()
            .compressor()
            .compress(payload, &mut buf)
            .map_err(WebSocketError::Compression)?;

        let len = buf.len() - MAX_HEADER_SIZE;
        if len > self.config.write_max_payload_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        let header = FrameHeader::generate(self.role, true, true, opcode, len);
        let mut head = [0u8; MAX_HEADER_SIZE];
        let n = header.encode(&mut head);

        if let Some(mask) = header.mask {
            apply_mask(&mut buf[MAX_HEADER_SIZE..], mask);
        }
        let start = MAX_HEADER_SIZE - n;
        buf[start..MAX_HEADER_SIZE].copy_from_slice(&head[..n]);

        Ok(Frame { buf, start })
    }
}
