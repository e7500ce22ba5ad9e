//! Incoming frame processing for the read loop.

use std::{io::Cursor, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, BufReader, Chain, ReadHalf};

use crate::{
    Result, WebSocketError,
    conn::Conn,
    event::Message,
    frame::{FrameHeader, MAX_CONTROL_PAYLOAD, OpCode, Role},
    mask::apply_mask,
    pool::PooledBuf,
    transport::Transport,
};

/// Inflated messages are assumed to be at least this much larger than their frames.
const COMPRESSION_RATE: usize = 4;

/// A data message whose final fragment has not arrived yet.
struct Continuation {
    opcode: OpCode,
    compressed: bool,
    buf: PooledBuf,
}

/// Read side of a connection: the buffered transport plus reassembly state.
pub(crate) struct FrameReader<S> {
    io: BufReader<Chain<Cursor<Bytes>, ReadHalf<S>>>,
    continuation: Option<Continuation>,
}

impl<S: Transport> FrameReader<S> {
    /// `leftover` holds bytes read past the end of the handshake; they are read first.
    pub(crate) fn new(half: ReadHalf<S>, leftover: Bytes, capacity: usize) -> Self {
        Self {
            io: BufReader::with_capacity(capacity, Cursor::new(leftover).chain(half)),
            continuation: None,
        }
    }

    /// Reads one frame and dispatches it.
    ///
    /// Control frames go to their callbacks right away, data frames are accumulated until
    /// the final fragment, then delivered to `on_message`.
    ///
    /// Nothing is read or delivered once the connection is closed.
    pub(crate) async fn read_message(&mut self, conn: &Arc<Conn<S>>) -> Result<()> {
        if conn.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }
        let config = Arc::clone(conn.config());
        let header = conn
            .read_deadline
            .run(FrameHeader::read_from(&mut self.io))
            .await?;

        if header.rsv2 || header.rsv3 {
            return Err(WebSocketError::ProtocolError("reserved bits must be zero"));
        }
        if header.rsv1 && (!conn.compress_enabled() || !header.opcode.is_data()) {
            return Err(WebSocketError::ProtocolError("unexpected RSV1 bit"));
        }
        match (conn.role(), header.mask.is_some()) {
            (Role::Server, false) => {
                return Err(WebSocketError::ProtocolError("client frames must be masked"));
            }
            (Role::Client, true) => {
                return Err(WebSocketError::ProtocolError("server frames must not be masked"));
            }
            _ => {}
        }
        if header.payload_len > config.read_max_payload_size as u64 {
            return Err(WebSocketError::MessageTooLarge);
        }
        let len = header.payload_len as usize;

        if header.opcode.is_control() {
            let mut scratch = [0u8; MAX_CONTROL_PAYLOAD];
            let payload = &mut scratch[..len];
            conn.read_deadline
                .run(self.io.read_exact(payload))
                .await?;
            if let Some(mask) = header.mask {
                apply_mask(payload, mask);
            }
            let delivered = match header.opcode {
                OpCode::Ping => conn.deliver(|| conn.handler.on_ping(conn, payload)),
                OpCode::Pong => conn.deliver(|| conn.handler.on_pong(conn, payload)),
                _ => return conn.emit_close(payload).await,
            };
            return if delivered {
                Ok(())
            } else {
                Err(WebSocketError::ConnectionClosed)
            };
        }

        let (opcode, compressed, mut buf) = match (header.opcode, self.continuation.take()) {
            (OpCode::Continuation, Some(pending)) => {
                (pending.opcode, pending.compressed, pending.buf)
            }
            (OpCode::Continuation, None) => {
                return Err(WebSocketError::ProtocolError(
                    "continuation frame without a message to continue",
                ));
            }
            (_, Some(_)) => {
                return Err(WebSocketError::ProtocolError(
                    "expected a continuation frame",
                ));
            }
            (opcode, None) => (opcode, header.rsv1, config.buffers().get(len)),
        };

        let start = buf.len();
        if start + len > config.read_max_payload_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        buf.resize(start + len, 0);
        conn.read_deadline
            .run(self.io.read_exact(&mut buf[start..]))
            .await?;
        if let Some(mask) = header.mask {
            apply_mask(&mut buf[start..], mask);
        }

        if !header.fin {
            self.continuation = Some(Continuation {
                opcode,
                compressed,
                buf,
            });
            return Ok(());
        }

        let data = if compressed {
            let mut out = config.buffers().get(buf.len() * COMPRESSION_RATE);
            config.compressors().decompressor().decompress(
                &buf,
                &mut out,
                config.read_max_payload_size,
            )?;
            out
        } else {
            buf
        };

        if opcode == OpCode::Text && config.check_utf8 && !crate::is_valid_utf8(&data) {
            return Err(WebSocketError::UnsupportedData);
        }

        let message = Message::new(opcode, data);
        if config.read_async_enabled {
            let socket = Arc::clone(conn);
            conn.read_queue.push(async move {
                socket.deliver(|| socket.handler.on_message(&socket, message));
            });
        } else if !conn.deliver(|| conn.handler.on_message(conn, message)) {
            return Err(WebSocketError::ConnectionClosed);
        }
        Ok(())
    }
}
