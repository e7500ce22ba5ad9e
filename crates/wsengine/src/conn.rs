//! A WebSocket connection over an upgraded byte stream.
//!
//! [`Conn`] owns both halves of the transport. Reads happen on the task that drives
//! [`Conn::read_loop`]; writes come from any task and are serialized by the writer lock.
//! Queued writes ([`Conn::write_async`], [`Broadcaster`](crate::Broadcaster)) additionally go
//! through a single-worker queue, so they reach the wire in submission order.
//!
//! # Closing
//!
//! The connection closes exactly once, whichever trigger comes first: a local error or
//! [`Conn::write_close`], or a close frame from the peer. The winner sends the close frame
//! and calls [`EventHandler::on_close`]; every later trigger is a no-op. A locally started
//! close also expires both deadlines so the read loop stops right away.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWriteExt, BufWriter, WriteHalf};

use crate::{
    Result, WebSocketError,
    close::{CloseOrigin, CloseOutcome, PeerClose, close_payload},
    event::EventHandler,
    frame::{OpCode, Role},
    options::Config,
    reader::FrameReader,
    scheduler::WorkerQueue,
    transport::{Deadline, Transport},
    writer::FrameWriter,
};

/// How long the transport shutdown may take once the connection has closed locally.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// An established WebSocket connection.
///
/// Created with [`Conn::new`] once the HTTP upgrade is done, then driven by
/// [`Conn::read_loop`]. Shared as `Arc<Conn<S>>`.
pub struct Conn<S: Transport> {
    role: Role,
    compress_enabled: bool,
    config: Arc<Config>,
    closed: AtomicBool,
    /// Held shared while a callback runs, exclusively while the closed flag flips.
    delivery: RwLock<()>,
    reader: Mutex<Option<FrameReader<S>>>,
    writer: tokio::sync::Mutex<BufWriter<WriteHalf<S>>>,
    pub(crate) handler: Box<dyn EventHandler<S>>,
    pub(crate) write_queue: WorkerQueue,
    pub(crate) read_queue: WorkerQueue,
    pub(crate) read_deadline: Deadline,
    write_deadline: Deadline,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<S: Transport> Conn<S> {
    /// Wraps an upgraded stream.
    ///
    /// # Parameters
    /// - `role`: which side of the handshake this endpoint played
    /// - `stream`: the transport, positioned right after the handshake
    /// - `read_buf`: bytes the handshake read past its end; they are consumed before `stream`
    /// - `config`: resolved configuration, shared between connections
    /// - `compress_enabled`: whether permessage-deflate was negotiated; only effective if the
    ///   config enables compression too
    /// - `handler`: event callbacks
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime; the connection's worker queues run on the
    /// runtime it is created in.
    pub fn new<H>(
        role: Role,
        stream: S,
        read_buf: Bytes,
        config: Arc<Config>,
        compress_enabled: bool,
        handler: H,
    ) -> Arc<Self>
    where
        H: EventHandler<S>,
    {
        if config.no_delay {
            if let Err(err) = stream.set_nodelay(true) {
                tracing::warn!(error = %err, "failed to set TCP_NODELAY");
            }
        }
        let local_addr = stream.local_addr();
        let peer_addr = stream.peer_addr();
        let (read_half, write_half) = tokio::io::split(stream);

        Arc::new(Self {
            role,
            compress_enabled: compress_enabled && config.compress_enabled,
            closed: AtomicBool::new(false),
            delivery: RwLock::new(()),
            reader: Mutex::new(Some(FrameReader::new(
                read_half,
                read_buf,
                config.read_buffer_size,
            ))),
            writer: tokio::sync::Mutex::new(BufWriter::with_capacity(
                config.write_buffer_size,
                write_half,
            )),
            handler: Box::new(handler),
            write_queue: WorkerQueue::new(1),
            read_queue: WorkerQueue::new(config.read_async_limit),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            local_addr,
            peer_addr,
            config,
        })
    }

    /// Reads and dispatches frames until the connection closes, then shuts the transport
    /// down.
    ///
    /// Calls `on_open` first. Errors never escape: they close the connection and are
    /// reported through `on_close`. Only the first call does anything.
    pub async fn read_loop(self: &Arc<Self>) {
        let Some(mut reader) = self.reader.lock().take() else {
            tracing::warn!("read loop is already running");
            return;
        };

        tracing::debug!(role = %self.role, peer = ?self.peer_addr, "websocket connection open");
        self.handler.on_open(self);

        loop {
            if let Err(err) = reader.read_message(self).await {
                self.emit_error(&err).await;
                break;
            }
        }
        drop(reader);

        let shutdown = async { self.writer.lock().await.shutdown().await };
        let result = if self.write_deadline.is_expired() {
            // closing expired the write deadline, the shutdown gets a short grace period instead
            match tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await {
                Ok(result) => result,
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        } else {
            self.write_deadline.run(shutdown).await
        };
        if let Err(err) = result {
            tracing::trace!(error = %err, "transport shutdown failed");
        }
    }

    /// Sends a message and waits until it is handed to the transport.
    ///
    /// A failure also closes the connection.
    pub async fn write_message(self: &Arc<Self>, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }
        match self.do_write(opcode, payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.emit_error(&err).await;
                Err(err)
            }
        }
    }

    pub async fn write_string(self: &Arc<Self>, text: &str) -> Result<()> {
        self.write_message(OpCode::Text, text.as_bytes()).await
    }

    pub async fn write_binary(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Binary, payload).await
    }

    pub async fn write_ping(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Ping, payload).await
    }

    pub async fn write_pong(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.write_message(OpCode::Pong, payload).await
    }

    /// Encodes a message now and queues the socket write.
    ///
    /// Returns as soon as the frame is built; encoding errors are returned here and close
    /// the connection, while errors of the queued write only surface through `on_close`.
    /// Queued writes reach the wire in the order they were queued.
    pub fn write_async(self: &Arc<Self>, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        match self.frame_writer().generate(opcode, payload) {
            Ok(frame) => {
                let conn = Arc::clone(self);
                self.write_queue
                    .push(async move { conn.write_queued(frame.as_bytes()).await });
                Ok(())
            }
            Err(err) => {
                let conn = Arc::clone(self);
                let queued = err.replicate();
                self.write_queue
                    .push(async move { conn.emit_error(&queued).await });
                Err(err)
            }
        }
    }

    /// Closes the connection with `code` and `reason`.
    ///
    /// A `code` of zero sends an empty close frame. Reasons that do not fit in a control
    /// frame are truncated. Does nothing if the connection is already closed.
    pub async fn write_close(self: &Arc<Self>, code: u16, reason: &[u8]) {
        let err = WebSocketError::Close {
            code,
            reason: Bytes::copy_from_slice(reason),
        };
        self.emit_error(&err).await;
    }

    /// Sets the read and write deadlines. `None` removes them.
    pub fn set_deadline(&self, at: Option<Instant>) -> Result<()> {
        self.set_read_deadline(at)?;
        self.set_write_deadline(at)
    }

    /// Sets the deadline for reads; a read still pending when it passes fails with
    /// [`std::io::ErrorKind::TimedOut`] and closes the connection.
    pub fn set_read_deadline(&self, at: Option<Instant>) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.read_deadline.set(at.map(tokio::time::Instant::from_std));
        Ok(())
    }

    /// Sets the deadline for writes.
    pub fn set_write_deadline(&self, at: Option<Instant>) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.write_deadline.set(at.map(tokio::time::Instant::from_std));
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Locks the write half of the transport for direct access.
    ///
    /// Holding the guard blocks every frame write on this connection.
    pub async fn net_conn(&self) -> tokio::sync::MappedMutexGuard<'_, WriteHalf<S>> {
        tokio::sync::MutexGuard::map(self.writer.lock().await, |writer| writer.get_mut())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether outgoing messages may be compressed and incoming ones may carry RSV1.
    pub fn compress_enabled(&self) -> bool {
        self.compress_enabled
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Frame generator for this connection's role and compression setting.
    pub fn frame_writer(&self) -> FrameWriter<'_> {
        FrameWriter::new(self.role, self.compress_enabled, &self.config)
    }

    /// Builds and writes one frame. Skips the closed check, so it also carries close frames.
    async fn do_write(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let frame = self.frame_writer().generate(opcode, payload)?;
        self.write_frame(frame.as_bytes()).await
    }

    /// Writes encoded bytes under the writer lock and the write deadline.
    pub(crate) async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        self.write_deadline
            .run(async {
                let mut writer = self.writer.lock().await;
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok(())
            })
            .await
    }

    /// Body of a queued write: skipped once closed, and a failure closes the connection.
    pub(crate) async fn write_queued(self: &Arc<Self>, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.write_frame(bytes).await {
            self.emit_error(&err).await;
        }
    }

    /// Runs `callback` unless the connection is closed. Returns whether it ran.
    ///
    /// Closing waits for running callbacks, so none starts or finishes after `on_close`.
    pub(crate) fn deliver(&self, callback: impl FnOnce()) -> bool {
        let _guard = self.delivery.read();
        if self.is_closed() {
            return false;
        }
        callback();
        true
    }

    fn mark_closed(&self) -> bool {
        let _guard = self.delivery.write();
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Closes the connection because of `err`, sending `err.close_code()` and its message.
    pub(crate) async fn emit_error(self: &Arc<Self>, err: &WebSocketError) {
        if !self.mark_closed() {
            return;
        }

        let code = err.close_code();
        let reason = err.close_reason();
        let payload = close_payload(code, &reason);
        if let Err(write_err) = self.do_write(OpCode::Close, &payload).await {
            tracing::debug!(error = %write_err, "failed to send close frame");
        }

        self.read_deadline.expire_now();
        self.write_deadline.expire_now();

        tracing::debug!(code, error = %err, "websocket connection closed");
        self.handler.on_close(
            self,
            CloseOutcome {
                code,
                reason,
                origin: CloseOrigin::Local,
            },
        );
    }

    /// Handles a close frame from the peer.
    ///
    /// Always returns [`WebSocketError::ConnectionClosed`] so the read loop stops.
    pub(crate) async fn emit_close(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let close = PeerClose::parse(payload, self.config.check_utf8);

        if self.mark_closed() {
            let response = close
                .response
                .map(|code| close_payload(code.into(), &[]))
                .unwrap_or_default();
            if let Err(err) = self.do_write(OpCode::Close, &response).await {
                tracing::debug!(error = %err, "failed to acknowledge close frame");
            }

            tracing::debug!(code = close.code, "websocket connection closed by peer");
            self.handler.on_close(
                self,
                CloseOutcome {
                    code: close.code,
                    reason: close.reason,
                    origin: CloseOrigin::Peer,
                },
            );
        }

        Err(WebSocketError::ConnectionClosed)
    }
}

impl<S: Transport> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.role)
            .field("compress_enabled", &self.compress_enabled)
            .field("closed", &self.is_closed())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
