//! Sending one message to many connections.
//!
//! Writing the same message with [`Conn::write_async`] compresses and masks it once per
//! connection. A [`Broadcaster`] builds the frame once per variant (plain and compressed) and
//! queues that single buffer on every target.
//!
//! The frames are shared by the queued writes and released once the broadcaster has been
//! released (or dropped) and every queued write has run. Each queued write holds a clone of
//! the shared state, the broadcaster handle holds one more, so the frames go back to the
//! pool exactly when the last of them is gone.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;

use crate::{Result, conn::Conn, frame::OpCode, transport::Transport, writer::Frame};

struct Shared {
    opcode: OpCode,
    payload: Bytes,
    /// Indexed by the target's compression flag.
    frames: [OnceLock<Result<Frame>>; 2],
    pending: AtomicUsize,
}

/// Builds a message once and queues it on many connections.
///
/// Frames are built for the role of the first connection of each variant; all targets of
/// one broadcaster must play the same role.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
///
/// use hpx_wsengine::{Broadcaster, Conn, OpCode};
/// use tokio::net::TcpStream;
///
/// fn announce(sockets: &[Arc<Conn<TcpStream>>]) {
///     let broadcaster = Broadcaster::new(OpCode::Text, "server restarting in 5 minutes");
///     for socket in sockets {
///         let _ = broadcaster.broadcast(socket);
///     }
///     broadcaster.release();
/// }
/// ```
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            shared: Arc::new(Shared {
                opcode,
                payload: payload.into(),
                frames: [OnceLock::new(), OnceLock::new()],
                pending: AtomicUsize::new(0),
            }),
        }
    }

    /// Queues the message on `socket`.
    ///
    /// The first call for each compression variant builds the frame; a build error is kept
    /// and returned to every later caller of that variant. Write errors close the target and
    /// surface through its `on_close`.
    pub fn broadcast<S: Transport>(&self, socket: &Arc<Conn<S>>) -> Result<()> {
        let index = usize::from(socket.compress_enabled());
        let built = self.shared.frames[index].get_or_init(|| {
            socket
                .frame_writer()
                .generate(self.shared.opcode, &self.shared.payload)
        });
        if let Err(err) = built {
            return Err(err.replicate());
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        let conn = Arc::clone(socket);
        socket.write_queue.push(async move {
            if let Some(Ok(frame)) = shared.frames[index].get() {
                conn.write_queued(frame.as_bytes()).await;
            }
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    /// Number of queued writes that have not run yet.
    pub fn pending_writes(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Declares that no more connections will be targeted.
    ///
    /// The frames are returned to the pool as soon as every queued write has finished.
    /// Dropping the broadcaster has the same effect.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("opcode", &self.shared.opcode)
            .field("len", &self.shared.payload.len())
            .field("pending", &self.pending_writes())
            .finish()
    }
}
