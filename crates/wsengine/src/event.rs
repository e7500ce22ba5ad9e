//! Application callbacks.

use std::sync::Arc;

use crate::{
    close::CloseOutcome,
    conn::Conn,
    frame::OpCode,
    pool::PooledBuf,
    transport::Transport,
};

/// Callbacks a connection invokes as events happen.
///
/// Every method has a default body, so handlers only implement what they need. Callbacks
/// run on the read loop (or the read worker queue for `on_message` with async reads enabled)
/// and should not block; use [`Conn::write_async`] to reply without waiting on the socket.
/// No callback starts once the connection is closed, and closing waits for a running one to
/// return, so `on_close` is always the last call.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
///
/// use hpx_wsengine::{CloseOutcome, Conn, EventHandler, Message, Transport};
///
/// struct Logger;
///
/// impl<S: Transport> EventHandler<S> for Logger {
///     fn on_message(&self, _socket: &Arc<Conn<S>>, message: Message) {
///         println!("{:?}: {} bytes", message.opcode(), message.payload().len());
///     }
///
///     fn on_close(&self, _socket: &Arc<Conn<S>>, outcome: CloseOutcome) {
///         println!("closed with {}", outcome.code);
///     }
/// }
/// ```
pub trait EventHandler<S: Transport>: Send + Sync + 'static {
    /// Called once when the read loop starts.
    fn on_open(&self, socket: &Arc<Conn<S>>) {
        let _ = socket;
    }

    /// Called exactly once when the connection closes, whichever side started it.
    fn on_close(&self, socket: &Arc<Conn<S>>, outcome: CloseOutcome) {
        let _ = (socket, outcome);
    }

    /// Called for every ping. The default replies with a pong carrying the same payload.
    fn on_ping(&self, socket: &Arc<Conn<S>>, payload: &[u8]) {
        let _ = socket.write_async(OpCode::Pong, payload);
    }

    fn on_pong(&self, socket: &Arc<Conn<S>>, payload: &[u8]) {
        let _ = (socket, payload);
    }

    /// Called for every complete text or binary message.
    fn on_message(&self, socket: &Arc<Conn<S>>, message: Message) {
        let _ = (socket, message);
    }
}

/// Lets one handler serve many connections.
impl<S: Transport, H: EventHandler<S>> EventHandler<S> for Arc<H> {
    fn on_open(&self, socket: &Arc<Conn<S>>) {
        (**self).on_open(socket)
    }

    fn on_close(&self, socket: &Arc<Conn<S>>, outcome: CloseOutcome) {
        (**self).on_close(socket, outcome)
    }

    fn on_ping(&self, socket: &Arc<Conn<S>>, payload: &[u8]) {
        (**self).on_ping(socket, payload)
    }

    fn on_pong(&self, socket: &Arc<Conn<S>>, payload: &[u8]) {
        (**self).on_pong(socket, payload)
    }

    fn on_message(&self, socket: &Arc<Conn<S>>, message: Message) {
        (**self).on_message(socket, message)
    }
}

/// A complete message, reassembled and decompressed.
///
/// The payload lives in a pooled buffer that goes back to the pool when the message drops.
#[derive(Debug)]
pub struct Message {
    opcode: OpCode,
    data: PooledBuf,
}

impl Message {
    pub(crate) fn new(opcode: OpCode, data: PooledBuf) -> Self {
        Self { opcode, data }
    }

    /// [`OpCode::Text`] or [`OpCode::Binary`].
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Takes the payload out of the pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut *self.data)
    }
}
