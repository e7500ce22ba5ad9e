//! Byte streams a connection runs on, and the deadlines that bound their I/O.

use std::{future::Future, io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::TcpStream,
    sync::watch,
    time::Instant,
};

/// A full-duplex byte stream that has completed the WebSocket handshake.
///
/// Address lookups default to `None` and socket options to no-ops for streams that have no
/// socket underneath.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Local socket address, if any.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote socket address, if any.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Sets TCP_NODELAY, disabling Nagle's algorithm when `nodelay` is true.
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        let _ = nodelay;
        Ok(())
    }
}

impl Transport for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

impl Transport for DuplexStream {}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}

/// Point in time after which pending I/O on one direction of a connection fails.
///
/// Changing the deadline also affects operations that are already waiting, which is how a
/// closing connection aborts a blocked read.
#[derive(Debug)]
pub(crate) struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    /// Sets or clears the deadline. `None` waits forever.
    pub(crate) fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    /// Expires the deadline immediately.
    pub(crate) fn expire_now(&self) {
        self.set(Some(Instant::now()));
    }

    /// Returns `true` once the deadline has passed.
    pub(crate) fn is_expired(&self) -> bool {
        self.tx.borrow().is_some_and(|at| at <= Instant::now())
    }

    /// Runs `fut` until it completes or the deadline passes.
    ///
    /// An elapsed deadline yields an [`io::ErrorKind::TimedOut`] error converted into `E`.
    /// Once the deadline has passed `fut` is not polled at all, even if it could complete
    /// right away.
    pub(crate) async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<io::Error>,
    {
        let mut rx = self.tx.subscribe();
        tokio::pin!(fut);

        loop {
            let current = *rx.borrow_and_update();
            if current.is_some_and(|at| at <= Instant::now()) {
                return Err(timed_out().into());
            }
            let changed = match current {
                None => tokio::select! {
                    biased;
                    res = &mut fut => return res,
                    changed = rx.changed() => changed,
                },
                Some(at) => tokio::select! {
                    biased;
                    res = &mut fut => return res,
                    _ = tokio::time::sleep_until(at) => return Err(timed_out().into()),
                    changed = rx.changed() => changed,
                },
            };

            if changed.is_err() {
                return fut.await;
            }
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}
