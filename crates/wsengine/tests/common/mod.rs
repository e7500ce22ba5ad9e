#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hpx_wsengine::{
    CloseOutcome, Config, Conn, EventHandler, FrameHeader, Message, OpCode, Options, Role,
    Transport, frame::MAX_HEADER_SIZE, mask::apply_mask,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Event {
    Open,
    Message(OpCode, Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(CloseOutcome),
}

/// Handler forwarding every callback to a channel, optionally echoing messages back.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
    echo: bool,
}

impl<S: Transport> EventHandler<S> for Recorder {
    fn on_open(&self, _socket: &Arc<Conn<S>>) {
        let _ = self.tx.send(Event::Open);
    }

    fn on_close(&self, _socket: &Arc<Conn<S>>, outcome: CloseOutcome) {
        let _ = self.tx.send(Event::Close(outcome));
    }

    fn on_ping(&self, socket: &Arc<Conn<S>>, payload: &[u8]) {
        let _ = self.tx.send(Event::Ping(payload.to_vec()));
        let _ = socket.write_async(OpCode::Pong, payload);
    }

    fn on_pong(&self, _socket: &Arc<Conn<S>>, payload: &[u8]) {
        let _ = self.tx.send(Event::Pong(payload.to_vec()));
    }

    fn on_message(&self, socket: &Arc<Conn<S>>, message: Message) {
        if self.echo {
            let _ = socket.write_async(message.opcode(), message.payload());
        }
        let _ = self
            .tx
            .send(Event::Message(message.opcode(), message.into_vec()));
    }
}

pub fn recorder(echo: bool) -> (Recorder, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Recorder { tx, echo }, rx)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server connection on one end of an in-memory pipe; the other end is returned for a raw
/// peer to drive.
pub fn server(
    config: &Arc<Config>,
    compress: bool,
    buffer: usize,
) -> (
    Arc<Conn<DuplexStream>>,
    DuplexStream,
    mpsc::UnboundedReceiver<Event>,
) {
    init_tracing();
    let (stream, peer) = tokio::io::duplex(buffer);
    let (handler, rx) = recorder(false);
    let socket = Conn::new(
        Role::Server,
        stream,
        Bytes::new(),
        Arc::clone(config),
        compress,
        handler,
    );
    (socket, peer, rx)
}

/// Server connection with its read loop running.
pub fn spawn_server(
    options: Options,
) -> (
    Arc<Conn<DuplexStream>>,
    DuplexStream,
    mpsc::UnboundedReceiver<Event>,
) {
    let config = Config::new(&options, Role::Server);
    let compress = config.compress_enabled;
    let (socket, peer, rx) = server(&config, compress, 64 * 1024);
    let reader = Arc::clone(&socket);
    tokio::spawn(async move { reader.read_loop().await });
    (socket, peer, rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skips events until the close callback.
pub async fn next_close(rx: &mut mpsc::UnboundedReceiver<Event>) -> CloseOutcome {
    loop {
        if let Event::Close(outcome) = next_event(rx).await {
            return outcome;
        }
    }
}

pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<Event>) -> (OpCode, Vec<u8>) {
    loop {
        match next_event(rx).await {
            Event::Message(opcode, payload) => return (opcode, payload),
            Event::Close(outcome) => panic!("closed before a message arrived: {outcome:?}"),
            _ => {}
        }
    }
}

/// Header of a frame sent by a client.
pub fn client_header(fin: bool, opcode: OpCode, len: usize) -> FrameHeader {
    FrameHeader::generate(Role::Client, fin, false, opcode, len)
}

/// Writes one frame as given, masking the payload with the header's key.
pub async fn send_frame<W: AsyncWrite + Unpin>(peer: &mut W, header: FrameHeader, payload: &[u8]) {
    let mut head = [0u8; MAX_HEADER_SIZE];
    let n = header.encode(&mut head);
    let mut body = payload.to_vec();
    if let Some(mask) = header.mask {
        apply_mask(&mut body, mask);
    }
    peer.write_all(&head[..n]).await.unwrap();
    peer.write_all(&body).await.unwrap();
}

/// Reads one frame and unmasks its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(peer: &mut R) -> (FrameHeader, Vec<u8>) {
    tokio::time::timeout(TIMEOUT, async {
        let header = FrameHeader::read_from(peer).await.unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        peer.read_exact(&mut payload).await.unwrap();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }
        (header, payload)
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Status code of a close payload, 0 when empty.
pub fn close_code(payload: &[u8]) -> u16 {
    match payload {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

pub fn close_frame(code: u16, reason: &[u8]) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason);
    payload
}
