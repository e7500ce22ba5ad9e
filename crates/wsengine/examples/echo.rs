//! An echo server and a client talking over an in-memory pipe.
//!
//! The HTTP upgrade is out of scope for the engine, so both ends start right after it: the
//! server echoes every message back, the client sends a few messages, prints the replies and
//! closes.
//!
//! Run with `RUST_LOG=debug cargo run --example echo` to see the connection events.

use std::sync::Arc;

use bytes::Bytes;
use hpx_wsengine::{
    CloseOutcome, Config, Conn, EventHandler, Message, OpCode, Options, Role, Transport,
};
use tokio::sync::mpsc;

struct Echo;

impl<S: Transport> EventHandler<S> for Echo {
    fn on_message(&self, socket: &Arc<Conn<S>>, message: Message) {
        if let Err(e) = socket.write_async(message.opcode(), message.payload()) {
            tracing::error!("echo failed: {e}");
        }
    }

    fn on_close(&self, _socket: &Arc<Conn<S>>, outcome: CloseOutcome) {
        tracing::info!(code = outcome.code, origin = ?outcome.origin, "server side closed");
    }
}

struct Client {
    replies: mpsc::UnboundedSender<String>,
}

impl<S: Transport> EventHandler<S> for Client {
    fn on_message(&self, _socket: &Arc<Conn<S>>, message: Message) {
        let text = match message.opcode() {
            OpCode::Text => message.as_str().unwrap_or_default().to_owned(),
            _ => format!("{} binary bytes", message.payload().len()),
        };
        let _ = self.replies.send(text);
    }

    fn on_pong(&self, _socket: &Arc<Conn<S>>, payload: &[u8]) {
        tracing::info!("pong: {}", String::from_utf8_lossy(payload));
    }

    fn on_close(&self, _socket: &Arc<Conn<S>>, outcome: CloseOutcome) {
        tracing::info!(code = outcome.code, "client side closed");
    }
}

#[tokio::main]
async fn main() -> hpx_wsengine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = Options::default().with_compression().with_utf8();
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);

    let server = Conn::new(
        Role::Server,
        server_io,
        Bytes::new(),
        Config::new(&options, Role::Server),
        true,
        Echo,
    );
    let (tx, mut replies) = mpsc::unbounded_channel();
    let client = Conn::new(
        Role::Client,
        client_io,
        Bytes::new(),
        Config::new(&options, Role::Client),
        true,
        Client { replies: tx },
    );

    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.read_loop().await })
    };
    let client_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.read_loop().await })
    };

    client.write_ping(b"hello?").await?;
    client.write_string("Hello, world!").await?;
    client
        .write_string(&"a long and repetitive line ".repeat(100))
        .await?;
    client.write_binary(&[0u8; 32]).await?;

    for _ in 0..3 {
        match replies.recv().await {
            Some(reply) => println!("echo: {}", reply.chars().take(60).collect::<String>()),
            None => break,
        }
    }

    client.write_close(1000, b"bye").await;
    let _ = tokio::join!(server_task, client_task);
    Ok(())
}
