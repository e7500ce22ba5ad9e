mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use common::*;
use hpx_wsengine::{
    CloseOrigin, CloseOutcome, Config, Conn, EventHandler, OpCode, Options, Role, Transport,
    WebSocketError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn peer_close_response(payload: &[u8], options: Options) -> (u16, CloseOutcome) {
    let (socket, mut peer, mut rx) = spawn_server(options);

    send_frame(&mut peer, client_header(true, OpCode::Close, payload.len()), payload).await;

    let (header, response) = read_frame(&mut peer).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert!(header.mask.is_none());
    // the acknowledgement carries the code only
    assert!(response.len() == 2 || response.is_empty());

    let outcome = next_close(&mut rx).await;
    assert!(socket.is_closed());
    (close_code(&response), outcome)
}

#[tokio::test]
async fn test_normal_close_passes_through() {
    let (code, outcome) = peer_close_response(&close_frame(1000, b"bye"), Options::default()).await;
    assert_eq!(code, 1000);
    assert_eq!(outcome.code, 1000);
    assert_eq!(&outcome.reason[..], b"bye");
    assert_eq!(outcome.origin, CloseOrigin::Peer);
}

#[tokio::test]
async fn test_reserved_code_is_protocol_error() {
    let (code, outcome) = peer_close_response(&close_frame(1005, b""), Options::default()).await;
    assert_eq!(code, 1002);
    assert_eq!(outcome.code, 1005);
}

#[tokio::test]
async fn test_single_byte_close_is_protocol_error() {
    let (code, outcome) = peer_close_response(&[0x03], Options::default()).await;
    assert_eq!(code, 1002);
    assert_eq!(outcome.code, 3);
}

#[tokio::test]
async fn test_empty_close_is_acknowledged_empty() {
    let (code, outcome) = peer_close_response(&[], Options::default()).await;
    assert_eq!(code, 0);
    assert_eq!(outcome.code, 0);
}

#[tokio::test]
async fn test_application_code_is_echoed() {
    let (code, _) = peer_close_response(&close_frame(4001, b""), Options::default()).await;
    assert_eq!(code, 4001);
}

#[tokio::test]
async fn test_registered_code_is_acknowledged_normal() {
    let (code, outcome) = peer_close_response(&close_frame(1001, b""), Options::default()).await;
    assert_eq!(code, 1000);
    assert_eq!(outcome.code, 1001);
}

#[tokio::test]
async fn test_invalid_close_reason() {
    let payload = close_frame(1000, &[0xC3, 0x28]);
    let (code, _) = peer_close_response(&payload, Options::default().with_utf8()).await;
    assert_eq!(code, 1007);
}

#[tokio::test]
async fn test_write_close_sends_code_and_reason() {
    let (socket, mut peer, mut rx) = spawn_server(Options::default());

    socket.write_close(4000, b"maintenance").await;
    assert!(socket.is_closed());

    let (header, payload) = read_frame(&mut peer).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert_eq!(close_code(&payload), 4000);
    assert_eq!(&payload[2..], b"maintenance");

    let outcome = next_close(&mut rx).await;
    assert_eq!(outcome.code, 4000);
    assert_eq!(outcome.origin, CloseOrigin::Local);

    // the read loop was aborted and shut the transport down
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, peer.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_write_close_keeps_raw_reason() {
    let (socket, mut peer, mut rx) = spawn_server(Options::default());
    let reason = [0xFF, 0xFE, b'x'];
    socket.write_close(4000, &reason).await;

    let (header, payload) = read_frame(&mut peer).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert_eq!(close_code(&payload), 4000);
    assert_eq!(&payload[2..], reason);

    let outcome = next_close(&mut rx).await;
    assert_eq!(&outcome.reason[..], reason);
    assert!(outcome.reason_str().is_none());
}

#[tokio::test]
async fn test_write_close_without_code() {
    let (socket, mut peer, _rx) = spawn_server(Options::default());
    socket.write_close(0, b"ignored").await;
    let (header, payload) = read_frame(&mut peer).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn test_long_reason_is_truncated() {
    let (socket, mut peer, _rx) = spawn_server(Options::default());
    let reason = "ü".repeat(100);
    socket.write_close(1000, reason.as_bytes()).await;

    let (_, payload) = read_frame(&mut peer).await;
    assert!(payload.len() <= 125);
    assert_eq!(close_code(&payload), 1000);
    assert!(std::str::from_utf8(&payload[2..]).is_ok());
}

#[tokio::test]
async fn test_operations_after_close() {
    let (socket, _peer, mut rx) = spawn_server(Options::default());
    socket.write_close(1000, b"").await;
    next_close(&mut rx).await;

    assert!(matches!(
        socket.write_string("late").await,
        Err(WebSocketError::ConnectionClosed)
    ));
    assert!(matches!(
        socket.write_async(OpCode::Text, b"late"),
        Err(WebSocketError::ConnectionClosed)
    ));
    assert!(matches!(
        socket.set_deadline(Some(Instant::now())),
        Err(WebSocketError::ConnectionClosed)
    ));
}

/// Counts close callbacks.
struct CloseCounter(Arc<AtomicUsize>);

impl<S: Transport> EventHandler<S> for CloseCounter {
    fn on_close(&self, _socket: &Arc<Conn<S>>, _outcome: CloseOutcome) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_happens_once_under_concurrent_triggers() {
    init_tracing();
    for _ in 0..20 {
        let config = Config::new(&Options::default().with_max_payload_write(16), Role::Server);
        let closes = Arc::new(AtomicUsize::new(0));
        let (stream, mut peer) = tokio::io::duplex(64 * 1024);
        let socket = Conn::new(
            Role::Server,
            stream,
            Bytes::new(),
            config,
            false,
            CloseCounter(Arc::clone(&closes)),
        );

        let reader = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move { socket.read_loop().await })
        };
        let oversized = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let _ = socket.write_binary(&[0u8; 17]).await;
            })
        };
        let explicit = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move { socket.write_close(4000, b"explicit").await })
        };
        // an unmasked frame is a protocol error for the reader
        let _ = peer.write_all(&[0x81, 0x01, b'x']).await;

        oversized.await.unwrap();
        explicit.await.unwrap();
        tokio::time::timeout(TIMEOUT, reader).await.unwrap().unwrap();

        let mut wire = Vec::new();
        tokio::time::timeout(TIMEOUT, peer.read_to_end(&mut wire))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let mut close_frames = 0;
        let mut rest = &wire[..];
        while let Some((header, used)) = hpx_wsengine::FrameHeader::parse(rest).unwrap() {
            assert_eq!(header.opcode, OpCode::Close);
            close_frames += 1;
            rest = &rest[used + header.payload_len as usize..];
        }
        assert!(rest.is_empty());
        assert!(close_frames <= 1);
    }
}

#[tokio::test]
async fn test_read_deadline_aborts_read() {
    let (socket, mut peer, mut rx) = spawn_server(Options::default());
    socket
        .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
        .unwrap();

    let outcome = next_close(&mut rx).await;
    assert_eq!(outcome.origin, CloseOrigin::Local);
    assert_eq!(outcome.code, 1000);
    assert!(outcome.reason_str().unwrap().contains("deadline"));

    let (header, payload) = read_frame(&mut peer).await;
    assert_eq!(header.opcode, OpCode::Close);
    assert_eq!(close_code(&payload), 1000);
}

#[tokio::test]
async fn test_cleared_deadline_keeps_reading() {
    let (socket, mut peer, mut rx) = spawn_server(Options::default());
    socket
        .set_deadline(Some(Instant::now() + Duration::from_millis(20)))
        .unwrap();
    socket.set_deadline(None).unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    send_frame(&mut peer, client_header(true, OpCode::Text, 2), b"hi").await;
    let (opcode, payload) = next_message(&mut rx).await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, b"hi");
    assert!(!socket.is_closed());
}

/// Floods the server with binary frames, closes it locally after the first message and
/// checks that the close callback was the last one.
async fn close_while_flooded(options: Options) {
    let (socket, peer, mut rx) = spawn_server(options);
    let (mut peer_rx, mut peer_tx) = tokio::io::split(peer);

    let flood = tokio::spawn(async move {
        for i in 0..100_000u32 {
            send_frame(
                &mut peer_tx,
                client_header(true, OpCode::Binary, 4),
                &i.to_be_bytes(),
            )
            .await;
        }
    });

    next_message(&mut rx).await;
    socket.write_close(1000, b"").await;
    assert!(socket.is_closed());

    let (header, _) = read_frame(&mut peer_rx).await;
    assert_eq!(header.opcode, OpCode::Close);
    // the read loop ended and shut the transport down
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, peer_rx.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    flood.abort();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let close = events
        .iter()
        .position(|event| matches!(event, Event::Close(_)))
        .expect("close was not reported");
    assert_eq!(close, events.len() - 1, "callbacks after close: {:?}", &events[close..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_message_after_local_close() {
    close_while_flooded(Options::default().with_read_buffer_size(16)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_queued_message_after_local_close() {
    close_while_flooded(Options::default().with_read_async(4)).await;
}
