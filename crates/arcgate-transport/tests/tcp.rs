//! Integration tests for the TCP transport.

use std::time::Duration;

use arcgate_protocol::{Decoder, Encoder, Flags, Msg, Payload};
use arcgate_transport::{
    Conn, SequencedBuffer, TcpConn, TcpTransport, Transceiver, Transport, TransportError,
    DEFAULT_BUFFER_CAPACITY,
};
use bytes::Bytes;

async fn connected_pair() -> (TcpConn, TcpConn) {
    let mut transport = TcpTransport::bind("127.0.0.1:0").await.expect("should bind");
    let addr = transport.local_addr().expect("bound address");
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let client = TcpConn::connect(addr).await.expect("should connect");
    (server.await.unwrap(), client)
}

#[tokio::test]
async fn test_tcp_read_write_both_ways() {
    let (server, client) = connected_pair().await;
    assert_ne!(server.id(), client.id());
    assert!(server.peer_addr().is_some());

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 8];
    let n = server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    server.write_all(b"pong").await.unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test]
async fn test_tcp_close_reads_as_eof() {
    let (server, client) = connected_pair().await;
    client.close().await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_transceiver_reports_closed_peer() {
    let (server, client) = connected_pair().await;
    let server = Transceiver::new(
        server,
        Encoder::new(),
        Decoder::default(),
        SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY),
        Duration::from_secs(2),
    );
    let client = Transceiver::new(
        client,
        Encoder::new(),
        Decoder::default(),
        SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY),
        Duration::from_secs(2),
    );

    let msg = Msg::Payload(Payload {
        data: Bytes::from_static(b"state"),
    });
    client.send(Flags::SEQUENCED, &msg).await.unwrap();
    assert_eq!(server.recv().await.unwrap().msg, msg);

    client.close().await.unwrap();
    assert!(matches!(
        server.recv().await,
        Err(TransportError::ConnectionClosed(_))
    ));
}
