//! Integration tests for the WebSocket transport.
//!
//! These spin up a real WebSocket listener and a `tokio-tungstenite`
//! client to verify that bytes flow over the network, and that frames
//! sent through a [`Transceiver`] survive WebSocket message boundaries.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use arcgate_protocol::{Decoder, Encoder, Flags, Msg, Payload};
    use arcgate_transport::{
        Conn, SequencedBuffer, Transceiver, Transport, WebSocketConn, WebSocketTransport,
        DEFAULT_BUFFER_CAPACITY,
    };
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    /// Binds on an OS-assigned port and returns the transport with its
    /// address.
    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("bound address").to_string();
        (transport, addr)
    }

    async fn connect_client(
        addr: &str,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("client should connect");
        ws
    }

    #[tokio::test]
    async fn test_websocket_accept_and_read_write() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let mut client = connect_client(&addr).await;
        let server_conn = server.await.expect("task should complete");

        assert!(server_conn.id().into_inner() > 0);
        assert!(server_conn.peer_addr().is_some());

        // --- Server writes, client receives ---
        server_conn
            .write_all(b"hello from server")
            .await
            .expect("write should succeed");
        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data().as_ref(), b"hello from server");

        // --- Client sends, server reads ---
        client
            .send(Message::Binary(b"hello from client".to_vec().into()))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = server_conn.read(&mut buf).await.expect("read should succeed");
        assert_eq!(&buf[..n], b"hello from client");
    }

    #[tokio::test]
    async fn test_websocket_read_splits_large_messages() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let mut client = connect_client(&addr).await;
        let server_conn = server.await.unwrap();

        client
            .send(Message::Binary(vec![7u8; 10].into()))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        let mut total = 0;
        while total < 10 {
            let n = server_conn.read(&mut buf).await.unwrap();
            assert!(buf[..n].iter().all(|b| *b == 7));
            total += n;
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_websocket_close_reads_as_eof() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let mut client = connect_client(&addr).await;
        let server_conn = server.await.unwrap();

        client.close(None).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(server_conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transceivers_exchange_frames_over_websocket() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let client_ws = connect_client(&addr).await;
        let server_conn = server.await.unwrap();

        let timeout = Duration::from_secs(2);
        let server = Transceiver::new(
            server_conn,
            Encoder::new(),
            Decoder::default(),
            SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY),
            timeout,
        );
        let client = Transceiver::new(
            WebSocketConn::new(client_ws, None),
            Encoder::new(),
            Decoder::default(),
            SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY),
            timeout,
        );

        for i in 0..3u8 {
            let msg = Msg::Payload(Payload {
                data: Bytes::from(vec![i; 100]),
            });
            client.send(Flags::SEQUENCED, &msg).await.unwrap();
        }
        for i in 0..3u8 {
            let event = server.recv().await.unwrap();
            assert_eq!(event.head.seq, u32::from(i));
            assert_eq!(
                event.msg,
                Msg::Payload(Payload {
                    data: Bytes::from(vec![i; 100])
                })
            );
        }
    }
}
