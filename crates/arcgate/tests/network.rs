//! End-to-end tests over real sockets.

use std::time::Duration;

use arcgate::prelude::*;
use bytes::Bytes;

async fn recv(rx: &mut tokio::sync::mpsc::Receiver<Bytes>) -> Bytes {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("data should arrive")
        .expect("data channel open")
}

#[tokio::test]
async fn test_tcp_session_echoes() {
    let transport = TcpTransport::bind("127.0.0.1:0").await.expect("should bind");
    let addr = transport.local_addr().expect("bound address");
    let gateway = Gateway::builder()
        .on_data(|session: &Session<TcpConn>, data| {
            session.send_data(data)?;
            Ok(())
        })
        .build(NoAuth);
    let serving = gateway.clone();
    tokio::spawn(async move { serving.serve(transport).await });

    let conn = TcpConn::connect(addr).await.expect("should connect");
    let client = Client::connect(conn, ClientConfig::default())
        .await
        .expect("handshake should succeed");
    let mut data = client.take_data_receiver().unwrap();

    client.send_data(Bytes::from_static(b"over tcp")).unwrap();
    assert_eq!(recv(&mut data).await.as_ref(), b"over tcp");
    assert_eq!(gateway.session_count(), 1);

    client.shutdown().await;
    assert!(gateway.shutdown(Duration::from_secs(5)).await);
}

mod websocket {
    use super::*;

    use tokio::net::TcpStream;
    use tokio_tungstenite::MaybeTlsStream;

    async fn dial(addr: &str) -> WebSocketConn<MaybeTlsStream<TcpStream>> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        WebSocketConn::new(ws, None)
    }

    #[tokio::test]
    async fn test_websocket_session_echoes_encrypted() {
        let transport = WebSocketTransport::bind("127.0.0.1:0").await.expect("should bind");
        let addr = transport.local_addr().expect("bound address").to_string();
        let gateway = Gateway::builder()
            .on_data(|session: &Session<WebSocketConn<TcpStream>>, data| {
                session.send_data(data)?;
                Ok(())
            })
            .build(NoAuth);
        let serving = gateway.clone();
        tokio::spawn(async move { serving.serve(transport).await });

        let config = ClientConfig {
            handshake: HandshakeConfig {
                cipher_suite: CipherSuite::chacha20_poly1305(),
                ..HandshakeConfig::default()
            },
            ..ClientConfig::default()
        };
        let client = Client::connect(dial(&addr).await, config)
            .await
            .expect("handshake should succeed");
        let mut data = client.take_data_receiver().unwrap();

        for text in ["first", "second", "third"] {
            client.send_data(Bytes::from(text)).unwrap();
            assert_eq!(recv(&mut data).await.as_ref(), text.as_bytes());
        }
        assert_eq!(gateway.session_count(), 1);
    }
}
