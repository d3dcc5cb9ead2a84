//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and dial it with
//! [`WebSocketConnection::connect`], so both halves of the link are the
//! crate's own types.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use relayforge_transport::{
        Connection, Transport, TransportError, WebSocketConnection, WebSocketTransport,
    };

    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("should have addr");
        (transport, format!("ws://{addr}"))
    }

    #[tokio::test]
    async fn test_websocket_dial_accept_and_exchange() {
        let (mut transport, url) = bind().await;

        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let client = WebSocketConnection::connect(&url)
            .await
            .expect("client should connect");
        let server_conn = server.await.expect("task should complete");

        assert_ne!(client.id(), server_conn.id());

        client.send(b"hello scene").await.expect("send should succeed");
        let received = server_conn
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(received, b"hello scene");

        server_conn.send(b"hello gateway").await.unwrap();
        let received = client.recv().await.unwrap().unwrap();
        assert_eq!(received, b"hello gateway");
    }

    #[tokio::test]
    async fn test_websocket_send_not_blocked_by_pending_recv() {
        let (mut transport, url) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = std::sync::Arc::new(WebSocketConnection::connect(&url).await.unwrap());
        let server_conn = server.await.unwrap();

        // Park a reader on the client; a concurrent send must still go out.
        let reader = {
            let client = std::sync::Arc::clone(&client);
            tokio::spawn(async move { client.recv().await })
        };
        tokio::time::timeout(Duration::from_secs(2), client.send(b"ping"))
            .await
            .expect("send must not wait for the reader")
            .unwrap();

        assert_eq!(server_conn.recv().await.unwrap().unwrap(), b"ping");
        server_conn.send(b"pong").await.unwrap();
        let echoed = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(echoed, b"pong");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_peer_close() {
        let (mut transport, url) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = WebSocketConnection::connect(&url).await.unwrap();
        let server_conn = server.await.unwrap();

        client.close().await.expect("close should succeed");

        let result = server_conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on peer close");
    }

    #[tokio::test]
    async fn test_websocket_connect_to_closed_port_fails() {
        let (transport, url) = bind().await;
        drop(transport);

        let result = WebSocketConnection::connect(&url).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_websocket_shutdown_wakes_parked_accept() {
        let (mut transport, _url) = bind().await;
        let stop = transport.shutdown_handle();

        let parked = tokio::spawn(async move { transport.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), parked)
            .await
            .expect("accept should return promptly")
            .expect("task should complete");
        assert!(matches!(result, Err(TransportError::Shutdown)));
        assert!(stop.is_shutdown());
    }

    #[tokio::test]
    async fn test_websocket_accept_after_shutdown_fails_immediately() {
        let (mut transport, _url) = bind().await;
        transport.shutdown().await.expect("shutdown should succeed");

        let result = transport.accept().await;
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn test_websocket_connections_know_their_peer() {
        let (mut transport, url) = bind().await;
        let listen_addr = transport.local_addr().unwrap();
        let server = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = WebSocketConnection::connect(&url).await.unwrap();
        let server_conn = server.await.unwrap();

        assert_eq!(client.peer_addr(), Some(listen_addr));
        assert!(server_conn.peer_addr().is_some());
    }
}
