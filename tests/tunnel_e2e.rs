//! Full dial against a local TLS + WebSocket tunnel server.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::header::{HOST, SEC_WEBSOCKET_PROTOCOL};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use echtunnel::{TunnelClient, TunnelConfig, TunnelError};

const SERVER_NAME: &str = "edge.example";

struct TestServer {
    port: u16,
    fingerprint: String,
    acceptor: TlsAcceptor,
    listener: TcpListener,
}

/// What the tunnel server observed during one session.
#[derive(Debug, Default)]
struct Session {
    sni: Option<String>,
    host: String,
    uri: String,
    protocol: Option<String>,
    address: Option<Message>,
    first_payload: Option<Message>,
}

async fn test_server() -> TestServer {
    let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let fingerprint = Sha256::digest(cert.as_ref())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    TestServer {
        port: listener.local_addr().unwrap().port(),
        fingerprint,
        acceptor: TlsAcceptor::from(Arc::new(config)),
        listener,
    }
}

/// Accept one tunnel, record the handshake, then echo binary payload.
fn serve_one(server: TestServer) -> oneshot::Receiver<Session> {
    let (done, session) = oneshot::channel();
    tokio::spawn(async move {
        let (tcp, _) = server.listener.accept().await.unwrap();
        let tls = server.acceptor.accept(tcp).await.unwrap();

        let mut seen = Session {
            sni: tls.get_ref().1.server_name().map(str::to_string),
            ..Session::default()
        };

        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            seen.host = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            seen.uri = req.uri().to_string();
            if let Some(protocol) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                seen.protocol = protocol.to_str().ok().map(str::to_string);
                resp.headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
            }
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(tls, callback).await.unwrap();

        seen.address = ws.next().await.and_then(|m| m.ok());
        let first = ws.next().await.and_then(|m| m.ok());
        if let Some(Message::Binary(data)) = &first {
            ws.send(Message::Binary(data.clone())).await.unwrap();
        }
        seen.first_payload = first;
        let _ = done.send(seen);

        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Binary(data) => {
                    if ws.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });
    session
}

fn client_config(server: &TestServer) -> TunnelConfig {
    TunnelConfig::builder(SERVER_NAME, server.port)
        .ip("127.0.0.1")
        .token("abc")
        .fingerprint(server.fingerprint.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn dial_through_tls_and_websocket() {
    let server = test_server().await;
    let client = TunnelClient::new(client_config(&server));
    let session = serve_one(server);

    let mut conn = client.dial("10.0.0.5:80").await.unwrap();
    assert_eq!(conn.peer_addr().ip().to_string(), "127.0.0.1");

    let n = conn.write(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    assert_eq!(n, 18);
    conn.flush().await.unwrap();

    let mut echoed = [0u8; 18];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"GET / HTTP/1.0\r\n\r\n");

    let seen = session.await.unwrap();
    assert_eq!(seen.sni.as_deref(), Some(SERVER_NAME));
    assert_eq!(seen.host, SERVER_NAME);
    assert_eq!(seen.uri, "/tunnel?token=abc");
    assert_eq!(seen.protocol.as_deref(), Some("abc"));
    assert_eq!(seen.address, Some(Message::Text("10.0.0.5:80".to_string())));
    assert_eq!(
        seen.first_payload,
        Some(Message::Binary(b"GET / HTTP/1.0\r\n\r\n".to_vec()))
    );

    conn.write_all(b"second").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 6];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"second");

    conn.close().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test]
async fn wrong_pin_fails_handshake() {
    let server = test_server().await;
    let config = TunnelConfig::builder(SERVER_NAME, server.port)
        .ip("127.0.0.1")
        .fingerprint("00".repeat(32))
        .build()
        .unwrap();
    let client = TunnelClient::new(config);

    let acceptor = server.acceptor.clone();
    tokio::spawn(async move {
        if let Ok((tcp, _)) = server.listener.accept().await {
            let _ = acceptor.accept(tcp).await;
        }
    });

    let err = client.dial("10.0.0.5:80").await.unwrap_err();
    assert!(matches!(err, TunnelError::Handshake(_)), "{}", err);
}

#[tokio::test]
async fn ech_without_config_list_fails_handshake() {
    let server = test_server().await;
    let config = TunnelConfig::builder(SERVER_NAME, server.port)
        .ip("127.0.0.1")
        .ech(true)
        .skip_cert_verify(true)
        .build()
        .unwrap();
    let client = TunnelClient::new(config);

    tokio::spawn(async move {
        let _ = server.listener.accept().await;
    });

    let err = client.dial("10.0.0.5:80").await.unwrap_err();
    assert!(matches!(err, TunnelError::Handshake(_)), "{}", err);
}

#[tokio::test]
async fn refused_connection_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = TunnelConfig::builder(SERVER_NAME, port)
        .ip("127.0.0.1")
        .build()
        .unwrap();
    let client = TunnelClient::new(config);

    let err = client.dial("10.0.0.5:80").await.unwrap_err();
    assert!(matches!(err, TunnelError::Transport(_)), "{}", err);
}
