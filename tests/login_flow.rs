//! End-to-end handshake scenarios against a scripted server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use openq::config::EngineConfig;
use openq::core::codec::extract_one;
use openq::core::crypt;
use openq::core::packet::Packet;
use openq::error::ProtocolError;
use openq::service::client::{Client, ClientEvent};

const UID: u32 = 10001;
const PASSWORD: &str = "hunter2";
const TOKEN: &[u8] = b"token-bytes";

const CMD_LOGIN: u16 = 0x0022;
const CMD_TOKEN: u16 = 0x0062;
const CMD_CHECK_PWD: u16 = 0x00DD;

fn pw_key() -> [u8; 16] {
    let once: [u8; 16] = Md5::digest(PASSWORD.as_bytes()).into();
    Md5::digest(once).into()
}

/// One accepted connection on the scripted side.
struct WireServer {
    stream: TcpStream,
    acc: BytesMut,
}

impl WireServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            acc: BytesMut::new(),
        }
    }

    async fn read(&mut self) -> Packet {
        loop {
            if let Some(packet) = extract_one(&mut self.acc) {
                return packet;
            }
            let n = self.stream.read_buf(&mut self.acc).await.unwrap();
            assert!(n > 0, "client closed mid-script");
        }
    }

    async fn reply(&mut self, request: &Packet, payload: Vec<u8>) {
        let packet = Packet {
            cmd: request.cmd,
            seq: request.seq,
            uid: request.uid,
            payload: Bytes::from(payload),
        };
        self.stream
            .write_all(&packet.encode_stream())
            .await
            .unwrap();
    }
}

fn token_reply() -> Vec<u8> {
    let mut body = vec![0x00, TOKEN.len() as u8];
    body.extend_from_slice(TOKEN);
    body
}

fn login_ok_body(session_key: [u8; 16]) -> Vec<u8> {
    let mut body = vec![0x00];
    body.extend_from_slice(&session_key);
    body.extend_from_slice(&UID.to_be_bytes());
    body.resize(139, 0);
    body
}

fn config_for(port: u16) -> EngineConfig {
    EngineConfig::default_with_overrides(|c| {
        c.network.servers = vec!["127.0.0.1".into()];
        c.network.port = port;
        c.timing.scan_interval = std::time::Duration::from_secs(30);
    })
}

async fn wait_for_login(events: &mut mpsc::Receiver<ClientEvent>) {
    loop {
        match events.recv().await.expect("event channel closed early") {
            ClientEvent::LoggedIn { uid } => {
                assert_eq!(uid, UID);
                return;
            }
            ClientEvent::Fatal { reason } => panic!("unexpected fatal: {reason}"),
            _ => {}
        }
    }
}

/// A redirect reply must produce exactly one fresh connection to the
/// nominated address, with the handshake restarted from the token request.
#[tokio::test]
async fn redirect_then_ok_uses_exactly_two_connections() {
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_port = first.local_addr().unwrap().port();
    let second_port = second.local_addr().unwrap().port();

    let first_accepts = Arc::new(AtomicUsize::new(0));
    let second_accepts = Arc::new(AtomicUsize::new(0));

    let counter = first_accepts.clone();
    tokio::spawn(async move {
        let mut server = WireServer::accept(&first).await;
        counter.fetch_add(1, Ordering::SeqCst);

        let token_req = server.read().await;
        assert_eq!(token_req.cmd, CMD_TOKEN);
        server.reply(&token_req, token_reply()).await;

        let login = server.read().await;
        assert_eq!(login.cmd, CMD_LOGIN);
        let mut body = vec![0x01];
        body.extend_from_slice(&UID.to_be_bytes());
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.extend_from_slice(&second_port.to_be_bytes());
        server.reply(&login, crypt::encrypt(&body, &pw_key())).await;
    });

    let counter = second_accepts.clone();
    tokio::spawn(async move {
        let mut server = WireServer::accept(&second).await;
        counter.fetch_add(1, Ordering::SeqCst);

        let token_req = server.read().await;
        assert_eq!(token_req.cmd, CMD_TOKEN);
        server.reply(&token_req, token_reply()).await;

        let login = server.read().await;
        assert_eq!(login.cmd, CMD_LOGIN);
        server
            .reply(&login, crypt::encrypt(&login_ok_body([0x42; 16]), &pw_key()))
            .await;

        // Keep the socket alive for the bootstrap traffic.
        let _ = server.read().await;
    });

    let (_client, mut events) = Client::spawn(config_for(first_port), UID, PASSWORD).unwrap();
    wait_for_login(&mut events).await;

    assert_eq!(first_accepts.load(Ordering::SeqCst), 1);
    assert_eq!(second_accepts.load(Ordering::SeqCst), 1);
}

/// A captcha challenge is answered through a separate verification command;
/// the original login packet is never sent a second time.
#[tokio::test]
async fn captcha_is_verified_without_resending_login() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<u16>();

    let image = vec![0xFF, 0xD8, 1, 2, 3, 4];
    let server_image = image.clone();
    tokio::spawn(async move {
        let mut server = WireServer::accept(&listener).await;

        let token_req = server.read().await;
        seen_tx.send(token_req.cmd).unwrap();
        server.reply(&token_req, token_reply()).await;

        let login = server.read().await;
        seen_tx.send(login.cmd).unwrap();
        let mut body = vec![0x07];
        body.extend_from_slice(&(server_image.len() as u16).to_be_bytes());
        body.extend_from_slice(&server_image);
        body.push(4);
        body.extend_from_slice(b"cont");
        server.reply(&login, crypt::encrypt(&body, &pw_key())).await;

        let verify = server.read().await;
        seen_tx.send(verify.cmd).unwrap();
        assert_eq!(verify.cmd, CMD_CHECK_PWD);
        server
            .reply(&verify, crypt::encrypt(&login_ok_body([0x24; 16]), &pw_key()))
            .await;

        let next = server.read().await;
        seen_tx.send(next.cmd).unwrap();
    });

    let (client, mut events) = Client::spawn(config_for(port), UID, PASSWORD).unwrap();

    let challenge = loop {
        match events.recv().await.unwrap() {
            ClientEvent::CaptchaNeeded(challenge) => break challenge,
            ClientEvent::Fatal { reason } => panic!("unexpected fatal: {reason}"),
            _ => {}
        }
    };
    assert_eq!(challenge.image, image);

    client.answer_captcha("AB12".into()).await.unwrap();
    wait_for_login(&mut events).await;

    // Exactly one login packet crossed the wire.
    let mut seen = Vec::new();
    while let Ok(cmd) = seen_rx.try_recv() {
        seen.push(cmd);
    }
    assert_eq!(seen.iter().filter(|&&c| c == CMD_LOGIN).count(), 1);
    assert!(seen.contains(&CMD_CHECK_PWD));
}

/// A handshake reply that fails to decrypt can never be matched again, so
/// the task must end fatally rather than stall with the login transaction
/// already consumed.
#[tokio::test]
async fn corrupted_login_reply_is_fatal_not_a_stall() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut server = WireServer::accept(&listener).await;

        let token_req = server.read().await;
        server.reply(&token_req, token_reply()).await;

        let login = server.read().await;
        assert_eq!(login.cmd, CMD_LOGIN);
        // Garbage of a block-aligned length: decrypts under neither key.
        server.reply(&login, vec![0x5A; 24]).await;
    });

    let (client, mut events) = Client::spawn(config_for(port), UID, PASSWORD).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::Fatal { .. } => break,
            ClientEvent::LoggedIn { .. } => panic!("login should not succeed"),
            _ => {}
        }
    }
    assert!(client.join().await.is_err());
}

/// Answering a captcha that was never asked for is an embedder mistake;
/// it must not take a healthy connection down.
#[tokio::test]
async fn stray_captcha_answer_does_not_end_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut server = WireServer::accept(&listener).await;

        let token_req = server.read().await;
        server.reply(&token_req, token_reply()).await;

        let login = server.read().await;
        server
            .reply(&login, crypt::encrypt(&login_ok_body([0x11; 16]), &pw_key()))
            .await;

        // Keep the socket alive for the bootstrap traffic.
        let _ = server.read().await;
    });

    let (client, mut events) = Client::spawn(config_for(port), UID, PASSWORD).unwrap();
    client.answer_captcha("0000".into()).await.unwrap();
    wait_for_login(&mut events).await;
}

/// A wrong-password reply (encrypted under the seed key the client sent)
/// ends the task with a fatal error instead of a reconnect loop.
#[tokio::test]
async fn wrong_password_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut server = WireServer::accept(&listener).await;

        let token_req = server.read().await;
        server.reply(&token_req, token_reply()).await;

        let login = server.read().await;
        let mut seed = [0u8; 16];
        seed.copy_from_slice(&login.payload[..16]);

        let mut body = vec![0x05];
        body.extend_from_slice(b"denied");
        server.reply(&login, crypt::encrypt(&body, &seed)).await;
    });

    let (client, mut events) = Client::spawn(config_for(port), UID, PASSWORD).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::Fatal { reason } => {
                assert!(reason.contains("denied"));
                break;
            }
            ClientEvent::LoggedIn { .. } => panic!("login should not succeed"),
            _ => {}
        }
    }

    match client.join().await {
        Err(ProtocolError::WrongPassword(msg)) => assert_eq!(msg, "denied"),
        other => panic!("expected wrong-password error, got {other:?}"),
    }
}
