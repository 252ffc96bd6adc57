//! Protocol connection
//!
//! Owns the socket. `connect` performs the logon exchange, then starts
//! two loops: a read loop (receive, frame decode, normalize, dispatch)
//! and a heartbeat loop (periodic send plus silence detection). Both
//! report a terminal [`ConnectionEvent::Lost`] and stop; reconnection is
//! the supervisor's job, gated by the circuit breaker.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

use super::framing::{FrameCodec, WireEncoding};
use super::messages::{type_ids, LogonStatus, NormalizedMessage, Request};
use crate::config::GatewayConfig;
use crate::error::{ConnError, SendError};

/// What the network context delivers to the consumer context
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(NormalizedMessage),
    /// Terminal; no further events follow
    Lost(ConnError),
}

/// Handle for outbound requests on an established connection
#[derive(Clone)]
pub struct Session {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    alive: Arc<AtomicBool>,
    request_ids: Arc<AtomicI64>,
}

impl Session {
    /// Encode and write one request frame
    pub async fn send(&self, request: &Request) -> Result<(), SendError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SendError::Disconnected);
        }
        let bytes = FrameCodec::encode(&request.to_wire())?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Monotonic request id for request/response correlation
    pub fn next_request_id(&self) -> i64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the session dead; loops notice and wind down
    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Connect, log on, and start the read and heartbeat loops.
///
/// Returns the session handle and the ordered inbound message stream.
pub async fn connect(
    cfg: &GatewayConfig,
) -> Result<(Session, mpsc::UnboundedReceiver<ConnectionEvent>), ConnError> {
    let addr = cfg.addr();
    info!("Connecting to gateway at {}", addr);

    let stream = TcpStream::connect(&addr).await.map_err(|e| ConnError::Io {
        addr: addr.clone(),
        source: e,
    })?;
    stream.set_nodelay(true).ok();

    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    // Logon exchange happens before the loops start
    let logon = Request::Logon {
        username: cfg.username.clone().unwrap_or_default(),
        password: cfg.password.clone().unwrap_or_default(),
        heartbeat_interval_secs: cfg.heartbeat_interval_secs,
        protocol_version: cfg.protocol_version,
        client_name: "dtc-bridge".to_string(),
    };
    {
        let bytes = FrameCodec::encode(&logon.to_wire()).map_err(|_| {
            ConnError::LogonRejected("failed to encode logon request".to_string())
        })?;
        let mut w = writer.lock().await;
        w.write_all(&bytes).await.map_err(|e| ConnError::Io {
            addr: addr.clone(),
            source: e,
        })?;
    }

    let mut codec = FrameCodec::new();
    await_logon_response(cfg, &addr, &mut read_half, &mut codec).await?;
    info!("Logon accepted by {}", addr);

    let alive = Arc::new(AtomicBool::new(true));
    let session = Session {
        writer,
        alive,
        request_ids: Arc::new(AtomicI64::new(1)),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let last_inbound = Arc::new(Mutex::new(Instant::now()));

    spawn_read_loop(session.clone(), codec, read_half, tx.clone(), last_inbound.clone());
    spawn_heartbeat_loop(session.clone(), cfg, tx, last_inbound);

    Ok((session, rx))
}

/// Read frames until the logon response arrives or the timeout fires.
/// The first bytes also decide the wire encoding; a binary peer is
/// rejected here.
async fn await_logon_response(
    cfg: &GatewayConfig,
    addr: &str,
    read_half: &mut OwnedReadHalf,
    codec: &mut FrameCodec,
) -> Result<(), ConnError> {
    let deadline = Instant::now() + cfg.logon_timeout();
    let mut buf = [0u8; 8192];
    let mut encoding = WireEncoding::Undetermined;
    let mut peeked: Vec<u8> = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnError::LogonTimeout(cfg.logon_timeout()));
        }

        let n = match timeout(remaining, read_half.read(&mut buf)).await {
            Ok(Ok(0)) => return Err(ConnError::PeerClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return Err(ConnError::Io {
                    addr: addr.to_string(),
                    source: e,
                })
            }
            Err(_) => return Err(ConnError::LogonTimeout(cfg.logon_timeout())),
        };

        if encoding == WireEncoding::Undetermined {
            peeked.extend_from_slice(&buf[..n]);
            encoding = FrameCodec::detect_encoding(&peeked);
            match encoding {
                WireEncoding::Binary => return Err(ConnError::UnsupportedEncoding),
                WireEncoding::Text => {
                    codec.extend(&peeked);
                    peeked.clear();
                }
                WireEncoding::Undetermined => continue,
            }
        } else {
            codec.extend(&buf[..n]);
        }

        while let Some(frame) = codec.next_frame() {
            if frame.get("Type").and_then(serde_json::Value::as_i64)
                != Some(type_ids::LOGON_RESPONSE)
            {
                debug!("Pre-logon frame ignored: {}", frame);
                continue;
            }

            if let Some(version) = frame.get("ProtocolVersion").and_then(serde_json::Value::as_i64)
            {
                if version < cfg.protocol_version {
                    return Err(ConnError::UnsupportedVersion(version));
                }
            }

            let status = LogonStatus::from_wire(
                frame.get("Result").and_then(serde_json::Value::as_i64).unwrap_or(0),
            );
            return match status {
                LogonStatus::Success => Ok(()),
                _ => {
                    let text = frame
                        .get("ResultText")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("no reason given");
                    Err(ConnError::LogonRejected(text.to_string()))
                }
            };
        }
    }
}

fn spawn_read_loop(
    session: Session,
    mut codec: FrameCodec,
    mut read_half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    last_inbound: Arc<Mutex<Instant>>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];

        loop {
            // Frames carried over from the logon read are dispatched
            // before blocking on the socket again
            while let Some(frame) = codec.next_frame() {
                if let Some(msg) = super::normalizer::normalize(&frame) {
                    if tx.send(ConnectionEvent::Message(msg)).is_err() {
                        // Consumer gone; nothing left to do
                        session.mark_dead();
                        return;
                    }
                }
            }

            if !session.is_alive() {
                break;
            }

            // Bounded read so the alive flag is rechecked even on a
            // quiet socket
            let n = match timeout(Duration::from_secs(1), read_half.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    session.mark_dead();
                    let _ = tx.send(ConnectionEvent::Lost(ConnError::PeerClosed));
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    if session.is_alive() {
                        session.mark_dead();
                        let _ = tx.send(ConnectionEvent::Lost(ConnError::Io {
                            addr: "gateway".to_string(),
                            source: e,
                        }));
                    }
                    break;
                }
                Err(_) => continue,
            };

            if let Ok(mut ts) = last_inbound.lock() {
                *ts = Instant::now();
            }

            codec.extend(&buf[..n]);
            if codec.is_overflowing() {
                warn!("Frame buffer overflow, treating stream as corrupt");
                session.mark_dead();
                let _ = tx.send(ConnectionEvent::Lost(ConnError::FrameOverflow));
                break;
            }
        }
        debug!("Read loop stopped");
    });
}

fn spawn_heartbeat_loop(
    session: Session,
    cfg: &GatewayConfig,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    last_inbound: Arc<Mutex<Instant>>,
) {
    let heartbeat_interval = cfg.heartbeat_interval();
    let silence_timeout = cfg.silence_timeout();

    tokio::spawn(async move {
        let mut ticker = interval(heartbeat_interval);
        ticker.tick().await; // first tick is immediate

        loop {
            ticker.tick().await;
            if !session.is_alive() {
                break;
            }

            let silent_for = last_inbound
                .lock()
                .map(|ts| ts.elapsed())
                .unwrap_or(silence_timeout);
            if silent_for >= silence_timeout {
                warn!(
                    "No inbound traffic for {:.1}s, declaring connection dead",
                    silent_for.as_secs_f64()
                );
                session.mark_dead();
                let _ = tx.send(ConnectionEvent::Lost(ConnError::SilenceTimeout(
                    silence_timeout,
                )));
                break;
            }

            if let Err(e) = session.send(&Request::Heartbeat).await {
                if session.is_alive() {
                    warn!("Heartbeat send failed: {}", e);
                    session.mark_dead();
                    let _ = tx.send(ConnectionEvent::Lost(ConnError::PeerClosed));
                }
                break;
            }
        }
        debug!("Heartbeat loop stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port,
            heartbeat_interval_secs: 1,
            silence_multiplier: 2,
            logon_timeout_secs: 5,
            ..GatewayConfig::default()
        }
    }

    async fn accept_and_logon(listener: TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        // Consume the logon request
        let _ = socket.read(&mut buf).await.unwrap();
        let response =
            FrameCodec::encode(&serde_json::json!({"Type": 2, "Result": 1, "ProtocolVersion": 8}))
                .unwrap();
        socket.write_all(&response).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn test_connect_and_receive_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut socket = accept_and_logon(listener).await;
            let update = FrameCodec::encode(&serde_json::json!({
                "Type": 301,
                "ServerOrderID": "o-1",
                "TradeAccount": "Sim1",
                "OrderStatus": 7,
            }))
            .unwrap();
            socket.write_all(&update).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (session, mut rx) = connect(&test_config(port)).await.unwrap();
        assert!(session.is_alive());

        match rx.recv().await.unwrap() {
            ConnectionEvent::Message(NormalizedMessage::OrderUpdate(u)) => {
                assert_eq!(u.order_id, "o-1");
            }
            other => panic!("unexpected: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_bundled_with_logon_response_is_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Logon response and first update arrive in one TCP segment,
        // then the peer closes without sending anything else
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();

            let mut bytes =
                FrameCodec::encode(&serde_json::json!({"Type": 2, "Result": 1, "ProtocolVersion": 8}))
                    .unwrap();
            bytes.extend(
                FrameCodec::encode(&serde_json::json!({
                    "Type": 301,
                    "ServerOrderID": "o-9",
                    "TradeAccount": "Sim1",
                    "OrderStatus": 4,
                }))
                .unwrap(),
            );
            socket.write_all(&bytes).await.unwrap();
        });

        let (_session, mut rx) = connect(&test_config(port)).await.unwrap();
        match rx.recv().await.unwrap() {
            ConnectionEvent::Message(NormalizedMessage::OrderUpdate(u)) => {
                assert_eq!(u.order_id, "o-9");
            }
            other => panic!("unexpected: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_logon_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = FrameCodec::encode(
                &serde_json::json!({"Type": 2, "Result": 2, "ResultText": "bad credentials"}),
            )
            .unwrap();
            socket.write_all(&response).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        match connect(&test_config(port)).await {
            Err(ConnError::LogonRejected(text)) => assert!(text.contains("bad credentials")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_silence_timeout_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            // Log on, then go silent without closing the socket
            let _socket = accept_and_logon(listener).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (session, mut rx) = connect(&test_config(port)).await.unwrap();

        let event = timeout(Duration::from_secs(8), rx.recv())
            .await
            .expect("silence should be detected well within the window")
            .unwrap();
        match event {
            ConnectionEvent::Lost(ConnError::SilenceTimeout(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_send_after_death_is_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let socket = accept_and_logon(listener).await;
            drop(socket);
        });

        let (session, mut rx) = connect(&test_config(port)).await.unwrap();
        // Wait for the read loop to notice the close
        let _ = timeout(Duration::from_secs(5), rx.recv()).await;

        match session.send(&Request::Heartbeat).await {
            Err(SendError::Disconnected) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _socket = accept_and_logon(listener).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let (session, _rx) = connect(&test_config(port)).await.unwrap();
        let a = session.next_request_id();
        let b = session.next_request_id();
        assert!(b > a);
    }
}
