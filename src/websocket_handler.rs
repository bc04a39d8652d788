use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::protocol::{now_ts, AuthPayload, Message, MessageType};
use crate::runtime_manager::ContainerDriver;
use crate::signer;
use crate::{AgentConfig, AgentError, AgentResult};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsWrite = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;

/// Long-lived session with the control plane.
///
/// `connect` dials and authenticates; `run` drives the read loop on a spawned
/// task and the heartbeat in the foreground until `shutdown` is called.
#[derive(Clone)]
pub struct WebSocketHandler {
    config: Arc<AgentConfig>,
    driver: Arc<dyn ContainerDriver>,
    write: Arc<RwLock<Option<Arc<Mutex<WsWrite>>>>>,
    read: Arc<Mutex<Option<WsRead>>>,
    closed: Arc<watch::Sender<bool>>,
    heartbeat_interval: Duration,
}

impl WebSocketHandler {
    pub fn new(config: Arc<AgentConfig>, driver: Arc<dyn ContainerDriver>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            config,
            driver,
            write: Arc::new(RwLock::new(None)),
            read: Arc::new(Mutex::new(None)),
            closed: Arc::new(closed),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Open the connection and send `AUTH`.
    pub async fn connect(&self) -> AgentResult<()> {
        info!("Connecting to control plane: {}", self.config.ws_url);

        let (ws_stream, _) = connect_async(self.config.ws_url.as_str())
            .await
            .map_err(|e| AgentError::NetworkError(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        // AUTH must be the first frame; share the writer only after it is sent.
        let nonce = Uuid::new_v4().to_string();
        let auth = serde_json::to_string(&auth_frame(&self.config, &nonce, now_ts()))?;
        {
            let mut w = write.lock().await;
            w.send(WsMessage::text(auth))
                .await
                .map_err(|e| AgentError::NetworkError(e.to_string()))?;
        }

        {
            let mut guard = self.write.write().await;
            *guard = Some(write);
        }
        *self.read.lock().await = Some(read);

        info!("Connected, AUTH sent for agent {}", self.config.agent_id);
        Ok(())
    }

    /// Run until [`shutdown`](Self::shutdown). Requires a prior successful `connect`.
    pub async fn run(&self) -> AgentResult<()> {
        let read = self
            .read
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::NetworkError("not connected".to_string()))?;

        let handler = self.clone();
        let connection = tokio::spawn(async move { handler.connection_loop(read).await });

        self.heartbeat_loop().await;

        if let Err(e) = connection.await {
            error!("Connection task failed: {}", e);
        }
        self.close_connection().await;
        info!("Session stopped");
        Ok(())
    }

    /// Stop both loops and close the connection.
    pub fn shutdown(&self) {
        info!("Shutting down session");
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serialise `msg` onto the socket. A no-op while disconnected.
    pub async fn send(&self, msg: &Message) -> AgentResult<()> {
        let text = serde_json::to_string(msg)?;
        let writer = { self.write.read().await.clone() };
        let Some(ws) = writer else {
            debug!("No connection, dropping {:?} frame", msg.kind);
            return Ok(());
        };
        let mut w = ws.lock().await;
        w.send(WsMessage::text(text))
            .await
            .map_err(|e| AgentError::NetworkError(e.to_string()))
    }

    /// Read, then reconnect and read again, until closed or out of attempts.
    async fn connection_loop(self, mut read: WsRead) {
        loop {
            let mut dispatcher = Dispatcher::new(self.config.clone(), self.driver.clone());
            self.read_loop(&mut read, &mut dispatcher).await;
            dispatcher.close().await;

            if self.is_closed() {
                return;
            }

            match self.reconnect().await {
                Some(next) => read = next,
                None => {
                    if !self.is_closed() {
                        error!(
                            "Reconnect failed after {} attempts, session idle",
                            MAX_RECONNECT_ATTEMPTS
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn read_loop(&self, read: &mut WsRead, dispatcher: &mut Dispatcher) {
        loop {
            let frame = tokio::select! {
                frame = read.next() => frame,
                _ = self.wait_closed() => return,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    self.handle_frame(text.as_str(), dispatcher).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    warn!("Control plane closed the connection");
                    return;
                }
                Some(Err(e)) => {
                    error!("WebSocket read error: {}", e);
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn handle_frame(&self, text: &str, dispatcher: &mut Dispatcher) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Ignoring undecodable frame: {}", e);
                return;
            }
        };

        match msg.kind {
            MessageType::Ping => {
                if let Err(e) = self.send(&Message::pong(now_ts())).await {
                    warn!("Failed to send PONG: {}", e);
                }
            }
            MessageType::Req => {
                let response = dispatcher.handle(&msg).await;
                if let Err(e) = self.send(&response).await {
                    error!(request_id = %msg.id, "Failed to send response: {}", e);
                }
            }
            MessageType::Res if msg.id == "auth" => {
                let accepted = msg
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("success"))
                    .and_then(|s| s.as_bool())
                    .unwrap_or(false);
                if accepted {
                    info!("Handshake accepted by control plane");
                } else {
                    warn!("Handshake rejected by control plane");
                }
            }
            _ => {}
        }
    }

    async fn heartbeat_loop(&self) {
        let start = tokio::time::Instant::now() + self.heartbeat_interval;
        let mut interval = tokio::time::interval_at(start, self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wait_closed() => return,
            }
            debug!("Sending heartbeat");
            if let Err(e) = self.send(&Message::ping(now_ts())).await {
                debug!("Heartbeat failed: {}", e);
            }
        }
    }

    /// Up to [`MAX_RECONNECT_ATTEMPTS`] attempts with jittered exponential backoff.
    async fn reconnect(&self) -> Option<WsRead> {
        self.close_connection().await;

        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let delay = jittered(backoff_base(attempt), jitter_factor());
            info!(
                "Reconnecting in {:.1}s (attempt {}/{})",
                delay.as_secs_f64(),
                attempt + 1,
                MAX_RECONNECT_ATTEMPTS
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wait_closed() => return None,
            }

            match self.connect().await {
                Ok(()) => return self.read.lock().await.take(),
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }
        None
    }

    async fn close_connection(&self) {
        let writer = { self.write.write().await.take() };
        if let Some(ws) = writer {
            let mut w = ws.lock().await;
            if let Err(e) = w.close().await {
                debug!("Error closing connection: {}", e);
            }
        }
        self.read.lock().await.take();
    }
}

/// First frame of every connection.
pub fn auth_frame(config: &AgentConfig, nonce: &str, ts: i64) -> Message {
    let sig = signer::sign(
        &config.token,
        &signer::auth_payload(&config.agent_id, nonce, ts),
    );
    Message::auth(
        AuthPayload {
            agent_id: config.agent_id.clone(),
            nonce: nonce.to_string(),
            ts,
            sig,
        },
        ts,
    )
}

/// 1s doubled per attempt, capped at 30s.
pub fn backoff_base(attempt: u32) -> Duration {
    INITIAL_BACKOFF
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

pub fn jittered(base: Duration, factor: f64) -> Duration {
    base.mul_f64(factor)
}

/// Uniform in `[0.8, 1.2)`.
fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(0.8..1.2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponsePayload;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct NoDriver;

    #[async_trait]
    impl ContainerDriver for NoDriver {
        async fn power(&self, _op: &str, _container: &str) -> AgentResult<()> {
            Ok(())
        }
        async fn exec(&self, _container: &str, _command: &str) -> AgentResult<String> {
            Ok(String::new())
        }
        async fn logs(&self, _container: &str, _tail: u32) -> AgentResult<String> {
            Ok(String::new())
        }
        async fn find_by_label(&self, _key: &str, _value: &str) -> String {
            String::new()
        }
        async fn inspect_status(&self, _container: &str) -> AgentResult<String> {
            Ok("running".to_string())
        }
        async fn stats_snapshot(&self, _container: &str) -> (String, String) {
            (String::new(), String::new())
        }
    }

    fn config(ws_url: &str) -> AgentConfig {
        AgentConfig::from_yaml(&format!(
            "agentId: a1\ntoken: k\nwsUrl: {}\nfileRoot: /var/srv\n",
            ws_url
        ))
        .unwrap()
    }

    #[test]
    fn auth_frame_signs_agent_nonce_and_ts() {
        let cfg = config("ws://127.0.0.1:1");
        let frame = auth_frame(&cfg, "n-1", 1_700_000_000);
        assert_eq!(frame.kind, MessageType::Auth);
        assert_eq!(frame.ts, 1_700_000_000);

        let payload: AuthPayload = serde_json::from_value(frame.payload.unwrap()).unwrap();
        assert_eq!(payload.agent_id, "a1");
        assert_eq!(payload.nonce, "n-1");
        assert_eq!(payload.ts, 1_700_000_000);
        assert_eq!(payload.sig, signer::sign("k", "a1n-11700000000"));
        assert_eq!(payload.sig.len(), 64);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let secs: Vec<u64> = (0..MAX_RECONNECT_ATTEMPTS)
            .map(|k| backoff_base(k).as_secs())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
        assert_eq!(backoff_base(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn jittered_delays_stay_in_range() {
        for k in 0..MAX_RECONNECT_ATTEMPTS {
            let base = backoff_base(k).as_secs_f64();
            for _ in 0..200 {
                let delay = jittered(backoff_base(k), jitter_factor()).as_secs_f64();
                assert!(delay >= 0.8 * base - 1e-9, "{} < 0.8*{}", delay, base);
                assert!(delay < 1.2 * base, "{} >= 1.2*{}", delay, base);
            }
        }
        assert_eq!(jittered(Duration::from_secs(30), 0.8), Duration::from_secs(24));
    }

    #[tokio::test]
    async fn send_without_connection_is_noop() {
        let handler = WebSocketHandler::new(Arc::new(config("ws://127.0.0.1:1")), Arc::new(NoDriver));
        handler.send(&Message::ping(1)).await.unwrap();
        assert!(handler.run().await.is_err());
    }

    async fn next_message(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> Message {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        value: serde_json::Value,
    ) {
        ws.send(WsMessage::text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn session_authenticates_answers_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/agent", listener.local_addr().unwrap());

        let handler = WebSocketHandler::new(Arc::new(config(&url)), Arc::new(NoDriver))
            .with_heartbeat_interval(Duration::from_millis(200));

        let connecting = handler.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        connect.await.unwrap().unwrap();

        let auth = next_message(&mut ws).await;
        assert_eq!(auth.kind, MessageType::Auth);
        let payload: AuthPayload = serde_json::from_value(auth.payload.unwrap()).unwrap();
        assert_eq!(
            payload.sig,
            signer::sign("k", &format!("a1{}{}", payload.nonce, payload.ts))
        );

        let runner = handler.clone();
        let run = tokio::spawn(async move { runner.run().await });

        send_json(&mut ws, json!({"type": "RES", "id": "auth", "payload": {"success": true}, "ts": 1})).await;
        send_json(&mut ws, json!({"type": "PING", "ts": 1})).await;
        send_json(&mut ws, json!({"type": "REQ", "id": "r-1", "action": "SELF_DESTRUCT", "payload": {}, "ts": 1})).await;

        let mut saw_pong = false;
        let mut saw_ping = false;
        let mut response = None;
        while !(saw_pong && saw_ping && response.is_some()) {
            let msg = next_message(&mut ws).await;
            match msg.kind {
                MessageType::Pong => saw_pong = true,
                MessageType::Ping => saw_ping = true,
                MessageType::Res => response = Some(msg),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        let response = response.unwrap();
        assert_eq!(response.id, "r-1");
        let body: ResponsePayload = serde_json::from_value(response.payload.unwrap()).unwrap();
        assert!(!body.success);
        assert_eq!(body.message, "unknown action");

        // Dropping the socket triggers a reconnect with a fresh AUTH.
        drop(ws);
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let again = next_message(&mut ws).await;
        assert_eq!(again.kind, MessageType::Auth);
        let second: AuthPayload = serde_json::from_value(again.payload.unwrap()).unwrap();
        assert_ne!(second.nonce, payload.nonce);

        handler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(handler.is_closed());
    }
}
