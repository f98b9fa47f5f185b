//! WebSocket gateway
//!
//! Accepts connections, routes each one by endpoint path to exactly one
//! session handler, pings on a fixed interval and calls the handler's cleanup
//! exactly once when the connection goes away.

use crate::agent::{AgentEvent, AgentSessionHandler, AgentSettings};
use crate::allowlist::Allowlist;
use crate::error::GatewayError;
use crate::exec::{ExecEvent, ExecSession, ExecSettings};
use crate::protocol::{
    AgentClientMessage, AgentServerMessage, ExecClientMessage, ExecServerMessage,
};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use uuid::Uuid;

pub const TERMINAL_PATH: &str = "/terminal/ws";
pub const AGENT_PATH: &str = "/claude/ws";

/// Handler events (process output, exits, timers) buffered per connection
const EVENT_QUEUE_CAPACITY: usize = 64;

const HEALTH_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK";

/// Everything a connection needs, shared read-only across connections
pub struct ServerContext {
    pub allowlist: &'static Allowlist,
    pub exec: Arc<ExecSettings>,
    pub agent: Arc<AgentSettings>,
    pub keepalive: Duration,
}

pub type SharedContext = Arc<ServerContext>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Terminal,
    Agent,
}

impl Route {
    /// Match on the path only; a query string does not change the route.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            TERMINAL_PATH => Some(Route::Terminal),
            AGENT_PATH => Some(Route::Agent),
            _ => None,
        }
    }
}

/// A per-connection protocol handler driven by [`serve_session`].
pub trait SessionHandler: Sized + Send + 'static {
    type Request: DeserializeOwned;
    type Response: Serialize + Send + 'static;
    type Event: Send + 'static;

    fn create(
        ctx: &ServerContext,
        outbox: mpsc::UnboundedSender<Self::Response>,
        events: mpsc::Sender<Self::Event>,
    ) -> Self;

    fn handle_request(&mut self, request: Self::Request);

    fn handle_event(&mut self, event: Self::Event);

    /// Reply for an inbound frame that could not be parsed.
    fn protocol_error(message: String) -> Self::Response;

    fn cleanup(&mut self);
}

impl SessionHandler for ExecSession {
    type Request = ExecClientMessage;
    type Response = ExecServerMessage;
    type Event = ExecEvent;

    fn create(
        ctx: &ServerContext,
        outbox: mpsc::UnboundedSender<ExecServerMessage>,
        events: mpsc::Sender<ExecEvent>,
    ) -> Self {
        ExecSession::new(ctx.allowlist, ctx.exec.clone(), outbox, events)
    }

    fn handle_request(&mut self, request: ExecClientMessage) {
        match request {
            ExecClientMessage::Execute { command } => self.execute(command.as_deref().unwrap_or("")),
            ExecClientMessage::Cancel => self.cancel(),
        }
    }

    fn handle_event(&mut self, event: ExecEvent) {
        ExecSession::handle_event(self, event)
    }

    fn protocol_error(message: String) -> ExecServerMessage {
        ExecServerMessage::Error { message }
    }

    fn cleanup(&mut self) {
        ExecSession::cleanup(self)
    }
}

impl SessionHandler for AgentSessionHandler {
    type Request = AgentClientMessage;
    type Response = AgentServerMessage;
    type Event = AgentEvent;

    fn create(
        ctx: &ServerContext,
        outbox: mpsc::UnboundedSender<AgentServerMessage>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        AgentSessionHandler::new(ctx.agent.clone(), outbox, events)
    }

    fn handle_request(&mut self, request: AgentClientMessage) {
        match request {
            AgentClientMessage::StartSession => self.start_session(),
            AgentClientMessage::SendPrompt { session_id, prompt } => {
                self.send_prompt(session_id, prompt)
            }
        }
    }

    fn handle_event(&mut self, event: AgentEvent) {
        AgentSessionHandler::handle_event(self, event)
    }

    fn protocol_error(message: String) -> AgentServerMessage {
        AgentServerMessage::Error { message }
    }

    fn cleanup(&mut self) {
        AgentSessionHandler::cleanup(self)
    }
}

/// Accept connections until Ctrl+C or SIGTERM.
pub async fn run(listener: TcpListener, ctx: SharedContext) {
    #[cfg(unix)]
    run_server_loop_unix(listener, ctx).await;

    #[cfg(not(unix))]
    run_server_loop_ctrlc_only(listener, ctx).await;
}

/// Accept connections forever.
pub async fn serve(listener: TcpListener, ctx: SharedContext) {
    loop {
        let result = listener.accept().await;
        spawn_connection(result, &ctx);
    }
}

/// Server loop with Unix signal handling (SIGTERM + Ctrl+C)
#[cfg(unix)]
async fn run_server_loop_unix(listener: TcpListener, ctx: SharedContext) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(
                "Failed to set up SIGTERM handler: {}. Only Ctrl+C will work for shutdown.",
                e
            );
            run_server_loop_ctrlc_only(listener, ctx).await;
            return;
        }
    };

    loop {
        tokio::select! {
            result = listener.accept() => spawn_connection(result, &ctx),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (Ctrl+C)");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Shutting down (SIGTERM)");
                break;
            }
        }
    }
}

/// Server loop with Ctrl+C only (fallback or non-Unix)
async fn run_server_loop_ctrlc_only(listener: TcpListener, ctx: SharedContext) {
    loop {
        tokio::select! {
            result = listener.accept() => spawn_connection(result, &ctx),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (Ctrl+C)");
                break;
            }
        }
    }
}

fn spawn_connection(result: std::io::Result<(TcpStream, SocketAddr)>, ctx: &SharedContext) {
    match result {
        Ok((stream, addr)) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    tracing::warn!("Connection {} ended with error: {}", addr, e);
                }
            });
        }
        Err(e) => tracing::warn!("Failed to accept connection: {}", e),
    }
}

/// Plain `GET /health` from the client's connection test, detected before
/// the WebSocket handshake. Upgrades to any other path fall through.
fn is_health_check(head: &[u8]) -> bool {
    head.starts_with(b"GET /health ") || head.starts_with(b"GET /health?")
}

async fn answer_health_check(mut stream: TcpStream) -> Result<(), GatewayError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request so closing does not reset the connection.
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await?;
    stream.write_all(HEALTH_RESPONSE).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Handshake, route by path, then run the matching handler.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: SharedContext,
) -> Result<(), GatewayError> {
    let mut head = [0u8; 12];
    let n = stream.peek(&mut head).await?;
    if is_health_check(&head[..n]) {
        tracing::debug!("Health check from {}", addr);
        return answer_health_check(stream).await;
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024),
        max_frame_size: Some(16 * 1024 * 1024),
        ..Default::default()
    };

    let mut path = String::new();
    let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let mut ws = accept_hdr_async_with_config(stream, capture_path, Some(ws_config)).await?;

    match Route::from_path(&path) {
        Some(Route::Terminal) => serve_session::<ExecSession>(ws, addr, &ctx).await,
        Some(Route::Agent) => serve_session::<AgentSessionHandler>(ws, addr, &ctx).await,
        None => {
            tracing::warn!("Rejecting {} on unknown endpoint {:?}", addr, path);
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Invalid endpoint".into(),
            }))
            .await?;
            Ok(())
        }
    }
}

/// Per-connection event loop. Inbound frames, handler events, queued
/// outbound messages and the keepalive timer are all handled on this task.
async fn serve_session<H: SessionHandler>(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    ctx: &ServerContext,
) -> Result<(), GatewayError> {
    let connection_id = Uuid::new_v4();
    let (mut tx, mut rx) = ws.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<H::Response>();
    let (event_tx, mut event_rx) = mpsc::channel::<H::Event>(EVENT_QUEUE_CAPACITY);
    let rejects = outbox_tx.clone();

    let mut handler = H::create(ctx, outbox_tx, event_tx);
    tracing::info!(
        "Client {} connected as {} ({})",
        addr,
        connection_id,
        std::any::type_name::<H>().rsplit("::").next().unwrap_or("handler")
    );

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.keepalive,
        ctx.keepalive,
    );

    // Queued frames go out before new events are taken, so a chatty process
    // is paced by the client's read rate.
    let result: Result<(), GatewayError> = loop {
        tokio::select! {
            biased;

            // Queued messages
            Some(message) = outbox_rx.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => break Err(e.into()),
                };
                if tx.send(Message::Text(text)).await.is_err() {
                    break Ok(());
                }
            }

            // Client messages
            result = rx.next() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<H::Request>(&text) {
                            Ok(request) => handler.handle_request(request),
                            Err(e) => {
                                tracing::debug!("Unparsable message from {}: {}", connection_id, e);
                                let _ = rejects.send(H::protocol_error(format!(
                                    "Failed to parse message: {}",
                                    e
                                )));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = tx.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                    _ => {}
                }
            }

            _ = keepalive.tick() => {
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break Ok(());
                }
            }

            // Process notifications
            Some(event) = event_rx.recv() => handler.handle_event(event),
        }
    };

    handler.cleanup();
    tracing::info!("Client {} disconnected ({})", addr, connection_id);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_tungstenite::connect_async;

    async fn start_server(root: &Path, keepalive: Duration) -> SocketAddr {
        let ctx = Arc::new(ServerContext {
            allowlist: Allowlist::builtin(),
            exec: Arc::new(ExecSettings {
                working_dir: root.to_path_buf(),
                timeout: Duration::from_secs(10),
                kill_grace: Duration::from_secs(1),
                forwarded_env: vec!["PATH".to_string()],
            }),
            agent: Arc::new(AgentSettings {
                command: "/nonexistent/agent-cli".to_string(),
                base_args: Vec::new(),
                allowed_tools: "Read".to_string(),
                init_prompt: "hi".to_string(),
                working_dir: root.to_path_buf(),
            }),
            keepalive,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, ctx));
        addr
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("no message within 10s")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn health_check_detection() {
        assert!(is_health_check(b"GET /health "));
        assert!(is_health_check(b"GET /health?"));
        assert!(!is_health_check(b"GET /healthz"));
        assert!(!is_health_check(b"GET /termina"));
        assert!(!is_health_check(b"POST /health"));
    }

    #[tokio::test]
    async fn health_endpoint_answers_plain_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let temp = TempDir::new().unwrap();
        let addr = start_server(temp.path(), Duration::from_secs(30)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nOK"));
    }

    #[test]
    fn routes_by_path() {
        assert_eq!(Route::from_path("/terminal/ws"), Some(Route::Terminal));
        assert_eq!(Route::from_path("/claude/ws"), Some(Route::Agent));
        assert_eq!(Route::from_path("/"), None);
        assert_eq!(Route::from_path("/terminal/ws/"), None);
    }

    #[tokio::test]
    async fn unknown_endpoint_is_closed_with_policy_violation() {
        let temp = TempDir::new().unwrap();
        let addr = start_server(temp.path(), Duration::from_secs(30)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/nope", addr)).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "Invalid endpoint");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminal_endpoint_executes_commands() {
        let temp = TempDir::new().unwrap();
        let addr = start_server(temp.path(), Duration::from_secs(30)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/terminal/ws", addr))
            .await
            .unwrap();

        let request = json!({"type": "execute", "command": "echo hi"}).to_string();
        ws.send(Message::Text(request)).await.unwrap();
        assert_eq!(next_json(&mut ws).await, json!({"type": "stdout", "data": "hi\n"}));
        assert_eq!(next_json(&mut ws).await, json!({"type": "exit", "code": 0}));

        let request = json!({"type": "execute", "command": "rm -rf /"}).to_string();
        ws.send(Message::Text(request)).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn malformed_frames_are_reported_not_fatal() {
        let temp = TempDir::new().unwrap();
        let addr = start_server(temp.path(), Duration::from_secs(30)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/terminal/ws", addr))
            .await
            .unwrap();

        ws.send(Message::Text("not json".to_string())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .starts_with("Failed to parse message"));

        ws.send(Message::Text(json!({"type": "cancel"}).to_string()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "error", "message": "No command running"})
        );
    }

    #[tokio::test]
    async fn agent_endpoint_validates_send_prompt() {
        let temp = TempDir::new().unwrap();
        let addr = start_server(temp.path(), Duration::from_secs(30)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/claude/ws", addr))
            .await
            .unwrap();

        ws.send(Message::Text(json!({"type": "send_prompt", "prompt": "hi"}).to_string()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "error", "message": "Missing sessionId or prompt for send_prompt"})
        );

        ws.send(Message::Text(json!({"type": "start_session"}).to_string()))
            .await
            .unwrap();
        let reply = next_json(&mut ws).await;
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .starts_with("Failed to start agent"));
    }

    #[tokio::test]
    async fn keepalive_pings_idle_connections() {
        let temp = TempDir::new().unwrap();
        let addr = start_server(temp.path(), Duration::from_millis(100)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/claude/ws", addr))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Message::Ping(_)));
    }
}
