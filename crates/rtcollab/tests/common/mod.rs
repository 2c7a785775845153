#![allow(dead_code)]

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use rtcollab::{CollabConfig, ReconnectPolicy};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// What the mock server observed
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected { path: String, query: Option<String> },
    Received { path: String, text: String },
    Closed { path: String },
}

#[derive(Debug, Clone)]
enum Command {
    Send(String),
    Close,
}

struct MockState {
    events: mpsc::UnboundedSender<ServerEvent>,
    commands: broadcast::Sender<Command>,
    reject: AtomicBool,
    answer_pings: AtomicBool,
    attempts: AtomicUsize,
    open: AtomicUsize,
}

/// In-process WebSocket server accepting every path
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    events: Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            events: events_tx,
            commands,
            reject: AtomicBool::new(false),
            answer_pings: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
        });

        let app = Router::new().fallback(upgrade).with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            events: Mutex::new(events_rx),
        }
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Config pointing at this server with fast timers
    pub fn config(&self, max_attempts: u32, base_delay_ms: u64) -> CollabConfig {
        CollabConfig::new(self.base_url())
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_reconnect(ReconnectPolicy::new(
                max_attempts,
                Duration::from_millis(base_delay_ms),
            ))
    }

    /// Push a text frame to every open socket
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.state.commands.send(Command::Send(text.into()));
    }

    /// Close every open socket from the server side
    pub fn close_all(&self) {
        let _ = self.state.commands.send(Command::Close);
    }

    /// Refuse further upgrades with 503
    pub fn reject_upgrades(&self, reject: bool) {
        self.state.reject.store(reject, Ordering::SeqCst);
    }

    /// Reply to `ping` frames with `pong`
    pub fn answer_pings(&self) {
        self.state.answer_pings.store(true, Ordering::SeqCst);
    }

    /// Upgrade requests seen, including rejected ones
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn open_sockets(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub async fn next_event(&self) -> ServerEvent {
        let mut events = self.events.lock().await;
        tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("server event channel closed")
    }

    /// Skip events until one matches
    pub async fn wait_for<F>(&self, mut matches: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Next text frame received from a client, parsed as JSON
    pub async fn next_frame(&self) -> serde_json::Value {
        let event = self
            .wait_for(|event| matches!(event, ServerEvent::Received { .. }))
            .await;
        match event {
            ServerEvent::Received { text, .. } => serde_json::from_str(&text).unwrap(),
            _ => unreachable!(),
        }
    }

    /// Next received frame of the given `type`
    pub async fn next_frame_of(&self, kind: &str) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }
}

async fn upgrade(State(state): State<Arc<MockState>>, uri: Uri, ws: WebSocketUpgrade) -> Response {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    if state.reject.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let path = uri.path().to_string();
    let query = uri.query().map(str::to_string);
    ws.on_upgrade(move |socket| serve_socket(state, socket, path, query))
}

async fn serve_socket(
    state: Arc<MockState>,
    mut socket: WebSocket,
    path: String,
    query: Option<String>,
) {
    let mut commands = state.commands.subscribe();
    state.open.fetch_add(1, Ordering::SeqCst);
    let _ = state.events.send(ServerEvent::Connected {
        path: path.clone(),
        query,
    });

    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_string();
                    let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                        .map(|frame| frame["type"] == "ping")
                        .unwrap_or(false);
                    let _ = state.events.send(ServerEvent::Received {
                        path: path.clone(),
                        text,
                    });
                    if is_ping && state.answer_pings.load(Ordering::SeqCst) {
                        let pong = serde_json::json!({"type": "pong"}).to_string();
                        let _ = socket.send(Message::Text(pong.into())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(Command::Send(text)) => {
                    let _ = socket.send(Message::Text(text.into())).await;
                }
                Ok(Command::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.open.fetch_sub(1, Ordering::SeqCst);
    let _ = state.events.send(ServerEvent::Closed { path });
}

/// Poll `condition` until it holds or the timeout elapses
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
