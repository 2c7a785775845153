use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::reconnect::{transition, ConnectionEvent, ConnectionState, RetryAction};
use super::router::EventRouter;
use crate::config::CollabConfig;
use crate::protocol::{ErrorEvent, Frame, InboundEvent, OutboundMessage};
use crate::{CollabError, CollabResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `connect()` waits for the previous socket to finish closing
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Endpoint and token of the current connection, kept for reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub endpoint_path: String,
    pub token: Option<String>,
}

impl ConnectionParams {
    pub fn new(endpoint_path: impl Into<String>, token: Option<&str>) -> Self {
        Self {
            endpoint_path: endpoint_path.into(),
            token: token.map(str::to_string),
        }
    }

    /// Full WebSocket URL: `<base>/<path>?token=<token>`
    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let path = self.endpoint_path.trim_start_matches('/');
        match &self.token {
            Some(token) => format!("{}/{}?token={}", base, path, token),
            None => format!("{}/{}", base, path),
        }
    }
}

/// Mutable connection bookkeeping, always accessed under one lock
struct Link {
    state: ConnectionState,
    /// Bumped by every `connect()` and `disconnect()`; background work
    /// started under an older generation must not act
    generation: u64,
    params: Option<ConnectionParams>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    /// Background task of the latest generation
    task: Option<JoinHandle<()>>,
}

struct Shared {
    config: CollabConfig,
    router: EventRouter,
    link: Mutex<Link>,
    /// Wakes a pending reconnection delay when the generation changes
    wakeup: Notify,
    /// Mirrors `Link::state` for observers
    states: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Feed an event through the state machine and store the new state
    fn apply(&self, link: &mut Link, event: ConnectionEvent) -> Option<RetryAction> {
        let next = transition(link.state, event, &self.config.reconnect);
        if next.state != link.state {
            debug!("Connection state {:?} -> {:?}", link.state, next.state);
        }
        link.state = next.state;
        self.states.send_if_modified(|state| {
            let changed = *state != next.state;
            *state = next.state;
            changed
        });
        next.action
    }

    /// Close the current transport, if any, and invalidate background work
    fn shut_down(&self, link: &mut Link) {
        link.generation += 1;
        if let Some(outgoing) = link.outgoing.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Normal closure".into(),
            }));
            // The pump may already be gone; nothing left to close then
            let _ = outgoing.send(close);
        }
        self.apply(link, ConnectionEvent::Disconnect);
        self.wakeup.notify_waiters();
    }
}

/// Owns one persistent WebSocket connection to a single endpoint
///
/// Handles framing, heartbeat and bounded reconnection, and dispatches every
/// inbound frame through its [`EventRouter`]. Dropping the manager
/// disconnects it.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a disconnected manager
    pub fn new(config: CollabConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                router: EventRouter::new(),
                link: Mutex::new(Link {
                    state: ConnectionState::Idle,
                    generation: 0,
                    params: None,
                    outgoing: None,
                    task: None,
                }),
                wakeup: Notify::new(),
                states: watch::channel(ConnectionState::Idle).0,
            }),
        }
    }

    /// Router the inbound frames are dispatched through
    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    pub fn config(&self) -> &CollabConfig {
        &self.shared.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Whether the transport is open right now
    pub fn is_connected(&self) -> bool {
        let link = self.shared.lock();
        link.state == ConnectionState::Open
            && link
                .outgoing
                .as_ref()
                .is_some_and(|outgoing| !outgoing.is_closed())
    }

    /// Watch lifecycle state changes, including ones made by the
    /// background reconnection loop
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.states.subscribe()
    }

    /// Parameters retained for reconnection, if connected or reconnecting
    pub fn params(&self) -> Option<ConnectionParams> {
        self.shared.lock().params.clone()
    }

    /// Open a connection to `endpoint_path`
    ///
    /// Resolves once the WebSocket handshake completed. An already open
    /// transport is closed first, and the previous socket has finished
    /// closing before the new one is opened. A failed handshake is returned
    /// to the caller and not retried.
    pub async fn connect(&self, endpoint_path: &str, token: Option<&str>) -> CollabResult<()> {
        let params = ConnectionParams::new(endpoint_path, token);
        let url = params.url(&self.shared.config.base_url);

        let (generation, previous) = {
            let mut link = self.shared.lock();
            if link.state != ConnectionState::Idle || link.outgoing.is_some() {
                info!("Replacing existing connection before connecting to {}", endpoint_path);
                self.shared.shut_down(&mut link);
            }
            link.generation += 1;
            link.params = Some(params);
            self.shared.apply(&mut link, ConnectionEvent::Connect);
            (link.generation, link.task.take())
        };

        if let Some(previous) = previous {
            if tokio::time::timeout(CLOSE_TIMEOUT, previous).await.is_err() {
                warn!("Previous connection did not close in time");
            }
        }

        info!("Connecting to {}", endpoint_path);
        let stream = match open_socket(&url).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("WebSocket connection to {} failed: {}", endpoint_path, e);
                let mut link = self.shared.lock();
                if link.generation == generation {
                    // Nothing retries an initial failure, so nothing needs the params
                    link.params = None;
                    self.shared.apply(&mut link, ConnectionEvent::ConnectFailed);
                }
                return Err(e);
            }
        };

        let outgoing = {
            let mut link = self.shared.lock();
            if link.generation != generation {
                None
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                link.outgoing = Some(tx);
                self.shared.apply(&mut link, ConnectionEvent::Opened);
                Some(rx)
            }
        };

        let Some(outgoing) = outgoing else {
            // disconnect() ran while the handshake was in flight
            let mut stream = stream;
            let _ = stream.close(None).await;
            return Err(CollabError::Cancelled);
        };

        info!("WebSocket connected to {}", endpoint_path);
        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            generation,
            stream,
            outgoing,
        ));

        let mut link = self.shared.lock();
        if link.generation == generation {
            link.task = Some(task);
        }
        Ok(())
    }

    /// Send a frame if the connection is open
    ///
    /// Fire-and-forget: while disconnected the frame is dropped with a
    /// warning. Frames are never queued for later.
    pub fn send(&self, frame: &Frame) {
        let link = self.shared.lock();
        let (ConnectionState::Open, Some(outgoing)) = (link.state, link.outgoing.as_ref()) else {
            warn!(
                "WebSocket is not connected, dropping '{}' frame",
                frame.kind
            );
            return;
        };

        match frame.encode() {
            Ok(text) => {
                if outgoing.send(Message::Text(text)).is_err() {
                    warn!(
                        "WebSocket writer is gone, dropping '{}' frame",
                        frame.kind
                    );
                }
            }
            Err(e) => error!("Failed to encode '{}' frame: {}", frame.kind, e),
        }
    }

    /// Send a typed outbound message
    pub fn send_message(&self, message: &OutboundMessage) {
        match Frame::from_message(message) {
            Ok(frame) => self.send(&frame),
            Err(e) => error!("Failed to build frame for {:?}: {}", message, e),
        }
    }

    /// Close the connection and forget it
    ///
    /// Closes with a normal-closure code, clears every listener and the
    /// retained parameters, stops the heartbeat and cancels any pending
    /// reconnection. This is the only way to suppress reconnection.
    pub fn disconnect(&self) {
        {
            let mut link = self.shared.lock();
            self.shared.shut_down(&mut link);
            link.params = None;
        }
        self.shared.router.clear();
        debug!("Connection manager disconnected");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut link = self.shared.lock();
        self.shared.shut_down(&mut link);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &link.state)
            .field("params", &link.params)
            .finish()
    }
}

async fn open_socket(url: &str) -> CollabResult<WsStream> {
    match tokio_tungstenite::connect_async(url).await {
        Ok((stream, _response)) => Ok(stream),
        Err(source) => Err(CollabError::Connect {
            // Never leak the token into errors or logs
            url: url.split('?').next().unwrap_or_default().to_string(),
            source,
        }),
    }
}

/// Why the socket pump stopped
enum PumpOutcome {
    /// Our side closed the socket
    Local,
    /// The server closed the socket or the stream ended
    Remote,
    /// Reading or writing failed
    Failed(String),
}

/// Drive one connection generation: pump the socket, then reconnect on
/// unexpected close until the state machine gives up
async fn run_connection(
    shared: Arc<Shared>,
    generation: u64,
    mut stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let outcome = pump(&shared, generation, stream, outgoing).await;

        let mut retry = {
            let mut link = shared.lock();
            if link.generation != generation {
                debug!("Connection generation {} ended", generation);
                return;
            }
            link.outgoing = None;
            if matches!(outcome, PumpOutcome::Local) {
                return;
            }
            shared.apply(&mut link, ConnectionEvent::Closed)
        };

        if let PumpOutcome::Failed(message) = &outcome {
            shared.router.emit(&InboundEvent::Error(ErrorEvent::new(message.clone())));
        }

        // Retry until a socket opens, the episode is exhausted, or a
        // disconnect() supersedes this generation
        loop {
            let (attempt, delay) = match retry {
                Some(RetryAction::ScheduleRetry { attempt, delay }) => (attempt, delay),
                Some(RetryAction::GiveUp) | None => {
                    warn!("Max reconnection attempts reached, staying disconnected");
                    return;
                }
            };

            debug!("Scheduling reconnection attempt {} in {:?}", attempt + 1, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.wakeup.notified() => {}
            }

            let url = {
                let link = shared.lock();
                if link.generation != generation {
                    debug!("Pending reconnection cancelled");
                    return;
                }
                match &link.params {
                    Some(params) => params.url(&shared.config.base_url),
                    None => return,
                }
            };

            info!(
                "Attempting to reconnect... ({}/{})",
                attempt + 1,
                shared.config.reconnect.max_attempts
            );

            match open_socket(&url).await {
                Ok(new_stream) => {
                    let mut link = shared.lock();
                    if link.generation != generation {
                        return;
                    }
                    let (tx, rx) = mpsc::unbounded_channel();
                    link.outgoing = Some(tx);
                    shared.apply(&mut link, ConnectionEvent::Opened);
                    info!("WebSocket reconnected");
                    stream = new_stream;
                    outgoing = rx;
                    break;
                }
                Err(e) => {
                    error!("Reconnection failed: {}", e);
                    let mut link = shared.lock();
                    if link.generation != generation {
                        return;
                    }
                    retry = shared.apply(&mut link, ConnectionEvent::ConnectFailed);
                }
            }
        }
    }
}

/// Move frames between the socket, the outbound channel and the router
async fn pump(
    shared: &Shared,
    generation: u64,
    stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) -> PumpOutcome {
    let (mut sink, mut source) = stream.split();

    // interval_at panics on a zero period
    let period = shared.config.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        warn!("Failed to write WebSocket frame: {}", e);
                        return PumpOutcome::Failed(e.to_string());
                    }
                    if closing {
                        info!("WebSocket closed by client");
                        return PumpOutcome::Local;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return PumpOutcome::Local;
                }
            },

            _ = heartbeat.tick() => {
                if !shared.is_current(generation) {
                    continue;
                }
                match Frame::ping().encode() {
                    Ok(ping) => {
                        if let Err(e) = sink.send(Message::Text(ping)).await {
                            warn!("Failed to send heartbeat: {}", e);
                            return PumpOutcome::Failed(e.to_string());
                        }
                    }
                    Err(e) => error!("Failed to encode heartbeat: {}", e),
                }
            },

            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    shared.router.dispatch_text(&text);
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    match frame {
                        Some(frame) => {
                            info!("WebSocket disconnected: {} {}", frame.code, frame.reason)
                        }
                        None => info!("WebSocket disconnected"),
                    }
                    return PumpOutcome::Remote;
                }
                // Ping/pong is answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    return PumpOutcome::Failed(e.to_string());
                }
                None => {
                    info!("WebSocket stream ended");
                    return PumpOutcome::Remote;
                }
            },
        }
    }
}
