//! Server endpoint
//!
//! Accepts WebSocket connections, wraps each in a [`Session`], and runs
//! the shared message engine over every inbound frame. Owns the session
//! table, the heartbeat timer, and the room fan-out paths.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::codec::Frame;
use crate::engine::{Engine, VersionCheck};
use crate::events::{ConnectRequest, ServerEvent};
use crate::logging::{self, LogConfig};
use crate::protocol::Notification;
use crate::registry::{HandlerResult, MethodRegistry};
use crate::session::Session;

// ============================================================================
// Errors and Configuration
// ============================================================================

/// Server endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already open")]
    AlreadyOpen,

    #[error("server is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Server construction options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: String,
    /// Heartbeat period
    pub ping_interval: Duration,
    /// How long after a ping a pong must arrive
    pub ping_timeout: Duration,
    /// Version-field policy for inbound envelopes
    pub version_check: VersionCheck,
    /// Logging installed when the server is created; None leaves the
    /// subscriber to the embedder
    pub log: Option<LogConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(5_000),
            version_check: VersionCheck::Strict,
            log: None,
        }
    }
}

impl ServerConfig {
    /// Override the bind address
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Override the heartbeat period
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Override the pong deadline
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Override the version-check policy
    pub fn with_version_check(mut self, check: VersionCheck) -> Self {
        self.version_check = check;
        self
    }

    /// Install logging with this configuration on construction
    pub fn with_logging(mut self, log: LogConfig) -> Self {
        self.log = Some(log);
        self
    }
}

// ============================================================================
// Server
// ============================================================================

/// Tasks alive while the server is open
struct ServerRuntime {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

struct ServerInner {
    config: ServerConfig,
    sessions: RwLock<HashMap<Uuid, Session>>,
    registry: MethodRegistry<Session>,
    engine: Engine<Session>,
    events: broadcast::Sender<ServerEvent>,
    /// Monotonic epoch all heartbeat timestamps are measured from
    epoch: Instant,
    last_ping_at: AtomicU64,
    local_addr: RwLock<Option<SocketAddr>>,
    runtime: tokio::sync::Mutex<Option<ServerRuntime>>,
}

/// JSON-RPC server over WebSocket; cheap to clone
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server; call [`Server::open`] to start listening
    pub fn new(config: ServerConfig) -> Self {
        logging::install_for_endpoint(&config.log);
        let registry = MethodRegistry::new();
        let engine = Engine::new(registry.clone(), config.version_check);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ServerInner {
                config,
                sessions: RwLock::new(HashMap::new()),
                registry,
                engine,
                events,
                epoch: Instant::now(),
                last_ping_at: AtomicU64::new(0),
                local_addr: RwLock::new(None),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Subscribe to server events
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Register a method handler, replacing any previous one
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Session, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.registry.register(method, handler);
    }

    /// Remove a method handler
    pub fn unregister(&self, method: &str) -> bool {
        self.inner.registry.unregister(method)
    }

    /// Remove every method handler
    pub fn clear_methods(&self) {
        self.inner.registry.clear();
    }

    /// Bind the listener and start the accept and heartbeat tasks
    ///
    /// Fails with [`ServerError::AlreadyOpen`] when called twice without
    /// an intervening [`Server::close`].
    pub async fn open(&self) -> Result<SocketAddr, ServerError> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Err(ServerError::AlreadyOpen);
        }

        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self
            .inner
            .local_addr
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(local_addr);

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(Self::accept_loop(self.clone(), listener, cancel.clone()));
        let heartbeat_task = tokio::spawn(Self::heartbeat_loop(self.clone(), cancel.clone()));

        *runtime = Some(ServerRuntime {
            cancel,
            accept_task,
            heartbeat_task,
        });
        drop(runtime);

        info!(addr = %local_addr, "server listening");
        let _ = self.inner.events.send(ServerEvent::Listening);
        Ok(local_addr)
    }

    /// Address the listener is bound to, while open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Stop listening, terminate every session, and empty the session
    /// table; idempotent once closed
    pub async fn close(&self) {
        let runtime = self.inner.runtime.lock().await.take();
        let Some(runtime) = runtime else {
            return;
        };

        runtime.cancel.cancel();
        for session in self.sessions().into_values() {
            session.terminate();
        }
        let _ = runtime.accept_task.await;
        let _ = runtime.heartbeat_task.await;

        let drained: Vec<_> = {
            let mut table = self
                .inner
                .sessions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            table.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.mark_closed();
        }

        info!("server closed");
    }

    // ========================================================================
    // Session Table and Fan-out
    // ========================================================================

    /// Snapshot of every registered session, keyed by id
    pub fn sessions(&self) -> HashMap<Uuid, Session> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Look up one session by id
    pub fn session(&self, id: &Uuid) -> Option<Session> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Number of currently registered sessions
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Snapshot of the sessions currently in a room, keyed by id
    ///
    /// The snapshot does not track membership changes made after it is
    /// taken.
    pub fn in_room(&self, room: &str) -> HashMap<Uuid, Session> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, session)| session.in_room(room))
            .map(|(id, session)| (*id, session.clone()))
            .collect()
    }

    /// Send a notification to every session; the envelope is encoded once
    pub fn broadcast(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ServerError> {
        let payload = serde_json::to_string(&Notification::new(method, params))?;
        for session in self.sessions().into_values() {
            session.send_raw(payload.clone(), false);
        }
        Ok(())
    }

    /// Send a notification to every session in a room
    pub fn notify_to(
        &self,
        room: &str,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ServerError> {
        let payload = serde_json::to_string(&Notification::new(method, params))?;
        for session in self.in_room(room).into_values() {
            session.send_raw(payload.clone(), false);
        }
        Ok(())
    }

    /// Send an arbitrary frame to every session in a room
    pub fn send_to(&self, room: &str, frame: Frame) {
        for session in self.in_room(room).into_values() {
            session.send(frame.clone());
        }
    }

    // ========================================================================
    // Accept Path
    // ========================================================================

    async fn accept_loop(server: Server, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "accept error");
                            let _ = server.inner.events.send(ServerEvent::Error(e.to_string()));
                            continue;
                        }
                    };

                    debug!(peer = %peer_addr, "new connection");
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer_addr).await {
                            warn!(peer = %peer_addr, error = %e, "connection error");
                            let _ = server.inner.events.send(ServerEvent::Error(e.to_string()));
                        }
                    });
                }
            }
        }
        trace!("accept loop finished");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        // Capture the upgrade request for the connection event.
        let captured: Arc<Mutex<Option<(String, Vec<(String, String)>)>>> =
            Arc::new(Mutex::new(None));
        let callback = {
            let captured = Arc::clone(&captured);
            move |request: &Request,
                  response: HandshakeResponse|
                  -> Result<HandshakeResponse, ErrorResponse> {
                let headers = request
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();
                *captured.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some((request.uri().to_string(), headers));
                Ok(response)
            }
        };

        let socket = accept_hdr_async(stream, callback).await?;
        let (sink, stream) = socket.split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let session = Session::new(outbound, self.inner.events.clone(), cancel.clone());

        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id(), session.clone());
        info!(id = %session.id(), peer = %peer_addr, "session registered");

        tokio::spawn(Self::writer_task(sink, outbound_rx, cancel.clone()));

        let (uri, headers) = captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();
        let _ = self.inner.events.send(ServerEvent::Connection {
            session: session.clone(),
            request: ConnectRequest {
                peer_addr,
                uri,
                headers,
            },
        });

        self.read_loop(&session, stream, cancel).await;
        self.remove_session(&session);
        Ok(())
    }

    async fn writer_task(
        mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            debug!(error = %e, "write error");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        trace!("writer task finished");
    }

    async fn read_loop(
        &self,
        session: &Session,
        mut stream: SplitStream<WebSocketStream<TcpStream>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(id = %session.id(), "session read loop cancelled");
                    break;
                }

                next = stream.next() => match next {
                    Some(Ok(Message::Pong(_))) => session.note_pong(self.now_ms()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(message)) => {
                        if let Some(frame) = Frame::from_message(message) {
                            self.inner.engine.handle(session, frame).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(id = %session.id(), error = %e, "socket error");
                        let _ = self.inner.events.send(ServerEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    fn remove_session(&self, session: &Session) {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id());
        session.mark_closed();
        debug!(id = %session.id(), "session removed");
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    async fn heartbeat_loop(server: Server, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(server.inner.config.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; skip it so the
        // first heartbeat lands one full period after open.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => server.heartbeat_tick(),
            }
        }
        trace!("heartbeat loop finished");
    }

    fn heartbeat_tick(&self) {
        let now = self.now_ms();
        let deadline = self.inner.last_ping_at.load(Ordering::SeqCst)
            + self.inner.config.ping_timeout.as_millis() as u64;

        for session in self.sessions().into_values() {
            if !session.heartbeat_tick(deadline) {
                debug!(id = %session.id(), "no pong within heartbeat window");
                session.terminate();
            }
        }

        self.inner.last_ping_at.store(now, Ordering::SeqCst);
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }
}
