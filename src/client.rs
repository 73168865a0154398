//! Client endpoint
//!
//! One outbound WebSocket connection with automatic reconnection. A
//! supervisor task drives the connection state machine; the shared
//! message engine serves inbound frames, so the client answers requests
//! and notifications from the server exactly like a server session would.
//!
//! States: Idle, Connecting, Open, Reconnecting, Closed. Reconnection
//! sleeps an exponentially growing, jittered delay between attempts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::codec::Frame;
use crate::engine::{Engine, EngineEvent, EnginePeer, VersionCheck};
use crate::events::ClientEvent;
use crate::logging::{self, LogConfig};
use crate::pending::{CallError, PendingCalls};
use crate::protocol::{ErrorCode, ErrorObject, Notification, Request};
use crate::registry::{HandlerResult, MethodRegistry};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Configuration and State
// ============================================================================

/// Client construction options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Whether to reconnect after a lost connection
    pub reconnection: bool,
    /// How many reconnection attempts before giving up
    pub reconnection_attempts: u32,
    /// Initial reconnection delay
    pub reconnection_delay: Duration,
    /// Ceiling for the reconnection delay
    pub reconnection_delay_max: Duration,
    /// Fractional jitter applied symmetrically to each delay
    pub reconnection_jitter: f64,
    /// How long a call waits for its response
    pub method_call_timeout: Duration,
    /// Start connecting as soon as the client is created
    pub auto_connect: bool,
    /// Capacity of the outbound buffer used while not connected;
    /// zero disables buffering and such sends reject immediately
    pub send_buffer: usize,
    /// Query parameters appended to the connect URL
    pub query: Vec<(String, String)>,
    /// Value for the Sec-WebSocket-Protocol header; empty sends none
    pub protocols: String,
    /// Version-field policy for inbound envelopes
    pub version_check: VersionCheck,
    /// Logging installed when the client is created; None leaves the
    /// subscriber to the embedder
    pub log: Option<LogConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnection: true,
            reconnection_attempts: u32::MAX,
            reconnection_delay: Duration::from_millis(1_000),
            reconnection_delay_max: Duration::from_millis(5_000),
            reconnection_jitter: 0.5,
            method_call_timeout: Duration::from_millis(20_000),
            auto_connect: true,
            send_buffer: 0,
            query: Vec::new(),
            protocols: String::new(),
            version_check: VersionCheck::Strict,
            log: None,
        }
    }
}

impl ClientConfig {
    /// Enable or disable reconnection
    pub fn with_reconnection(mut self, reconnection: bool) -> Self {
        self.reconnection = reconnection;
        self
    }

    /// Override the reconnection attempt limit
    pub fn with_reconnection_attempts(mut self, attempts: u32) -> Self {
        self.reconnection_attempts = attempts;
        self
    }

    /// Override the initial and maximum reconnection delays
    pub fn with_reconnection_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnection_delay = initial;
        self.reconnection_delay_max = max;
        self
    }

    /// Override the method call timeout
    pub fn with_method_call_timeout(mut self, timeout: Duration) -> Self {
        self.method_call_timeout = timeout;
        self
    }

    /// Enable or disable connecting from the constructor
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Enable the outbound buffer with the given capacity
    pub fn with_send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity;
        self
    }

    /// Add a query parameter to the connect URL
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Override the requested subprotocols
    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = protocols.into();
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

/// Connection state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created with `auto_connect` off; waiting for `connect()`
    Idle,
    /// A connection attempt is in flight
    Connecting,
    /// Connected and serving traffic
    Open,
    /// Sleeping before the next reconnection attempt
    Reconnecting,
    /// Terminal: disconnected, reconnection exhausted or disabled
    Closed,
}

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    url: String,
    config: ClientConfig,
    state: Mutex<ClientState>,
    /// Writer-channel of the live connection, if any
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Serialized frames parked while not connected
    buffer: Mutex<VecDeque<Frame>>,
    registry: MethodRegistry<Client>,
    engine: Engine<Client>,
    pending: PendingCalls,
    next_id: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
    connect_requested: Notify,
    skip_reconnection: AtomicBool,
    cancel: CancellationToken,
}

/// JSON-RPC client over WebSocket; cheap to clone
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client for the given `ws://` URL
    ///
    /// With `auto_connect` (the default) the supervisor task starts
    /// connecting immediately; otherwise it waits for [`Client::connect`].
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        logging::install_for_endpoint(&config.log);
        let registry = MethodRegistry::new();
        let engine = Engine::new(registry.clone(), config.version_check);
        let (events, _) = broadcast::channel(256);
        let initial = if config.auto_connect {
            ClientState::Connecting
        } else {
            ClientState::Idle
        };

        let client = Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                config,
                state: Mutex::new(initial),
                outbound: Mutex::new(None),
                buffer: Mutex::new(VecDeque::new()),
                registry,
                engine,
                pending: PendingCalls::new(),
                next_id: AtomicU64::new(0),
                events,
                connect_requested: Notify::new(),
                skip_reconnection: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };

        let supervised = client.clone();
        tokio::spawn(async move { supervised.supervise().await });
        client
    }

    /// Current connection state
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the connection is open
    pub fn is_open(&self) -> bool {
        self.state() == ClientState::Open
    }

    /// Subscribe to client events
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Number of calls currently awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Register a method handler, replacing any previous one
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Client, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.registry.register(method, handler);
    }

    /// Remove a method handler
    pub fn unregister(&self, method: &str) -> bool {
        self.inner.registry.unregister(method)
    }

    /// Start connecting; meaningful when created with `auto_connect` off
    pub fn connect(&self) {
        if self.state() == ClientState::Closed {
            warn!("connect() on a closed client has no effect");
            return;
        }
        self.inner.connect_requested.notify_one();
    }

    /// Close for good: no reconnection, all pending calls rejected
    ///
    /// Idempotent; the second call does nothing.
    pub fn disconnect(&self) {
        if self.state() == ClientState::Closed {
            return;
        }
        info!("client disconnecting");
        self.inner.skip_reconnection.store(true, Ordering::SeqCst);

        // Attempt a polite close before tearing the tasks down.
        if let Some(sender) = self.outbound_sender() {
            let _ = sender.send(Message::Close(None));
        }
        self.inner.cancel.cancel();
        self.inner.pending.reject_all("disconnected");
        self.clear_outbound();
        self.set_state(ClientState::Closed);
        self.emit(ClientEvent::Disconnect {
            code: 1000,
            reason: "client disconnect".to_string(),
        });
        self.emit(ClientEvent::Close);
    }

    // ========================================================================
    // Call and Notify
    // ========================================================================

    /// Issue a request and await its response, with the configured timeout
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, self.inner.config.method_call_timeout)
            .await
    }

    /// Issue a request and await its response, with a custom timeout
    ///
    /// The timeout clock runs from call issuance, including any time the
    /// request spends parked in the outbound buffer.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, method, params);
        let payload = serde_json::to_string(&request)
            .map_err(|e| CallError::Serialization(e.to_string()))?;

        // Register before handing the frame to the writer so a fast
        // response cannot beat the bookkeeping.
        let receiver = self.inner.pending.register(id);
        if let Err(error) = self.send_or_buffer(Frame::Text(payload)) {
            self.inner.pending.remove(id);
            return Err(error);
        }
        debug!(id, method, "call issued");

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Rejected("disconnected".to_string())),
            Err(_) => {
                self.inner.pending.remove(id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Send a notification envelope
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), CallError> {
        let payload = serde_json::to_string(&Notification::new(method, params))
            .map_err(|e| CallError::Serialization(e.to_string()))?;
        self.send_or_buffer(Frame::Text(payload))
    }

    /// Send a frame now, or park it in the buffer while reconnecting
    fn send_or_buffer(&self, frame: Frame) -> Result<(), CallError> {
        if let Some(sender) = self.outbound_sender() {
            return sender
                .send(frame.into_message())
                .map_err(|_| CallError::Rejected("not connected".to_string()));
        }

        if self.state() == ClientState::Closed || self.inner.config.send_buffer == 0 {
            return Err(CallError::Rejected("not connected".to_string()));
        }

        let mut buffer = self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() >= self.inner.config.send_buffer {
            return Err(CallError::Rejected("send buffer full".to_string()));
        }
        buffer.push_back(frame);
        Ok(())
    }

    // ========================================================================
    // Connection Supervisor
    // ========================================================================

    async fn supervise(&self) {
        if !self.inner.config.auto_connect {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = self.inner.connect_requested.notified() => {}
            }
        }

        let mut backoff = Backoff::new(
            self.inner.config.reconnection_delay,
            self.inner.config.reconnection_delay_max,
            self.inner.config.reconnection_jitter,
        );
        let mut attempts: u32 = 0;
        let mut reconnecting = false;

        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }

            self.set_state(ClientState::Connecting);
            self.emit(ClientEvent::Connecting);

            match self.try_connect().await {
                Ok(socket) => {
                    let (sink, stream) = socket.split();
                    let (outbound, outbound_rx) = mpsc::unbounded_channel();
                    *self
                        .inner
                        .outbound
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(outbound);
                    self.set_state(ClientState::Open);

                    if reconnecting {
                        info!(attempts, "reconnected");
                        self.emit(ClientEvent::Reconnected(attempts));
                    } else {
                        info!(url = %self.inner.url, "connected");
                        self.emit(ClientEvent::Connected);
                    }
                    backoff.reset();
                    attempts = 0;
                    reconnecting = false;

                    self.flush_buffer();

                    let write_cancel = CancellationToken::new();
                    let writer =
                        tokio::spawn(Self::writer_task(sink, outbound_rx, write_cancel.clone()));
                    let (code, reason) = self.read_until_close(stream).await;
                    write_cancel.cancel();
                    let _ = writer.await;
                    self.clear_outbound();

                    if self.inner.cancel.is_cancelled()
                        || self.inner.skip_reconnection.load(Ordering::SeqCst)
                    {
                        // disconnect() already emitted its events.
                        break;
                    }
                    if !self.inner.config.reconnection {
                        self.fail_closed(Some((code, reason)));
                        break;
                    }
                    debug!(code, "connection lost");
                }
                Err(e) => {
                    if reconnecting {
                        debug!(error = %e, "reconnect attempt failed");
                        self.emit(ClientEvent::ReconnectError(e.to_string()));
                    } else {
                        warn!(error = %e, "connect failed");
                        self.emit(ClientEvent::Error(e.to_string()));
                    }

                    if self.inner.cancel.is_cancelled()
                        || self.inner.skip_reconnection.load(Ordering::SeqCst)
                    {
                        break;
                    }
                    if !self.inner.config.reconnection {
                        self.fail_closed(None);
                        break;
                    }
                }
            }

            attempts = attempts.saturating_add(1);
            if attempts > self.inner.config.reconnection_attempts {
                self.set_state(ClientState::Closed);
                self.emit(ClientEvent::ReconnectFailed);
                self.inner.pending.reject_all("reconnect failed");
                break;
            }

            self.set_state(ClientState::Reconnecting);
            self.emit(ClientEvent::Reconnecting(attempts));

            let delay = backoff.duration();
            trace!(?delay, attempts, "sleeping before reconnect");
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        trace!("client supervisor finished");
    }

    async fn try_connect(&self) -> Result<Socket, tokio_tungstenite::tungstenite::Error> {
        let request = self.build_request()?;
        let (socket, _response) = connect_async(request).await?;
        Ok(socket)
    }

    fn build_request(
        &self,
    ) -> Result<
        tokio_tungstenite::tungstenite::handshake::client::Request,
        tokio_tungstenite::tungstenite::Error,
    > {
        let mut url = self.inner.url.clone();
        if !self.inner.config.query.is_empty() {
            let query: Vec<String> = self
                .inner
                .config
                .query
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query.join("&"));
        }

        let mut request = url.into_client_request()?;
        if !self.inner.config.protocols.is_empty() {
            let value = HeaderValue::from_str(&self.inner.config.protocols)
                .map_err(|e| tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
        Ok(request)
    }

    async fn writer_task(
        mut sink: SplitSink<Socket, Message>,
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
        trace!("client writer finished");
    }

    /// Serve inbound frames until the connection goes away; returns the
    /// close code and reason observed
    async fn read_until_close(&self, mut stream: SplitStream<Socket>) -> (u16, String) {
        // 1006: abnormal closure, used when the transport just vanished.
        let mut code: u16 = 1006;
        let mut reason = String::new();

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    code = 1000;
                    break;
                }

                next = stream.next() => match next {
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            code = frame.code.into();
                            reason = frame.reason.to_string();
                        }
                        break;
                    }
                    Some(Ok(message)) => {
                        if let Some(frame) = Frame::from_message(message) {
                            self.inner.engine.handle(self, frame).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        self.emit(ClientEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        }

        (code, reason)
    }

    fn flush_buffer(&self) {
        let drained: Vec<Frame> = {
            let mut buffer = self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "flushing buffered frames");
        if let Some(sender) = self.outbound_sender() {
            for frame in drained {
                let _ = sender.send(frame.into_message());
            }
        }
    }

    /// Transition to Closed after a non-reconnecting connection loss
    fn fail_closed(&self, disconnect: Option<(u16, String)>) {
        self.set_state(ClientState::Closed);
        if let Some((code, reason)) = disconnect {
            self.emit(ClientEvent::Disconnect { code, reason });
        }
        self.emit(ClientEvent::Close);
        self.inner.pending.reject_all("disconnected");
    }

    fn handle_method_response(&self, response: Value) {
        let id = response.get("id").cloned().unwrap_or(Value::Null);

        // String ids are reserved for other uses; our calls are numbered.
        let Some(id) = id.as_u64() else {
            debug!(?id, "response with unmatchable id");
            self.emit(ClientEvent::UnknownResponse(response));
            return;
        };

        let outcome = match response.get("error") {
            Some(error_value) => {
                let error = ErrorObject::from_value(error_value).unwrap_or_else(|| {
                    ErrorObject::new(ErrorCode::InternalError).with_data(error_value.clone())
                });
                Err(CallError::Remote(error))
            }
            None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
        };

        if !self.inner.pending.settle(id, outcome) {
            debug!(id, "response for unknown call");
            self.emit(ClientEvent::UnknownResponse(response));
        }
    }

    fn outbound_sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn clear_outbound(&self) {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn set_state(&self, state: ClientState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[async_trait]
impl EnginePeer for Client {
    async fn send_frame(&self, frame: Frame) {
        if let Some(sender) = self.outbound_sender() {
            let _ = sender.send(frame.into_message());
        } else {
            trace!("dropping engine reply while not connected");
        }
    }

    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::Response(response) => {
                trace!(?response, "inbound response");
            }
            EngineEvent::MethodResponse(response) => self.handle_method_response(response),
            EngineEvent::ErrorResponse(response) => {
                Client::emit(self, ClientEvent::ErrorResponse(response));
            }
            EngineEvent::NotificationError(error) => {
                Client::emit(self, ClientEvent::NotificationError(error));
            }
        }
    }
}
