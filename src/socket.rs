//! The socket (§4.3): serializes/deserializes messages, allocates refs,
//! tracks pending replies, drives heartbeats, routes frames to channels.
//!
//! Sits atop the connection manager exactly the way the teacher's
//! `CdpClient` sits atop its `TransportHandle`: a cheap public handle plus
//! one background task that owns the dispatch/heartbeat state machine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

use crate::channel::{Channel, ChannelSocketFacade};
use crate::clock::Clock;
use crate::connection_manager::{ConnectionManagerHandle, TransportConnectionState, UrlResolver, FORCED_RECONNECTION_REQUESTED, HEARTBEAT_TIMED_OUT};
use crate::error::PhoenixError;
use crate::logger::Logger;
use crate::message::Message;
use crate::options::{SerializerKind, SocketOptions};
use crate::serializer::{BinarySerializer, Encoded, Frame, JsonSerializer, Serializer};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reserved close code for a reconnect forced by a transport-level error.
const PROTOCOL_ERROR: u16 = 4003;
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn serializer_for(kind: SerializerKind) -> Arc<dyn Serializer> {
    match kind {
        SerializerKind::Json => Arc::new(JsonSerializer),
        SerializerKind::Binary => Arc::new(BinarySerializer),
    }
}

/// Merge `vsn` and caller params into the endpoint's query string.
fn build_connect_url(endpoint: &str, vsn: &str, params: &HashMap<String, Value>) -> String {
    let Ok(mut url) = Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("vsn", vsn);
        for (key, value) in params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            query.append_pair(key, &rendered);
        }
    }
    url.to_string()
}

enum SocketTaskCommand {
    HeartbeatTick { generation: u64 },
}

/// Shared state reachable both from the public `PhoenixSocket` handle and
/// from every `Channel` it owns (via `ChannelSocketFacade`).
struct SocketInner {
    manager: ConnectionManagerHandle,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    heartbeat_interval: Duration,
    default_timeout: Duration,
    next_ref: AtomicU64,
    heartbeat_generation: AtomicU64,
    heartbeat_tx: mpsc::Sender<SocketTaskCommand>,
    connected: AtomicBool,
    disposed: AtomicBool,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Message, PhoenixError>>>>,
    channels: Mutex<HashMap<String, Channel>>,
    open_tx: broadcast::Sender<()>,
    close_tx: broadcast::Sender<(u16, String)>,
    error_tx: broadcast::Sender<PhoenixError>,
    message_tx: broadcast::Sender<Message>,
}

impl SocketInner {
    fn alloc_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Push the next heartbeat tick out by `heartbeat_interval`. Called on
    /// every non-heartbeat send, per §4.3's "each send reschedules the next
    /// heartbeat" rule.
    fn bump_heartbeat(&self) {
        let generation = self.heartbeat_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let clock = Arc::clone(&self.clock);
        let interval = self.heartbeat_interval;
        let tx = self.heartbeat_tx.clone();
        tokio::spawn(async move {
            clock.sleep(interval).await;
            let _ = tx.send(SocketTaskCommand::HeartbeatTick { generation }).await;
        });
    }

    fn complete_pending(&self, message_ref: &str, result: Result<Message, PhoenixError>) -> bool {
        if let Some(tx) = self.pending.lock().unwrap().remove(message_ref) {
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    fn fail_all_pending(&self, err: &PhoenixError) {
        for (_, tx) in self.pending.lock().unwrap().drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn channel_snapshot(&self) -> Vec<Channel> {
        self.channels.lock().unwrap().values().cloned().collect()
    }
}

impl ChannelSocketFacade for SocketInner {
    fn next_ref(&self) -> String {
        self.alloc_ref()
    }

    fn encode_and_send(&self, message: Message) -> BoxFuture<'static, Result<(), PhoenixError>> {
        // Every frame reaching this path is channel traffic (join/leave/push),
        // never a heartbeat itself, so it always defers the next tick.
        self.bump_heartbeat();
        let serializer = Arc::clone(&self.serializer);
        let manager = self.manager.clone();
        Box::pin(async move {
            match serializer.encode(&message)? {
                Encoded::Text(text) => manager.add_message(text).await,
                Encoded::Binary(data) => manager.add_binary_message(data).await,
            }
        })
    }

    fn remove_channel(&self, topic: &str) {
        self.channels.lock().unwrap().remove(topic);
    }
}

/// A cheaply-cloneable handle to a socket and its background dispatch task.
#[derive(Clone)]
pub struct PhoenixSocket {
    inner: Arc<SocketInner>,
}

impl PhoenixSocket {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Self {
        let endpoint = endpoint.into();
        let vsn = options.vsn.clone();
        let static_params = options.params.clone();
        let get_params = options.get_params.clone();

        let resolve_url: UrlResolver = Arc::new(move || {
            let endpoint = endpoint.clone();
            let vsn = vsn.clone();
            let static_params = static_params.clone();
            let get_params = get_params.clone();
            Box::pin(async move {
                let params = match &get_params {
                    Some(f) => f(),
                    None => static_params.clone(),
                };
                build_connect_url(&endpoint, &vsn, &params)
            })
        });

        let manager = ConnectionManagerHandle::spawn(
            Arc::clone(&options.transport),
            Arc::clone(&options.clock),
            Arc::clone(&options.logger),
            resolve_url,
            options.reconnect_delays.clone(),
        );

        let (open_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (close_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (message_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(16);

        let inner = Arc::new(SocketInner {
            manager: manager.clone(),
            serializer: serializer_for(options.serializer),
            clock: Arc::clone(&options.clock),
            logger: Arc::clone(&options.logger),
            heartbeat_interval: options.heartbeat_interval,
            default_timeout: options.timeout,
            next_ref: AtomicU64::new(0),
            heartbeat_generation: AtomicU64::new(0),
            heartbeat_tx,
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            open_tx,
            close_tx,
            error_tx,
            message_tx,
        });

        let task = SocketTask {
            inner: Arc::clone(&inner),
            state_rx: inner.manager.subscribe_state(),
            frame_rx: inner.manager.subscribe_frames(),
            error_rx: inner.manager.subscribe_errors(),
            heartbeat_rx,
            latest_heartbeat_ref: None,
        };
        tokio::spawn(task.run());

        Self { inner }
    }

    /// Open the transport. Idempotent: a connect already in flight (or a
    /// live connection) is left alone.
    pub async fn connect(&self) -> Result<(), PhoenixError> {
        self.inner.manager.start(false).await
    }

    /// Stop. `reconnect = false` tears the socket down terminally (there is
    /// no "stopped but resumable" state in the connection manager, so this
    /// is implemented via `dispose`); `reconnect = true` closes the current
    /// transport and immediately starts a fresh attempt.
    pub async fn close(&self, code: Option<u16>, reason: Option<String>, reconnect: bool) -> Result<(), PhoenixError> {
        if reconnect {
            self.inner
                .manager
                .reconnect(code.unwrap_or(FORCED_RECONNECTION_REQUESTED), reason, false)
                .await
        } else {
            self.dispose_with(code.unwrap_or(1000), reason).await
        }
    }

    /// Terminal: clears pending replies and channels, closes the transport.
    pub async fn dispose(&self) -> Result<(), PhoenixError> {
        self.dispose_with(1000, Some("socket disposed".to_string())).await
    }

    async fn dispose_with(&self, code: u16, reason: Option<String>) -> Result<(), PhoenixError> {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.manager.dispose(code, reason).await?;
        self.inner.fail_all_pending(&PhoenixError::Disposed);
        let channels = self.inner.channel_snapshot();
        for channel in channels {
            channel.close().await;
        }
        Ok(())
    }

    /// The existing channel for `topic`, or a freshly constructed one.
    pub fn add_channel(&self, topic: impl Into<String>, params: Option<HashMap<String, Value>>, timeout: Option<Duration>) -> Channel {
        let topic = topic.into();
        let mut channels = self.inner.channels.lock().unwrap();
        if let Some(existing) = channels.get(&topic) {
            return existing.clone();
        }
        let channel = Channel::spawn(
            topic.clone(),
            params.unwrap_or_default(),
            timeout.unwrap_or(self.inner.default_timeout),
            Arc::clone(&self.inner) as Arc<dyn ChannelSocketFacade>,
            Arc::clone(&self.inner.clock),
            Arc::clone(&self.inner.logger),
        );
        channels.insert(topic, channel.clone());
        if self.inner.connected.load(Ordering::SeqCst) {
            let channel = channel.clone();
            tokio::spawn(async move { channel.notify_socket_connected().await });
        }
        channel
    }

    pub async fn remove_channel(&self, channel: &Channel) {
        channel.close().await;
    }

    /// A fresh receiver of `topic`'s public message stream, if it has a
    /// registered channel.
    pub async fn stream_for_topic(&self, topic: &str) -> Option<broadcast::Receiver<Message>> {
        let channel = self.inner.channels.lock().unwrap().get(topic).cloned()?;
        Some(channel.messages().await)
    }

    #[must_use]
    pub fn open_stream(&self) -> broadcast::Receiver<()> {
        self.inner.open_tx.subscribe()
    }

    #[must_use]
    pub fn close_stream(&self) -> broadcast::Receiver<(u16, String)> {
        self.inner.close_tx.subscribe()
    }

    #[must_use]
    pub fn error_stream(&self) -> broadcast::Receiver<PhoenixError> {
        self.inner.error_tx.subscribe()
    }

    #[must_use]
    pub fn message_stream(&self) -> broadcast::Receiver<Message> {
        self.inner.message_tx.subscribe()
    }

    #[must_use]
    pub fn next_ref(&self) -> String {
        self.inner.alloc_ref()
    }

    /// Serialize and send `message` (which must already carry a `ref`),
    /// returning a future for its reply.
    pub async fn send_message(&self, message: Message) -> Result<Message, PhoenixError> {
        let Some(message_ref) = message.message_ref.clone() else {
            return Err(PhoenixError::Protocol {
                message: "send_message requires a message with ref set".to_string(),
            });
        };
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(message_ref.clone(), tx);

        let is_heartbeat = message.is_heartbeat();
        let encoded = self.inner.serializer.encode(&message);
        let send_result = match encoded {
            Ok(Encoded::Text(text)) => self.inner.manager.add_message(text).await,
            Ok(Encoded::Binary(data)) => self.inner.manager.add_binary_message(data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = send_result {
            self.inner.pending.lock().unwrap().remove(&message_ref);
            return Err(e);
        }
        if !is_heartbeat {
            self.inner.bump_heartbeat();
        }
        rx.await.map_err(|_| PhoenixError::Disposed)?
    }

    /// Await a reply to a message sent by other means (e.g. a heartbeat),
    /// without sending anything.
    pub async fn wait_for_message(&self, message_ref: impl Into<String>) -> Result<Message, PhoenixError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(message_ref.into(), tx);
        rx.await.map_err(|_| PhoenixError::Disposed)?
    }
}

struct SocketTask {
    inner: Arc<SocketInner>,
    state_rx: broadcast::Receiver<TransportConnectionState>,
    frame_rx: broadcast::Receiver<crate::transport::TransportFrame>,
    error_rx: broadcast::Receiver<PhoenixError>,
    heartbeat_rx: mpsc::Receiver<SocketTaskCommand>,
    latest_heartbeat_ref: Option<String>,
}

impl SocketTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                state = self.state_rx.recv() => {
                    match state {
                        Ok(state) => self.handle_state(state).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                frame = self.frame_rx.recv() => {
                    match frame {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                err = self.error_rx.recv() => {
                    match err {
                        Ok(err) => self.handle_error(err).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                cmd = self.heartbeat_rx.recv() => {
                    match cmd {
                        Some(SocketTaskCommand::HeartbeatTick { generation }) => self.handle_heartbeat_tick(generation).await,
                        None => {}
                    }
                }
            }
            if self.inner.manager.is_disposed() {
                return;
            }
        }
    }

    async fn handle_state(&mut self, state: TransportConnectionState) {
        match state {
            TransportConnectionState::Connected => {
                self.inner.connected.store(true, Ordering::SeqCst);
                let _ = self.inner.open_tx.send(());
                for channel in self.inner.channel_snapshot() {
                    channel.notify_socket_connected().await;
                }
                self.send_heartbeat().await;
            }
            TransportConnectionState::Disconnected { code, reason } => {
                self.inner.connected.store(false, Ordering::SeqCst);
                self.latest_heartbeat_ref = None;
                let _ = self.inner.close_tx.send((code, reason));
                for channel in self.inner.channel_snapshot() {
                    channel.notify_socket_disconnected().await;
                }
            }
            TransportConnectionState::Connecting | TransportConnectionState::Disconnecting => {}
        }
    }

    async fn handle_frame(&mut self, frame: crate::transport::TransportFrame) {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return;
        }
        let decode_result = match &frame {
            crate::transport::TransportFrame::Text(text) => self.inner.serializer.decode(&Frame::Text(text)),
            crate::transport::TransportFrame::Binary(data) => self.inner.serializer.decode(&Frame::Binary(data)),
        };
        let message = match decode_result {
            Ok(message) => message,
            Err(e) => {
                self.inner.logger.warn(&format!("failed to decode inbound frame: {e}"));
                return;
            }
        };

        // Any received frame is proof of life for the heartbeat watchdog.
        self.latest_heartbeat_ref = None;

        if let Some(message_ref) = message.message_ref.clone() {
            self.inner.complete_pending(&message_ref, Ok(message.clone()));
        }

        if !message.topic.is_empty() {
            let _ = self.inner.message_tx.send(message.clone());
            let channel = self.inner.channels.lock().unwrap().get(&message.topic).cloned();
            if let Some(channel) = channel {
                channel.deliver(message).await;
            }
        }
    }

    async fn handle_error(&mut self, err: PhoenixError) {
        let _ = self.inner.error_tx.send(err.clone());
        self.inner.fail_all_pending(&err);
        for channel in self.inner.channel_snapshot() {
            channel.trigger_error(err.clone()).await;
        }
        if !self.inner.manager.is_disposed() {
            let _ = self
                .inner
                .manager
                .reconnect(PROTOCOL_ERROR, Some("protocol error".to_string()), false)
                .await;
        }
    }

    async fn handle_heartbeat_tick(&mut self, generation: u64) {
        if generation != self.inner.heartbeat_generation.load(Ordering::SeqCst) {
            return; // superseded by a more recent send or heartbeat
        }
        if let Some(message_ref) = self.latest_heartbeat_ref.take() {
            self.inner.complete_pending(&message_ref, Err(PhoenixError::HeartbeatFailed));
            let _ = self
                .inner
                .manager
                .reconnect(HEARTBEAT_TIMED_OUT, Some("Heartbeat timeout".to_string()), false)
                .await;
            return;
        }
        self.send_heartbeat().await;
    }

    async fn send_heartbeat(&mut self) {
        let message_ref = self.inner.alloc_ref();
        self.latest_heartbeat_ref = Some(message_ref.clone());
        let (tx, _rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(message_ref.clone(), tx);

        let message = Message::heartbeat(message_ref);
        match self.inner.serializer.encode(&message) {
            Ok(Encoded::Text(text)) => {
                let _ = self.inner.manager.add_message(text).await;
            }
            Ok(Encoded::Binary(data)) => {
                let _ = self.inner.manager.add_binary_message(data).await;
            }
            Err(e) => self.inner.logger.warn(&format!("failed to encode heartbeat: {e}")),
        }
        self.inner.bump_heartbeat();
    }
}
