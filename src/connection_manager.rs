//! Reconnect state machine: the single source of truth for "do we have a
//! live transport?" (§4.2). Runs as a background task; callers talk to it
//! through a cheaply-cloneable handle, mirroring how the rest of the crate's
//! actor-shaped components own their mutable state on one task.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::clock::Clock;
use crate::delayed_attempt::DelayedAttempt;
use crate::error::PhoenixError;
use crate::logger::Logger;
use crate::transport::{Transport, TransportConnection, TransportFrame};

/// Reserved close code: the heartbeat watchdog gave up on a reply.
pub const HEARTBEAT_TIMED_OUT: u16 = 4001;
/// Reserved close code: a caller asked for an immediate forced reconnect.
pub const FORCED_RECONNECTION_REQUESTED: u16 = 4002;
const NORMAL_CLOSURE: u16 = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tagged lifecycle state of the transport the manager currently owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected { code: u16, reason: String },
}

/// Resolves the URL to dial for a fresh attempt (supports async/dynamic params).
pub type UrlResolver = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// An outbound frame, text or binary, queued for the live transport.
enum OutboundPayload {
    Text(String),
    Binary(Vec<u8>),
}

enum Command {
    Start {
        immediate: bool,
    },
    AddMessage {
        payload: OutboundPayload,
        respond: oneshot::Sender<Result<(), PhoenixError>>,
    },
    Reconnect {
        code: u16,
        reason: Option<String>,
        immediate: bool,
    },
    Dispose {
        code: u16,
        reason: Option<String>,
        respond: oneshot::Sender<()>,
    },
}

/// A cheaply-cloneable handle to a running connection manager task.
#[derive(Clone)]
pub struct ConnectionManagerHandle {
    command_tx: mpsc::Sender<Command>,
    state_tx: broadcast::Sender<TransportConnectionState>,
    frame_tx: broadcast::Sender<TransportFrame>,
    error_tx: broadcast::Sender<PhoenixError>,
    disposed: Arc<AtomicBool>,
}

impl ConnectionManagerHandle {
    /// Spawn a manager task and return a handle to it.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
        resolve_url: UrlResolver,
        reconnect_delays: Vec<Duration>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (frame_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let disposed = Arc::new(AtomicBool::new(false));

        let task = ManagerTask {
            command_rx,
            transport,
            clock,
            logger,
            resolve_url,
            reconnect_delays,
            attempts: 0,
            current_attempt_id: None,
            force_immediate: false,
            state: None,
            connection: None,
            pending_sends: VecDeque::new(),
            disposed: Arc::clone(&disposed),
            state_tx: state_tx.clone(),
            frame_tx: frame_tx.clone(),
            error_tx: error_tx.clone(),
        };
        tokio::spawn(task.run());

        Self {
            command_tx,
            state_tx,
            frame_tx,
            error_tx,
            disposed,
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<TransportConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<TransportFrame> {
        self.frame_tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<PhoenixError> {
        self.error_tx.subscribe()
    }

    /// See §4.2: collapses an active delay, or starts a reconnect cycle if idle.
    pub async fn start(&self, immediate: bool) -> Result<(), PhoenixError> {
        self.send(Command::Start { immediate }).await
    }

    /// Await a connected transport, then send `text` over it.
    pub async fn add_message(&self, text: String) -> Result<(), PhoenixError> {
        self.add_outbound(OutboundPayload::Text(text)).await
    }

    /// Await a connected transport, then send `data` over it as a binary frame.
    pub async fn add_binary_message(&self, data: Vec<u8>) -> Result<(), PhoenixError> {
        self.add_outbound(OutboundPayload::Binary(data)).await
    }

    async fn add_outbound(&self, payload: OutboundPayload) -> Result<(), PhoenixError> {
        if self.is_disposed() {
            return Err(PhoenixError::Disposed);
        }
        let (respond, rx) = oneshot::channel();
        self.command_tx
            .send(Command::AddMessage { payload, respond })
            .await
            .map_err(|_| PhoenixError::Disposed)?;
        rx.await.map_err(|_| PhoenixError::Disposed)?
    }

    pub async fn reconnect(
        &self,
        code: u16,
        reason: Option<String>,
        immediate: bool,
    ) -> Result<(), PhoenixError> {
        if self.is_disposed() {
            return Err(PhoenixError::Disposed);
        }
        self.command_tx
            .send(Command::Reconnect {
                code,
                reason,
                immediate,
            })
            .await
            .map_err(|_| PhoenixError::Disposed)
    }

    pub async fn dispose(&self, code: u16, reason: Option<String>) -> Result<(), PhoenixError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (respond, rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Dispose {
                code,
                reason,
                respond,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<(), PhoenixError> {
        if self.is_disposed() {
            return Err(PhoenixError::Disposed);
        }
        self.command_tx
            .send(command)
            .await
            .map_err(|_| PhoenixError::Disposed)
    }
}

enum ServeOutcome {
    Disconnected,
    Disposed,
}

struct ManagerTask {
    command_rx: mpsc::Receiver<Command>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    resolve_url: UrlResolver,
    reconnect_delays: Vec<Duration>,
    attempts: usize,
    current_attempt_id: Option<u32>,
    force_immediate: bool,
    state: Option<TransportConnectionState>,
    connection: Option<Box<dyn TransportConnection>>,
    pending_sends: VecDeque<(OutboundPayload, oneshot::Sender<Result<(), PhoenixError>>)>,
    disposed: Arc<AtomicBool>,
    state_tx: broadcast::Sender<TransportConnectionState>,
    frame_tx: broadcast::Sender<TransportFrame>,
    error_tx: broadcast::Sender<PhoenixError>,
}

impl ManagerTask {
    async fn run(mut self) {
        'idle: loop {
            match self.command_rx.recv().await {
                Some(Command::Start { immediate }) | Some(Command::Reconnect { immediate, .. }) => {
                    self.force_immediate = immediate;
                    break 'idle;
                }
                Some(Command::AddMessage { payload, respond }) => {
                    self.pending_sends.push_back((payload, respond));
                }
                Some(Command::Dispose { respond, .. }) => {
                    self.disposed.store(true, Ordering::SeqCst);
                    self.fail_pending_sends(PhoenixError::Disposed);
                    let _ = respond.send(());
                    return;
                }
                None => return,
            }
        }

        loop {
            if self.run_reconnect_loop().await.is_err() {
                return;
            }
            match self.run_serving().await {
                ServeOutcome::Disconnected => {}
                ServeOutcome::Disposed => return,
            }
        }
    }

    fn fail_pending_sends(&mut self, err: PhoenixError) {
        for (_, respond) in self.pending_sends.drain(..) {
            let _ = respond.send(Err(err.clone()));
        }
    }

    fn apply_transition(&mut self, new_state: TransportConnectionState) -> bool {
        let accept = match (&self.state, &new_state) {
            (Some(cur), new) if std::mem::discriminant(cur) == std::mem::discriminant(new) => false,
            (Some(_), TransportConnectionState::Connecting) => false,
            (Some(TransportConnectionState::Disconnected { .. }), _) => false,
            (Some(TransportConnectionState::Disconnecting), new)
                if !matches!(new, TransportConnectionState::Disconnected { .. }) =>
            {
                false
            }
            _ => true,
        };
        if accept {
            self.state = Some(new_state.clone());
            let _ = self.state_tx.send(new_state);
        }
        accept
    }

    /// §4.2's reconnect loop. Returns `Ok(())` once a transport is live,
    /// `Err(())` if disposal ended the attempt before one connected.
    async fn run_reconnect_loop(&mut self) -> Result<(), ()> {
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(());
            }

            let delay = if std::mem::take(&mut self.force_immediate) {
                Duration::ZERO
            } else {
                let idx = self.attempts.min(self.reconnect_delays.len() - 1);
                self.reconnect_delays[idx]
            };
            self.attempts += 1;
            // Re-entering the connect loop starts from a clean baseline so
            // the Connecting transition below is never rejected by the
            // same-case/non-null filter above.
            self.state = None;
            self.apply_transition(TransportConnectionState::Connecting);

            let transport = Arc::clone(&self.transport);
            let resolve_url = Arc::clone(&self.resolve_url);

            let delayed = DelayedAttempt::new(delay, Arc::clone(&self.clock), move || async move {
                let url = (resolve_url)().await;
                transport.connect(url).await
            });
            let attempt_handle = delayed.handle();
            let attempt_id = attempt_handle.id();
            self.current_attempt_id = Some(attempt_id);
            let mut callback_rx = delayed.into_receiver();

            loop {
                tokio::select! {
                    result = &mut callback_rx => {
                        let result = result.unwrap_or_else(|_| {
                            Err(PhoenixError::ConnectionInitialization {
                                cause: "attempt task dropped without completing".to_string(),
                            })
                        });
                        match result {
                            Ok(mut conn) => {
                                if self.current_attempt_id == Some(attempt_id) {
                                    self.attempts = 0;
                                    self.connection = Some(conn);
                                    self.apply_transition(TransportConnectionState::Connected);
                                    return Ok(());
                                }
                                self.logger.debug("dropping connection from a superseded attempt");
                                let _ = conn.close(NORMAL_CLOSURE, "superseded attempt".to_string()).await;
                                break;
                            }
                            Err(e) => {
                                if self.current_attempt_id == Some(attempt_id) {
                                    self.logger.warn(&format!("connection attempt failed: {e}"));
                                    let _ = self.error_tx.send(e);
                                }
                                break;
                            }
                        }
                    }
                    cmd = self.command_rx.recv() => {
                        match cmd {
                            Some(Command::Start { immediate }) => {
                                if immediate {
                                    attempt_handle.skip_delay();
                                }
                            }
                            Some(Command::Reconnect { immediate, .. }) => {
                                if immediate {
                                    attempt_handle.skip_delay();
                                }
                            }
                            Some(Command::AddMessage { payload, respond }) => {
                                self.pending_sends.push_back((payload, respond));
                            }
                            Some(Command::Dispose { respond, .. }) => {
                                self.disposed.store(true, Ordering::SeqCst);
                                attempt_handle.abort();
                                self.fail_pending_sends(PhoenixError::Disposed);
                                let _ = respond.send(());
                                return Err(());
                            }
                            None => {
                                self.disposed.store(true, Ordering::SeqCst);
                                return Err(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drain anything queued while disconnected, now that we have a live
    /// connection, preserving FIFO send order.
    async fn drain_pending_sends(&mut self) {
        while let Some((payload, respond)) = self.pending_sends.pop_front() {
            let conn = self.connection.as_mut().expect("serving implies a live connection");
            let result = send_payload(conn.as_mut(), payload).await;
            let _ = respond.send(result);
        }
    }

    async fn run_serving(&mut self) -> ServeOutcome {
        self.drain_pending_sends().await;

        loop {
            // Pull the connection out of `self` so the two select branches
            // below don't both need a mutable borrow of `self` at once.
            let mut conn = self
                .connection
                .take()
                .expect("serving implies a live connection");

            tokio::select! {
                frame = conn.recv() => {
                    match frame {
                        Ok(Some(f)) => {
                            self.connection = Some(conn);
                            let _ = self.frame_tx.send(f);
                        }
                        Ok(None) => {
                            self.state = None;
                            self.apply_transition(TransportConnectionState::Disconnected {
                                code: NORMAL_CLOSURE,
                                reason: "peer closed".to_string(),
                            });
                            return ServeOutcome::Disconnected;
                        }
                        Err(e) => {
                            self.logger.warn(&format!("transport error: {e}"));
                            let _ = self.error_tx.send(e);
                            self.state = None;
                            self.apply_transition(TransportConnectionState::Disconnected {
                                code: 1006,
                                reason: "transport error".to_string(),
                            });
                            return ServeOutcome::Disconnected;
                        }
                    }
                }
                cmd = self.command_rx.recv() => {
                    self.connection = Some(conn);
                    match cmd {
                        Some(c) => {
                            if let Some(outcome) = self.handle_serving_command(c).await {
                                return outcome;
                            }
                        }
                        None => {
                            self.disposed.store(true, Ordering::SeqCst);
                            return ServeOutcome::Disposed;
                        }
                    }
                }
            }
        }
    }

    async fn handle_serving_command(&mut self, cmd: Command) -> Option<ServeOutcome> {
        match cmd {
            Command::Start { .. } => None, // already connected: no-op per §4.2.
            Command::AddMessage { payload, respond } => {
                let conn = self.connection.as_mut().expect("serving implies a live connection");
                let result = send_payload(conn.as_mut(), payload).await;
                let _ = respond.send(result);
                None
            }
            Command::Reconnect { code, reason, .. } => {
                if let Some(mut conn) = self.connection.take() {
                    let _ = conn.close(code, reason.clone().unwrap_or_default()).await;
                }
                self.state = None;
                self.apply_transition(TransportConnectionState::Disconnected {
                    code,
                    reason: reason.unwrap_or_else(|| "reconnect requested".to_string()),
                });
                Some(ServeOutcome::Disconnected)
            }
            Command::Dispose { code, reason, respond } => {
                self.disposed.store(true, Ordering::SeqCst);
                if let Some(mut conn) = self.connection.take() {
                    let _ = conn.close(code, reason.unwrap_or_default()).await;
                }
                self.fail_pending_sends(PhoenixError::Disposed);
                let _ = respond.send(());
                Some(ServeOutcome::Disposed)
            }
        }
    }
}

async fn send_payload(conn: &mut dyn TransportConnection, payload: OutboundPayload) -> Result<(), PhoenixError> {
    match payload {
        OutboundPayload::Text(text) => conn.send_text(text).await,
        OutboundPayload::Binary(data) => conn.send_binary(data).await,
    }
}
