//! Per-topic state machine (§4.4): join/leave, push buffering, rejoin
//! scheduling, joinRef staleness filtering.
//!
//! Runs as its own task, exactly like the connection manager: "per-channel
//! state is mutated only by that channel's task." The public `Channel` is a
//! cheap handle; a `ChannelSocketFacade` is the channel's only way back to
//! its owning socket, kept deliberately thin to avoid a reference cycle
//! (the socket owns channels, never the reverse).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::clock::Clock;
use crate::error::PhoenixError;
use crate::logger::Logger;
use crate::message::{is_reserved_event, Message, PushResponse, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY};
use crate::push::{next_push_id, Push, PushCommand, PushShared};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const MESSAGES_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// The channel's only way back to its owning socket: allocate a ref, encode
/// and send a message, check connectivity, or deregister itself.
pub(crate) trait ChannelSocketFacade: Send + Sync + 'static {
    fn next_ref(&self) -> String;
    fn encode_and_send(&self, message: Message) -> BoxFuture<'static, Result<(), PhoenixError>>;
    fn remove_channel(&self, topic: &str);
}

/// Where a `Channel` sits in its join/leave lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    Closed,
    Errored,
    Joining,
    Joined,
    Leaving,
}

enum ChannelCommand {
    Join {
        timeout: Option<Duration>,
        respond: oneshot::Sender<Push>,
    },
    Leave {
        timeout: Option<Duration>,
        respond: oneshot::Sender<Push>,
    },
    Push {
        event: String,
        payload: Value,
        timeout: Option<Duration>,
        respond: oneshot::Sender<Push>,
    },
    Close {
        respond: Option<oneshot::Sender<()>>,
    },
    TriggerError(PhoenixError),
    SocketConnected,
    SocketDisconnected,
    Inbound(Message),
    PushTimeout {
        push_id: u64,
        generation: u64,
    },
    Subscribe {
        respond: oneshot::Sender<broadcast::Receiver<Message>>,
    },
    RejoinTimerFired {
        generation: u64,
    },
}

/// A cheaply-cloneable handle to a running channel task.
#[derive(Clone)]
pub struct Channel {
    topic: String,
    commands: mpsc::Sender<ChannelCommand>,
    lifecycle: Arc<Mutex<ChannelLifecycle>>,
    join_ref: Arc<Mutex<Option<String>>>,
}

impl Channel {
    #[must_use]
    pub(crate) fn spawn(
        topic: String,
        params: HashMap<String, Value>,
        default_timeout: Duration,
        socket: Arc<dyn ChannelSocketFacade>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (push_tx, push_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (messages_tx, _) = broadcast::channel(MESSAGES_CHANNEL_CAPACITY);
        let lifecycle = Arc::new(Mutex::new(ChannelLifecycle::Closed));
        let join_ref = Arc::new(Mutex::new(None));

        let task = ChannelTask {
            topic: topic.clone(),
            params,
            default_timeout,
            socket,
            clock,
            logger,
            command_tx: command_tx.clone(),
            command_rx,
            push_tx,
            push_rx,
            messages_tx: Some(messages_tx),
            lifecycle: Arc::clone(&lifecycle),
            join_ref: Arc::clone(&join_ref),
            socket_connected: false,
            pushes: HashMap::new(),
            ref_index: HashMap::new(),
            push_buffer: VecDeque::new(),
            join_push_id: None,
            leave_push_id: None,
            rejoin_generation: 0,
        };
        tokio::spawn(task.run());

        Self {
            topic,
            commands: command_tx,
            lifecycle,
            join_ref,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn state(&self) -> ChannelLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.join_ref.lock().unwrap().clone()
    }

    /// Attempt to join. Idempotent: if a join is already in flight or
    /// complete, this observes the same underlying join push.
    pub async fn join(&self, timeout: Option<Duration>) -> Push {
        let (respond, rx) = oneshot::channel();
        if self.commands.send(ChannelCommand::Join { timeout, respond }).await.is_err() {
            return already_closed_push();
        }
        rx.await.unwrap_or_else(|_| already_closed_push())
    }

    pub async fn leave(&self, timeout: Option<Duration>) -> Push {
        let (respond, rx) = oneshot::channel();
        if self.commands.send(ChannelCommand::Leave { timeout, respond }).await.is_err() {
            return already_closed_push();
        }
        rx.await.unwrap_or_else(|_| already_closed_push())
    }

    /// Push `event`/`payload`. Requires a join to have been attempted at
    /// least once; fails synchronously with `ChannelClosed` if the channel
    /// is already closed.
    pub async fn push(&self, event: impl Into<String>, payload: Value, timeout: Option<Duration>) -> Result<Push, PhoenixError> {
        if *self.lifecycle.lock().unwrap() == ChannelLifecycle::Closed {
            return Err(PhoenixError::ChannelClosed);
        }
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(ChannelCommand::Push {
                event: event.into(),
                payload,
                timeout,
                respond,
            })
            .await
            .map_err(|_| PhoenixError::ChannelClosed)?;
        rx.await.map_err(|_| PhoenixError::ChannelClosed)
    }

    /// Idempotent. Fails all outstanding pushes, tears down the channel's
    /// stream, and deregisters from the socket.
    pub async fn close(&self) {
        let (respond, rx) = oneshot::channel();
        if self.commands.send(ChannelCommand::Close { respond: Some(respond) }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn trigger_error(&self, err: PhoenixError) {
        let _ = self.commands.send(ChannelCommand::TriggerError(err)).await;
    }

    pub(crate) async fn notify_socket_connected(&self) {
        let _ = self.commands.send(ChannelCommand::SocketConnected).await;
    }

    pub(crate) async fn notify_socket_disconnected(&self) {
        let _ = self.commands.send(ChannelCommand::SocketDisconnected).await;
    }

    pub(crate) async fn deliver(&self, message: Message) {
        let _ = self.commands.send(ChannelCommand::Inbound(message)).await;
    }

    /// A fresh multi-consumer receiver of this channel's public message
    /// stream; excludes `phx_reply` envelopes (those surface via `Push`).
    pub async fn messages(&self) -> broadcast::Receiver<Message> {
        let (respond, rx) = oneshot::channel();
        if self.commands.send(ChannelCommand::Subscribe { respond }).await.is_err() {
            return closed_receiver();
        }
        rx.await.unwrap_or_else(|_| closed_receiver())
    }
}

fn closed_receiver() -> broadcast::Receiver<Message> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}

/// A synthetic, already-failed `Push` for when the channel task is gone.
fn already_closed_push() -> Push {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(PhoenixError::ChannelClosed));
    let (cmd_tx, _cmd_rx) = mpsc::channel(1);
    Push::new(next_push_id(), Arc::new(PushShared::default()), cmd_tx, rx)
}

struct PushRecord {
    event: String,
    payload: Value,
    timeout: Duration,
    shared: Arc<PushShared>,
    completion: Option<oneshot::Sender<Result<PushResponse, PhoenixError>>>,
    extra_waiters: Vec<oneshot::Sender<Result<PushResponse, PhoenixError>>>,
    callbacks: HashMap<String, Vec<Box<dyn Fn(&PushResponse) + Send + Sync>>>,
    message_ref: Option<String>,
    sent: bool,
    received: Option<PushResponse>,
    timeout_generation: u64,
}

struct ChannelTask {
    topic: String,
    params: HashMap<String, Value>,
    default_timeout: Duration,
    socket: Arc<dyn ChannelSocketFacade>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    command_tx: mpsc::Sender<ChannelCommand>,
    command_rx: mpsc::Receiver<ChannelCommand>,
    push_tx: mpsc::Sender<PushCommand>,
    push_rx: mpsc::Receiver<PushCommand>,
    messages_tx: Option<broadcast::Sender<Message>>,
    lifecycle: Arc<Mutex<ChannelLifecycle>>,
    join_ref: Arc<Mutex<Option<String>>>,
    socket_connected: bool,
    pushes: HashMap<u64, PushRecord>,
    ref_index: HashMap<String, u64>,
    push_buffer: VecDeque<u64>,
    join_push_id: Option<u64>,
    leave_push_id: Option<u64>,
    rejoin_generation: u64,
}

impl ChannelTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                cmd = self.push_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_push_command(cmd).await,
                        None => {}
                    }
                }
            }
        }
    }

    fn transition(&mut self, new: ChannelLifecycle) {
        *self.lifecycle.lock().unwrap() = new;
    }

    fn state(&self) -> ChannelLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    fn can_push(&self) -> bool {
        self.socket_connected && self.state() == ChannelLifecycle::Joined
    }

    fn make_push(&mut self, event: String, payload: Value, timeout: Duration) -> (u64, Push) {
        let id = next_push_id();
        let shared = Arc::new(PushShared::default());
        let (completion_tx, completion_rx) = oneshot::channel();
        self.pushes.insert(
            id,
            PushRecord {
                event,
                payload,
                timeout,
                shared: Arc::clone(&shared),
                completion: Some(completion_tx),
                extra_waiters: Vec::new(),
                callbacks: HashMap::new(),
                message_ref: None,
                sent: false,
                received: None,
                timeout_generation: 0,
            },
        );
        (id, Push::new(id, shared, self.push_tx.clone(), completion_rx))
    }

    /// Serialize and hand off to the socket, then arm the timeout timer.
    async fn send_push(&mut self, id: u64) {
        let (message_ref, event, payload, timeout, generation) = {
            let Some(record) = self.pushes.get_mut(&id) else { return };
            let message_ref = record.message_ref.clone().unwrap_or_else(|| self.socket.next_ref());
            record.message_ref = Some(message_ref.clone());
            record.sent = true;
            record.timeout_generation += 1;
            record.shared.sent.store(true, Ordering::SeqCst);
            *record.shared.message_ref.lock().unwrap() = Some(message_ref.clone());
            (message_ref, record.event.clone(), record.payload.clone(), record.timeout, record.timeout_generation)
        };
        self.ref_index.insert(message_ref.clone(), id);

        let message = Message::new(self.join_ref.lock().unwrap().clone(), Some(message_ref), self.topic.clone(), event, payload);
        if let Err(err) = self.socket.encode_and_send(message).await {
            self.complete_push(id, Err(err)).await;
            return;
        }
        self.schedule_push_timeout(id, timeout, generation);
    }

    fn schedule_push_timeout(&self, push_id: u64, timeout: Duration, generation: u64) {
        let clock = Arc::clone(&self.clock);
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            clock.sleep(timeout).await;
            let _ = tx.send(ChannelCommand::PushTimeout { push_id, generation }).await;
        });
    }

    fn reset_push(&mut self, id: u64) {
        if let Some(record) = self.pushes.get_mut(&id) {
            if let Some(old_ref) = record.message_ref.take() {
                self.ref_index.remove(&old_ref);
            }
            record.sent = false;
            record.received = None;
            record.timeout_generation += 1;
            record.shared.sent.store(false, Ordering::SeqCst);
            *record.shared.message_ref.lock().unwrap() = None;
        }
    }

    async fn complete_push(&mut self, id: u64, result: Result<PushResponse, PhoenixError>) {
        let Some(mut record) = self.pushes.remove(&id) else { return };
        if record.received.is_some() {
            self.logger.warn("push reply arrived after completion; ignored");
            self.pushes.insert(id, record);
            return;
        }
        let status = match &result {
            Ok(response) => response.status.clone(),
            Err(PhoenixError::ChannelTimeout { response }) => response.status.clone(),
            Err(_) => "error".to_string(),
        };
        let response_for_cb = match &result {
            Ok(response) => Some(response.clone()),
            Err(PhoenixError::ChannelTimeout { response }) => Some(response.clone()),
            Err(_) => None,
        };
        if let Some(response) = &response_for_cb {
            record.received = Some(response.clone());
        }
        if let Some(callbacks) = record.callbacks.remove(&status) {
            if let Some(response) = &response_for_cb {
                for cb in callbacks {
                    cb(response);
                }
            }
        }
        if let Some(tx) = record.completion.take() {
            let _ = tx.send(result.clone());
        }
        for waiter in record.extra_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }

        let is_join = self.join_push_id == Some(id);
        let is_leave = self.leave_push_id == Some(id);
        if is_join || is_leave {
            self.pushes.insert(id, record);
        }

        if is_join {
            self.handle_join_reply(&result).await;
        } else if is_leave {
            self.handle_leave_reply(&result);
        }
    }

    async fn handle_join_reply(&mut self, result: &Result<PushResponse, PhoenixError>) {
        match result {
            Ok(response) if response.is_ok() => {
                self.transition(ChannelLifecycle::Joined);
                self.rejoin_generation += 1;
                let buffered: Vec<u64> = self.push_buffer.drain(..).collect();
                for id in buffered {
                    self.send_push(id).await;
                }
            }
            Ok(_) => {
                self.transition(ChannelLifecycle::Errored);
                if self.socket_connected {
                    self.schedule_rejoin();
                }
            }
            Err(PhoenixError::ChannelTimeout { .. }) => {
                if let Some(id) = self.join_push_id {
                    self.reset_push(id);
                }
                self.transition(ChannelLifecycle::Errored);
                if self.socket_connected {
                    self.schedule_rejoin();
                }
            }
            Err(_) => {
                self.transition(ChannelLifecycle::Errored);
                if self.socket_connected {
                    self.schedule_rejoin();
                }
            }
        }
    }

    fn handle_leave_reply(&mut self, result: &Result<PushResponse, PhoenixError>) {
        let finalize = matches!(result, Ok(_)) || matches!(result, Err(PhoenixError::ChannelTimeout { .. }));
        if finalize {
            self.do_close();
        }
    }

    fn schedule_rejoin(&mut self) {
        self.rejoin_generation += 1;
        let generation = self.rejoin_generation;
        let clock = Arc::clone(&self.clock);
        let timeout = self.default_timeout;
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            clock.sleep(timeout).await;
            let _ = tx.send(ChannelCommand::RejoinTimerFired { generation }).await;
        });
    }

    /// Re-send the (already-prepared) join push with a fresh ref. The
    /// channel's `joinRef` is, by definition, the ref of its most recent
    /// join push: allocate one ref and use it for both.
    async fn attempt_join(&mut self) {
        let Some(join_id) = self.join_push_id else { return };
        self.reset_push(join_id);
        self.assign_join_ref(join_id);
        self.transition(ChannelLifecycle::Joining);
        self.send_push(join_id).await;
    }

    /// Allocate a single ref, set it as both the channel's `joinRef` and the
    /// join push's own `message_ref`, so the outbound frame's `joinRef` and
    /// `ref` are identical, as `S1` requires.
    fn assign_join_ref(&mut self, join_id: u64) {
        let new_ref = self.socket.next_ref();
        *self.join_ref.lock().unwrap() = Some(new_ref.clone());
        if let Some(record) = self.pushes.get_mut(&join_id) {
            record.message_ref = Some(new_ref);
        }
    }

    async fn handle_command(&mut self, cmd: ChannelCommand) -> bool {
        match cmd {
            ChannelCommand::Join { timeout, respond } => {
                self.handle_join(timeout, respond).await;
                false
            }
            ChannelCommand::Leave { timeout, respond } => {
                self.handle_leave(timeout, respond).await;
                false
            }
            ChannelCommand::Push { event, payload, timeout, respond } => {
                self.handle_push(event, payload, timeout, respond).await;
                false
            }
            ChannelCommand::Close { respond } => {
                self.do_close();
                if let Some(respond) = respond {
                    let _ = respond.send(());
                }
                true
            }
            ChannelCommand::TriggerError(err) => {
                self.handle_error(err).await;
                false
            }
            ChannelCommand::SocketConnected => {
                self.socket_connected = true;
                if self.state() == ChannelLifecycle::Errored {
                    self.attempt_join().await;
                }
                false
            }
            ChannelCommand::SocketDisconnected => {
                self.socket_connected = false;
                self.rejoin_generation += 1;
                if matches!(self.state(), ChannelLifecycle::Joined | ChannelLifecycle::Joining) {
                    self.handle_error(PhoenixError::Transport {
                        message: "socket disconnected".to_string(),
                    })
                    .await;
                }
                false
            }
            ChannelCommand::Inbound(message) => {
                self.handle_inbound(message).await;
                false
            }
            ChannelCommand::PushTimeout { push_id, generation } => {
                let matches_generation = self.pushes.get(&push_id).is_some_and(|r| r.timeout_generation == generation);
                if matches_generation {
                    self.complete_push(push_id, Err(PhoenixError::ChannelTimeout { response: PushResponse::timeout() })).await;
                }
                false
            }
            ChannelCommand::Subscribe { respond } => {
                let rx = match &self.messages_tx {
                    Some(tx) => tx.subscribe(),
                    None => closed_receiver(),
                };
                let _ = respond.send(rx);
                false
            }
            ChannelCommand::RejoinTimerFired { generation } => {
                if generation == self.rejoin_generation && self.state() == ChannelLifecycle::Errored && self.socket_connected {
                    self.attempt_join().await;
                }
                false
            }
        }
    }

    async fn handle_join(&mut self, timeout: Option<Duration>, respond: oneshot::Sender<Push>) {
        let timeout = timeout.unwrap_or(self.default_timeout);
        if let Some(id) = self.join_push_id {
            // Already attempted once: idempotent re-join observes the same push.
            let record = self.pushes.get_mut(&id).expect("join push record must exist");
            if let Some(response) = record.received.clone() {
                let (tx, rx) = oneshot::channel();
                let result = if response.is_timeout() {
                    Err(PhoenixError::ChannelTimeout { response })
                } else {
                    Ok(response)
                };
                let _ = tx.send(result);
                let _ = respond.send(Push::new(id, Arc::clone(&record.shared), self.push_tx.clone(), rx));
            } else {
                let (tx, rx) = oneshot::channel();
                record.extra_waiters.push(tx);
                let _ = respond.send(Push::new(id, Arc::clone(&record.shared), self.push_tx.clone(), rx));
            }
            return;
        }

        let params_payload = Value::Object(self.params.clone().into_iter().collect());
        let (id, push) = self.make_push(PHX_JOIN.to_string(), params_payload, timeout);
        self.join_push_id = Some(id);
        let _ = respond.send(push);

        if self.socket_connected {
            self.assign_join_ref(id);
            self.transition(ChannelLifecycle::Joining);
            self.send_push(id).await;
        } else {
            self.transition(ChannelLifecycle::Errored);
        }
    }

    async fn handle_leave(&mut self, timeout: Option<Duration>, respond: oneshot::Sender<Push>) {
        let timeout = timeout.unwrap_or(self.default_timeout);
        if self.state() == ChannelLifecycle::Closed {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(PushResponse::ok(serde_json::json!({}))));
            let _ = respond.send(Push::new(next_push_id(), Arc::new(PushShared::default()), self.push_tx.clone(), rx));
            return;
        }

        let (id, push) = self.make_push(PHX_LEAVE.to_string(), serde_json::json!({}), timeout);
        self.leave_push_id = Some(id);
        self.transition(ChannelLifecycle::Leaving);
        let _ = respond.send(push);

        if self.socket_connected {
            self.send_push(id).await;
        } else {
            self.complete_push(id, Ok(PushResponse::ok(serde_json::json!({})))).await;
        }
    }

    async fn handle_push(&mut self, event: String, payload: Value, timeout: Option<Duration>, respond: oneshot::Sender<Push>) {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (id, push) = self.make_push(event, payload, timeout);
        let _ = respond.send(push);
        if self.can_push() {
            self.send_push(id).await;
        } else {
            self.push_buffer.push_back(id);
        }
    }

    async fn handle_error(&mut self, err: PhoenixError) {
        if matches!(self.state(), ChannelLifecycle::Joined | ChannelLifecycle::Joining) {
            self.transition(ChannelLifecycle::Errored);
            if self.socket_connected {
                self.schedule_rejoin();
            }
            let in_flight: Vec<u64> = self
                .pushes
                .iter()
                .filter(|(id, r)| r.sent && r.received.is_none() && Some(**id) != self.join_push_id && Some(**id) != self.leave_push_id)
                .map(|(id, _)| *id)
                .collect();
            for id in in_flight {
                self.complete_push(id, Err(err.clone())).await;
            }
        }
    }

    async fn handle_inbound(&mut self, message: Message) {
        let current_join_ref = self.join_ref.lock().unwrap().clone();
        if let Some(msg_join_ref) = &message.join_ref {
            if Some(msg_join_ref) != current_join_ref.as_ref() && is_reserved_event(&message.event) {
                return;
            }
        }

        match message.event.as_str() {
            PHX_CLOSE => self.do_close(),
            PHX_ERROR => {
                if self.state() == ChannelLifecycle::Joining {
                    if let Some(id) = self.join_push_id {
                        self.reset_push(id);
                    }
                }
                self.transition(ChannelLifecycle::Errored);
                if self.socket_connected {
                    self.schedule_rejoin();
                }
            }
            PHX_REPLY => {
                if let Some(message_ref) = &message.message_ref {
                    if let Some(id) = self.ref_index.get(message_ref).copied() {
                        let response = PushResponse::from_reply_payload(&message.payload);
                        let result = if response.is_timeout() {
                            Err(PhoenixError::ChannelTimeout { response })
                        } else {
                            Ok(response)
                        };
                        self.complete_push(id, result).await;
                    }
                }
            }
            other => {
                if !is_reserved_event(other) {
                    if let Some(tx) = &self.messages_tx {
                        let _ = tx.send(message);
                    }
                }
            }
        }
    }

    async fn handle_push_command(&mut self, cmd: PushCommand) {
        match cmd {
            PushCommand::OnReply { push_id, status, callback } => {
                if let Some(record) = self.pushes.get_mut(&push_id) {
                    record.callbacks.entry(status).or_default().push(callback);
                }
            }
            PushCommand::Resend { push_id, new_timeout } => {
                let should_send = if let Some(record) = self.pushes.get_mut(&push_id) {
                    if let Some(t) = new_timeout {
                        record.timeout = t;
                    }
                    if record.sent {
                        self.reset_push(push_id);
                    }
                    true
                } else {
                    false
                };
                if should_send {
                    if self.can_push() {
                        self.send_push(push_id).await;
                    } else {
                        self.push_buffer.push_back(push_id);
                    }
                }
            }
            PushCommand::Send { push_id } => {
                let already_sent = self.pushes.get(&push_id).is_some_and(|r| r.sent);
                if !already_sent {
                    if self.can_push() {
                        self.send_push(push_id).await;
                    } else if !self.push_buffer.contains(&push_id) {
                        self.push_buffer.push_back(push_id);
                    }
                }
            }
            PushCommand::Reset { push_id } => self.reset_push(push_id),
            PushCommand::CancelTimeout { push_id } => {
                if let Some(record) = self.pushes.get_mut(&push_id) {
                    record.timeout_generation += 1;
                }
            }
        }
    }

    fn do_close(&mut self) {
        if self.state() == ChannelLifecycle::Closed {
            return;
        }
        self.transition(ChannelLifecycle::Closed);
        self.rejoin_generation += 1;

        let ids: Vec<u64> = self.pushes.keys().copied().collect();
        for id in ids {
            self.fail_push_terminal(id, PhoenixError::ChannelClosed);
        }
        self.pushes.clear();
        self.ref_index.clear();
        self.push_buffer.clear();
        self.join_push_id = None;
        self.leave_push_id = None;
        self.messages_tx = None;
        self.socket.remove_channel(&self.topic);
    }

    fn fail_push_terminal(&mut self, id: u64, err: PhoenixError) {
        if let Some(mut record) = self.pushes.remove(&id) {
            if record.received.is_none() {
                if let Some(tx) = record.completion.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                for waiter in record.extra_waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::logger::NoopLogger;
    use std::sync::Mutex as StdMutex;

    /// Records every outbound message and hands back a ref allocator,
    /// standing in for the socket a `Channel` would otherwise sit under.
    struct RecordingFacade {
        sent: StdMutex<Vec<Message>>,
        next_ref: std::sync::atomic::AtomicU64,
        removed: StdMutex<Vec<String>>,
    }

    impl RecordingFacade {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                next_ref: std::sync::atomic::AtomicU64::new(1),
                removed: StdMutex::new(Vec::new()),
            })
        }

        fn sent_events(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|m| m.event.clone()).collect()
        }

        fn last_sent(&self) -> Message {
            self.sent.lock().unwrap().last().expect("expected at least one sent message").clone()
        }
    }

    impl ChannelSocketFacade for RecordingFacade {
        fn next_ref(&self) -> String {
            self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
        }

        fn encode_and_send(&self, message: Message) -> BoxFuture<'static, Result<(), PhoenixError>> {
            self.sent.lock().unwrap().push(message);
            Box::pin(async { Ok(()) })
        }

        fn remove_channel(&self, topic: &str) {
            self.removed.lock().unwrap().push(topic.to_string());
        }
    }

    fn spawn_test_channel() -> (Channel, Arc<RecordingFacade>, FakeClock) {
        let facade = RecordingFacade::new();
        let clock = FakeClock::new();
        let channel = Channel::spawn(
            "room:lobby".to_string(),
            HashMap::new(),
            Duration::from_millis(50),
            facade.clone() as Arc<dyn ChannelSocketFacade>,
            Arc::new(clock.clone()),
            Arc::new(NoopLogger),
        );
        (channel, facade, clock)
    }

    fn reply(join_ref: Option<&str>, message_ref: &str, status: &str, response: Value) -> Message {
        Message::new(
            join_ref.map(str::to_string),
            Some(message_ref.to_string()),
            "room:lobby",
            PHX_REPLY,
            serde_json::json!({"status": status, "response": response}),
        )
    }

    #[tokio::test]
    async fn join_then_reply_transitions_to_joined() {
        let (channel, facade, _clock) = spawn_test_channel();
        channel.notify_socket_connected().await;
        tokio::task::yield_now().await;

        let mut push = channel.join(None).await;
        tokio::task::yield_now().await;
        assert_eq!(facade.sent_events(), vec![PHX_JOIN]);

        let sent_ref = facade.last_sent().message_ref.unwrap();
        channel.deliver(reply(channel.join_ref().as_deref(), &sent_ref, "ok", serde_json::json!({}))).await;

        let response = push.future().await.unwrap();
        assert!(response.is_ok());
        assert_eq!(channel.state(), ChannelLifecycle::Joined);
    }

    #[tokio::test]
    async fn second_join_call_observes_the_same_push_instead_of_resending() {
        let (channel, facade, _clock) = spawn_test_channel();
        channel.notify_socket_connected().await;
        tokio::task::yield_now().await;

        let mut first = channel.join(None).await;
        tokio::task::yield_now().await;
        let mut second = channel.join(None).await;
        tokio::task::yield_now().await;

        // Only one phx_join was ever sent, despite two join() calls.
        assert_eq!(facade.sent_events(), vec![PHX_JOIN]);

        let sent_ref = facade.last_sent().message_ref.unwrap();
        channel.deliver(reply(channel.join_ref().as_deref(), &sent_ref, "ok", serde_json::json!({}))).await;

        assert!(first.future().await.unwrap().is_ok());
        assert!(second.future().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn push_before_joined_is_buffered_then_flushed_on_join_reply() {
        let (channel, facade, _clock) = spawn_test_channel();
        channel.notify_socket_connected().await;
        tokio::task::yield_now().await;

        let _join_push = channel.join(None).await;
        tokio::task::yield_now().await;

        let mut buffered = channel.push("hello!", serde_json::json!({"foo": "bar"}), None).await.unwrap();
        tokio::task::yield_now().await;
        // The buffered push must not have gone out before the join reply.
        assert_eq!(facade.sent_events(), vec![PHX_JOIN]);

        let join_ref = facade.last_sent().message_ref.unwrap();
        channel.deliver(reply(channel.join_ref().as_deref(), &join_ref, "ok", serde_json::json!({}))).await;
        tokio::task::yield_now().await;

        assert_eq!(facade.sent_events(), vec![PHX_JOIN, "hello!"]);

        let pushed_ref = facade.last_sent().message_ref.unwrap();
        channel
            .deliver(reply(channel.join_ref().as_deref(), &pushed_ref, "ok", serde_json::json!({"name": "bar"})))
            .await;
        let response = buffered.future().await.unwrap();
        assert_eq!(response.response["name"], "bar");
    }

    #[tokio::test]
    async fn error_while_joined_schedules_a_rejoin_that_fires_on_the_clock() {
        let (channel, facade, clock) = spawn_test_channel();
        channel.notify_socket_connected().await;
        tokio::task::yield_now().await;

        let _join_push = channel.join(None).await;
        tokio::task::yield_now().await;
        let join_ref = facade.last_sent().message_ref.unwrap();
        channel.deliver(reply(channel.join_ref().as_deref(), &join_ref, "ok", serde_json::json!({}))).await;
        tokio::task::yield_now().await;
        assert_eq!(channel.state(), ChannelLifecycle::Joined);

        channel.trigger_error(PhoenixError::Transport { message: "boom".to_string() }).await;
        tokio::task::yield_now().await;
        assert_eq!(channel.state(), ChannelLifecycle::Errored);

        clock.fire();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // The rejoin attempt re-sent phx_join with a freshly allocated ref.
        assert_eq!(facade.sent_events(), vec![PHX_JOIN, PHX_JOIN]);
        assert_eq!(channel.state(), ChannelLifecycle::Joining);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_deregisters_from_the_socket() {
        let (channel, facade, _clock) = spawn_test_channel();
        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state(), ChannelLifecycle::Closed);
        assert_eq!(facade.removed.lock().unwrap().as_slice(), ["room:lobby"]);
    }

    #[tokio::test]
    async fn stale_join_ref_reserved_event_is_filtered_from_delivery() {
        let (channel, facade, _clock) = spawn_test_channel();
        channel.notify_socket_connected().await;
        tokio::task::yield_now().await;

        let _join_push = channel.join(None).await;
        tokio::task::yield_now().await;
        let join_ref = facade.last_sent().message_ref.unwrap();
        channel.deliver(reply(Some(&join_ref), &join_ref, "ok", serde_json::json!({}))).await;
        tokio::task::yield_now().await;
        assert_eq!(channel.state(), ChannelLifecycle::Joined);

        let mut messages = channel.messages().await;

        // A phx_error carrying a stale joinRef must not affect the current join.
        channel
            .deliver(Message::new(Some("stale-ref".to_string()), None, "room:lobby", PHX_ERROR, serde_json::json!({})))
            .await;
        tokio::task::yield_now().await;
        assert_eq!(channel.state(), ChannelLifecycle::Joined);

        // A non-reserved event for the topic still reaches the public stream
        // regardless of joinRef.
        channel
            .deliver(Message::new(Some("stale-ref".to_string()), None, "room:lobby", "new_msg", serde_json::json!({"body": "hi"})))
            .await;
        let delivered = messages.recv().await.unwrap();
        assert_eq!(delivered.event, "new_msg");
    }
}
