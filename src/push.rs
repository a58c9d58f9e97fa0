//! A single outbound message's lifecycle (§4.5).
//!
//! `Push` itself is a thin, cloneable handle: the actual bookkeeping (the
//! allocated ref, the timeout timer, the status-keyed callback multimap,
//! the single-shot completion) lives inside the owning channel's task and
//! is reached through `ChannelCommand`s. This keeps "per-channel state is
//! mutated only by that channel's task" true even for pushes, which in a
//! naive design would tempt a `Mutex<PushState>` shared with the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::PhoenixError;
use crate::message::PushResponse;

/// A process-wide counter for push identities, distinct from the wire
/// `ref`: a buffered push has an id before it ever gets a ref.
static NEXT_PUSH_ID: AtomicU64 = AtomicU64::new(1);

#[must_use]
pub(crate) fn next_push_id() -> u64 {
    NEXT_PUSH_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cheaply-readable fields the channel task updates as a push progresses.
#[derive(Default)]
pub(crate) struct PushShared {
    pub sent: AtomicBool,
    pub message_ref: Mutex<Option<String>>,
}

/// A per-status callback registered via `on_reply`.
pub(crate) type ReplyCallback = Box<dyn Fn(&PushResponse) + Send + Sync>;

/// Commands a `Push` handle sends back to its owning channel task.
pub(crate) enum PushCommand {
    OnReply {
        push_id: u64,
        status: String,
        callback: ReplyCallback,
    },
    Resend {
        push_id: u64,
        new_timeout: Option<Duration>,
    },
    Send {
        push_id: u64,
    },
    Reset {
        push_id: u64,
    },
    CancelTimeout {
        push_id: u64,
    },
}

/// A handle to one outbound message's lifecycle, returned by
/// `Channel::push`/`join`/`leave`.
pub struct Push {
    id: u64,
    shared: Arc<PushShared>,
    commands: mpsc::Sender<PushCommand>,
    completion: Option<oneshot::Receiver<Result<PushResponse, PhoenixError>>>,
}

impl Push {
    pub(crate) fn new(
        id: u64,
        shared: Arc<PushShared>,
        commands: mpsc::Sender<PushCommand>,
        completion: oneshot::Receiver<Result<PushResponse, PhoenixError>>,
    ) -> Self {
        Self {
            id,
            shared,
            commands,
            completion: Some(completion),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sent(&self) -> bool {
        self.shared.sent.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn message_ref(&self) -> Option<String> {
        self.shared.message_ref.lock().unwrap().clone()
    }

    /// Await this push's reply. Resolves with the `ok`/`error` response, or
    /// fails with `PhoenixError::ChannelTimeout` if no reply arrived before
    /// the push's timeout.
    ///
    /// # Panics
    /// Panics if called more than once.
    pub async fn future(&mut self) -> Result<PushResponse, PhoenixError> {
        let rx = self.completion.take().expect("future polled more than once");
        rx.await.unwrap_or(Err(PhoenixError::ChannelClosed))
    }

    /// Register a callback invoked when a reply with the given status (`"ok"`,
    /// `"error"`, or `"timeout"`) arrives. Callbacks for a status are invoked
    /// at most once, in registration order, then cleared.
    pub fn on_reply(&self, status: impl Into<String>, callback: impl Fn(&PushResponse) + Send + Sync + 'static) {
        let _ = self.commands.try_send(PushCommand::OnReply {
            push_id: self.id,
            status: status.into(),
            callback: Box::new(callback),
        });
    }

    /// Cancel the pending timeout timer without otherwise altering state.
    pub fn cancel_timeout(&self) {
        let _ = self.commands.try_send(PushCommand::CancelTimeout { push_id: self.id });
    }

    /// Clear `received`, the allocated ref and reply event, and `sent`.
    /// Registered waiters (callbacks) are untouched.
    pub fn reset(&self) {
        let _ = self.commands.try_send(PushCommand::Reset { push_id: self.id });
    }

    /// Send this push if it has not already been sent (or buffered for send
    /// once the channel joins). A no-op if it was already sent: `push`/`join`/
    /// `leave` send (or buffer) the push on construction, so this exists for
    /// completeness and for re-arming a push after `reset()`.
    pub fn send(&self) {
        let _ = self.commands.try_send(PushCommand::Send { push_id: self.id });
    }

    /// Replace the timeout (if given) and re-send, resetting first if this
    /// push was already sent.
    pub fn resend(&self, new_timeout: Option<Duration>) {
        let _ = self.commands.try_send(PushCommand::Resend {
            push_id: self.id,
            new_timeout,
        });
    }
}
