//! Socket configuration surface (§3): a programmatic builder, not a file or
//! environment layer — the ambient "configuration" concern here is
//! `SocketOptions` itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::clock::{Clock, TokioClock};
use crate::error::PhoenixError;
use crate::logger::{Logger, NoopLogger};
use crate::transport::{Transport, TungsteniteTransport};

/// Which wire serialization a socket uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    #[default]
    Json,
    Binary,
}

/// A function that computes connection params at connect time, e.g. to
/// attach a freshly-minted auth token on every (re)connect.
pub type ParamsFn = Arc<dyn Fn() -> HashMap<String, Value> + Send + Sync>;

/// Construction-time configuration for a `PhoenixSocket`.
///
/// Built with `SocketOptions::new` plus the `with_*` setters; validated by
/// `build()`, which is the only way to obtain a value — this is how an empty
/// `reconnect_delays` list is rejected before a socket is ever constructed.
pub struct SocketOptions {
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delays: Vec<Duration>,
    pub params: HashMap<String, Value>,
    pub get_params: Option<ParamsFn>,
    pub serializer: SerializerKind,
    pub vsn: String,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub logger: Arc<dyn Logger>,
}

impl SocketOptions {
    /// The spec's default backoff ladder, in milliseconds:
    /// 10ms, 50ms, 100ms, 150ms, 200ms, 250ms, 500ms, 1s, 2s, then 5s forever.
    #[must_use]
    pub fn default_reconnect_delays() -> Vec<Duration> {
        [10, 50, 100, 150, 200, 250, 500, 1_000, 2_000, 5_000]
            .into_iter()
            .map(Duration::from_millis)
            .collect()
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delays: Self::default_reconnect_delays(),
            params: HashMap::new(),
            get_params: None,
            serializer: SerializerKind::Json,
            vsn: "2.0.0".to_string(),
            transport: Arc::new(TungsteniteTransport),
            clock: Arc::new(TokioClock),
            logger: Arc::new(NoopLogger),
        }
    }
}

/// Builder wrapping `SocketOptions`; `build()` performs validation.
#[derive(Default)]
pub struct SocketOptionsBuilder {
    options: SocketOptions,
}

impl SocketOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.options.reconnect_delays = delays;
        self
    }

    #[must_use]
    pub fn params(mut self, params: HashMap<String, Value>) -> Self {
        self.options.params = params;
        self
    }

    #[must_use]
    pub fn get_params(mut self, get_params: ParamsFn) -> Self {
        self.options.get_params = Some(get_params);
        self
    }

    #[must_use]
    pub fn serializer(mut self, serializer: SerializerKind) -> Self {
        self.options.serializer = serializer;
        self
    }

    #[must_use]
    pub fn vsn(mut self, vsn: impl Into<String>) -> Self {
        self.options.vsn = vsn.into();
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.options.transport = transport;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.options.clock = clock;
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.options.logger = logger;
        self
    }

    /// Validate and produce the final options. Fails if `reconnect_delays`
    /// is empty: a socket with no backoff ladder has nothing to reconnect
    /// with and is rejected at construction time rather than at first use.
    pub fn build(self) -> Result<SocketOptions, PhoenixError> {
        if self.options.reconnect_delays.is_empty() {
            return Err(PhoenixError::InvalidConfiguration {
                reason: "reconnect_delays must not be empty".to_string(),
            });
        }
        Ok(self.options)
    }
}
