use std::fmt;

use crate::message::PushResponse;

/// Every fallible public operation in this crate returns this error type.
#[derive(Debug, Clone)]
pub enum PhoenixError {
    /// The socket has been disposed; no further operations are possible.
    Disposed,
    /// A push was attempted on a channel that is `closed`.
    ChannelClosed,
    /// A push's reply did not arrive before its timeout.
    ChannelTimeout {
        /// The synthesized timeout response, always `{status: "timeout", response: null}`.
        response: PushResponse,
    },
    /// The transport factory or its `ready` handshake failed.
    ConnectionInitialization {
        /// Stringified cause, since the underlying transport error type is a collaborator detail.
        cause: String,
    },
    /// No heartbeat reply arrived before the next heartbeat tick.
    HeartbeatFailed,
    /// Framing or protocol-level error surfaced by the transport or serializer.
    Protocol {
        /// Human-readable description.
        message: String,
    },
    /// `SocketOptions` failed validation at construction time (e.g. empty `reconnect_delays`).
    InvalidConfiguration {
        /// What was wrong.
        reason: String,
    },
    /// An error bubbled up unchanged from the `Transport` collaborator.
    Transport {
        /// Human-readable description.
        message: String,
    },
}

impl fmt::Display for PhoenixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => write!(f, "socket has been disposed"),
            Self::ChannelClosed => write!(f, "channel is closed"),
            Self::ChannelTimeout { response } => {
                write!(f, "channel push timed out: {response:?}")
            }
            Self::ConnectionInitialization { cause } => {
                write!(f, "connection initialization failed: {cause}")
            }
            Self::HeartbeatFailed => write!(f, "heartbeat timeout"),
            Self::Protocol { message } => write!(f, "protocol error: {message}"),
            Self::InvalidConfiguration { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            Self::Transport { message } => write!(f, "transport error: {message}"),
        }
    }
}

impl std::error::Error for PhoenixError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_channel_timeout() {
        let err = PhoenixError::ChannelTimeout {
            response: PushResponse::timeout(),
        };
        assert!(err.to_string().starts_with("channel push timed out"));
    }

    #[test]
    fn display_invalid_configuration() {
        let err = PhoenixError::InvalidConfiguration {
            reason: "reconnect_delays must not be empty".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: reconnect_delays must not be empty"
        );
    }

    #[test]
    fn display_protocol() {
        let err = PhoenixError::Protocol {
            message: "bad frame".into(),
        };
        assert_eq!(err.to_string(), "protocol error: bad frame");
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: &dyn std::error::Error = &PhoenixError::Disposed;
        assert!(err.source().is_none());
    }

    #[test]
    fn channel_timeout_carries_response_payload() {
        let err = PhoenixError::ChannelTimeout {
            response: PushResponse {
                status: "timeout".into(),
                response: json!(null),
            },
        };
        match err {
            PhoenixError::ChannelTimeout { response } => assert_eq!(response.status, "timeout"),
            _ => panic!("expected ChannelTimeout"),
        }
    }
}
