//! The underlying WebSocket transport, named collaborator interface per §6.
//!
//! The connection-and-channel core only ever talks to a `Transport`/
//! `TransportConnection` pair; tests substitute an in-memory fake, and the
//! default production implementation wraps `tokio-tungstenite`.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::PhoenixError;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A frame received from the transport.
#[derive(Debug, Clone)]
pub enum TransportFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Factory for opening a new transport connection.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<Box<dyn TransportConnection>, PhoenixError>>;
}

/// A live transport connection: send text/binary, close with a code, and a
/// closed-stream of inbound frames (`None` once the peer closes).
pub trait TransportConnection: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), PhoenixError>>;
    fn send_binary(&mut self, data: Vec<u8>) -> BoxFuture<'_, Result<(), PhoenixError>>;
    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), PhoenixError>>;
    /// Await the next inbound frame. `Ok(None)` means the peer closed cleanly.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<TransportFrame>, PhoenixError>>;
}

/// Production transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<Box<dyn TransportConnection>, PhoenixError>> {
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| PhoenixError::Transport { message: e.to_string() })?;
            Ok(Box::new(TungsteniteConnection { stream }) as Box<dyn TransportConnection>)
        })
    }
}

struct TungsteniteConnection {
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

impl TransportConnection for TungsteniteConnection {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), PhoenixError>> {
        Box::pin(async move {
            self.stream
                .send(WsMessage::Text(text.into()))
                .await
                .map_err(|e| PhoenixError::Transport { message: e.to_string() })
        })
    }

    fn send_binary(&mut self, data: Vec<u8>) -> BoxFuture<'_, Result<(), PhoenixError>> {
        Box::pin(async move {
            self.stream
                .send(WsMessage::Binary(data.into()))
                .await
                .map_err(|e| PhoenixError::Transport { message: e.to_string() })
        })
    }

    fn close(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), PhoenixError>> {
        Box::pin(async move {
            use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            self.stream
                .close(Some(frame))
                .await
                .map_err(|e| PhoenixError::Transport { message: e.to_string() })
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<TransportFrame>, PhoenixError>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    None => return Ok(None),
                    Some(Ok(WsMessage::Text(text))) => {
                        return Ok(Some(TransportFrame::Text(text.to_string())));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        return Ok(Some(TransportFrame::Binary(data.to_vec())));
                    }
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    Some(Ok(_)) => continue, // Ping/Pong/Frame — not user-visible frames.
                    Some(Err(e)) => {
                        return Err(PhoenixError::Transport { message: e.to_string() });
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{BoxFuture, PhoenixError, Transport, TransportConnection, TransportFrame};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// An in-memory transport pair for tests: `FakeTransport::connect` always
    /// succeeds (unless told to fail) and hands back a `FakeConnection` whose
    /// `sent` log the test can inspect, and whose inbound queue the test can push into.
    #[derive(Clone, Default)]
    pub struct FakeTransport {
        pub should_fail: Arc<Mutex<Option<String>>>,
    }

    impl Transport for FakeTransport {
        fn connect(&self, _url: String) -> BoxFuture<'static, Result<Box<dyn TransportConnection>, PhoenixError>> {
            let failure = self.should_fail.lock().unwrap().clone();
            Box::pin(async move {
                if let Some(reason) = failure {
                    return Err(PhoenixError::Transport { message: reason });
                }
                Ok(Box::new(FakeConnection::default()) as Box<dyn TransportConnection>)
            })
        }
    }

    #[derive(Default)]
    pub struct FakeConnection {
        pub sent: Arc<Mutex<Vec<TransportFrame>>>,
        inbound: Arc<Mutex<VecDeque<TransportFrame>>>,
        closed: Arc<Mutex<bool>>,
        notify: Arc<Notify>,
    }

    impl FakeConnection {
        pub fn push_inbound(&self, frame: TransportFrame) {
            self.inbound.lock().unwrap().push_back(frame);
            self.notify.notify_waiters();
        }

        pub fn close_peer(&self) {
            *self.closed.lock().unwrap() = true;
            self.notify.notify_waiters();
        }
    }

    impl TransportConnection for FakeConnection {
        fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), PhoenixError>> {
            self.sent.lock().unwrap().push(TransportFrame::Text(text));
            Box::pin(async { Ok(()) })
        }

        fn send_binary(&mut self, data: Vec<u8>) -> BoxFuture<'_, Result<(), PhoenixError>> {
            self.sent.lock().unwrap().push(TransportFrame::Binary(data));
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self, _code: u16, _reason: String) -> BoxFuture<'_, Result<(), PhoenixError>> {
            *self.closed.lock().unwrap() = true;
            Box::pin(async { Ok(()) })
        }

        fn recv(&mut self) -> BoxFuture<'_, Result<Option<TransportFrame>, PhoenixError>> {
            let inbound = Arc::clone(&self.inbound);
            let closed = Arc::clone(&self.closed);
            let notify = Arc::clone(&self.notify);
            Box::pin(async move {
                loop {
                    if let Some(frame) = inbound.lock().unwrap().pop_front() {
                        return Ok(Some(frame));
                    }
                    if *closed.lock().unwrap() {
                        return Ok(None);
                    }
                    notify.notified().await;
                }
            })
        }
    }
}
