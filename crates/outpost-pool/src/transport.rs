//! Socket transport seam.
//!
//! The pool never touches websockets directly. A [`Transport`] turns a relay
//! URL into a [`RelaySocket`]: a sink of outgoing frames and a stream of
//! incoming ones. [`WebSocketTransport`] is the production implementation on
//! tokio-tungstenite; tests plug in an in-memory one.

use std::pin::Pin;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use outpost_core::CanonicalRelayUrl;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// A websocket frame as far as the pool is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Ping,
    Pong,
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;

/// An established duplex channel to one relay.
pub struct RelaySocket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens sockets to relays.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: &CanonicalRelayUrl)
    -> BoxFuture<'static, Result<RelaySocket, TransportError>>;
}

/// Websocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        url: &CanonicalRelayUrl,
    ) -> BoxFuture<'static, Result<RelaySocket, TransportError>> {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;

        async move {
            let (ws, _response) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout(connect_timeout))?
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;

            let (sink, stream) = ws.split();

            let sink = sink
                .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
                .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(to_message(frame))));

            let stream = stream.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text.as_str().to_owned()))),
                    Ok(Message::Pong(_)) => Some(Ok(WireFrame::Pong)),
                    Ok(Message::Close(_)) => Some(Ok(WireFrame::Close)),
                    // tungstenite answers pings on its own
                    Ok(Message::Ping(_) | Message::Binary(_) | Message::Frame(_)) => None,
                    Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
                })
            });

            Ok(RelaySocket {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::text(text),
        WireFrame::Ping => Message::Ping(Default::default()),
        WireFrame::Pong => Message::Pong(Default::default()),
        WireFrame::Close => Message::Close(None),
    }
}
