//! Peer connection — the WebSocket transport to a CSMS, with reader/writer
//! tasks, reconnect-with-backoff, and ping/pong keepalive.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Inbound events the reader task surfaces to the owning supervisor.
#[derive(Debug)]
pub enum PeerEvent {
    Connected,
    Frame(String),
    Disconnected(String),
}

pub struct Peer {
    pub endpoint_url: String,
    pub bearer_token: Option<String>,
    outbound_tx: mpsc::Sender<WsMessage>,
    outbound_rx: Option<mpsc::Receiver<WsMessage>>,
}

impl Peer {
    pub fn new(endpoint_url: String, bearer_token: Option<String>, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth);
        Self {
            endpoint_url,
            bearer_token,
            outbound_tx: tx,
            outbound_rx: Some(rx),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<WsMessage> {
        self.outbound_tx.clone()
    }

    /// Upgrade a TCP connection to WebSocket with the `ocpp1.6` subprotocol
    /// and, if configured, a bearer-token Authorization header.
    pub async fn connect(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .endpoint_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError(e.to_string()))?;

        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", "ocpp1.6".parse().unwrap());
        if let Some(token) = &self.bearer_token {
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {token}")
                    .parse()
                    .map_err(|_| TransportError("invalid bearer token".into()))?,
            );
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(stream)
    }

    /// Run the reader/writer loop for a single connected session, forwarding
    /// decoded frames through `events_tx` until the socket closes.
    pub async fn run(
        &mut self,
        mut stream: WsStream,
        events_tx: mpsc::Sender<PeerEvent>,
    ) -> Result<(), TransportError> {
        let mut outbound_rx = self
            .outbound_rx
            .take()
            .expect("Peer::run called more than once");

        let _ = events_tx.send(PeerEvent::Connected).await;

        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if let Err(e) = stream.send(msg).await {
                                let _ = events_tx.send(PeerEvent::Disconnected(e.to_string())).await;
                                self.outbound_rx = Some(outbound_rx);
                                return Err(TransportError(e.to_string()));
                            }
                        }
                        None => {
                            // Sender dropped (session shutting down); close cleanly.
                            let _ = stream.close(None).await;
                            return Ok(());
                        }
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = events_tx.send(PeerEvent::Frame(text)).await;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = stream.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            let _ = events_tx.send(PeerEvent::Disconnected("closed".into())).await;
                            self.outbound_rx = Some(outbound_rx);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = events_tx.send(PeerEvent::Disconnected(e.to_string())).await;
                            self.outbound_rx = Some(outbound_rx);
                            return Err(TransportError(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}

/// Exponential backoff sequence for reconnects, capped at `max`.
pub struct ReconnectBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
