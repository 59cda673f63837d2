use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use futures::{SinkExt, Stream, StreamExt};
use parley_protocol::{ClientMessage, Inbound};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{
    Channel, ConnectionGeneration, ConnectionState, ReconnectAttempt, ReconnectPolicy,
    TransportEvent,
};
use crate::error::{InvalidEndpointSnafu, SessionResult};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub server_url: String,
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim().to_string(),
            token: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Server URL with the auth token attached as the `token` query parameter.
    pub fn endpoint(&self) -> SessionResult<Url> {
        let mut url = Url::parse(&self.server_url).context(InvalidEndpointSnafu {
            stage: "parse-server-url",
            url: self.server_url.clone(),
        })?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkStatus {
    state: ConnectionState,
    generation: ConnectionGeneration,
}

struct Outbound {
    generation: ConnectionGeneration,
    tag: &'static str,
    frame: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Reconnect,
    Close,
}

enum LinkOutcome {
    Dropped(String),
    Closed,
}

/// Send-side handle of the WebSocket transport.
///
/// Cheap to clone; all clones feed the same worker.
#[derive(Clone)]
pub struct WsTransport {
    status: Arc<ArcSwap<LinkStatus>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    control_tx: mpsc::UnboundedSender<Control>,
}

/// Ordered transport notifications; ends once the worker has stopped.
pub struct TransportEvents {
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Stream for TransportEvents {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

pub struct TransportHandle {
    pub transport: WsTransport,
    pub events: TransportEvents,
    pub worker: TransportWorker,
}

impl WsTransport {
    /// Builds the transport; the link comes up once `worker` is spawned.
    pub fn open(config: TransportConfig) -> SessionResult<TransportHandle> {
        let endpoint = config.endpoint()?;
        let status = Arc::new(ArcSwap::from_pointee(LinkStatus {
            state: ConnectionState::Disconnected,
            generation: ConnectionGeneration::default(),
        }));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = LinkWorker {
            endpoint,
            policy: config.reconnect,
            status: status.clone(),
            events_tx,
            outbound_rx,
            control_rx,
            generation: ConnectionGeneration::default(),
        };

        Ok(TransportHandle {
            transport: Self {
                status,
                outbound_tx,
                control_tx,
            },
            events: TransportEvents { events: events_rx },
            worker: Box::pin(worker.run()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.status.load().state
    }

    pub fn generation(&self) -> ConnectionGeneration {
        self.status.load().generation
    }
}

impl Channel for WsTransport {
    fn send(&self, generation: ConnectionGeneration, message: &ClientMessage) -> bool {
        let status = **self.status.load();
        if !status.state.is_connected() {
            tracing::debug!(
                tag = message.tag(),
                state = %status.state,
                "rejecting send while channel is not connected"
            );
            return false;
        }
        if status.generation != generation {
            tracing::debug!(
                tag = message.tag(),
                issued_on = %generation,
                current = %status.generation,
                "rejecting send addressed to another connection"
            );
            return false;
        }

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(error) => {
                tracing::error!(tag = message.tag(), error = %error, "failed to encode outbound message");
                return false;
            }
        };

        self.outbound_tx
            .send(Outbound {
                generation,
                tag: message.tag(),
                frame,
            })
            .is_ok()
    }

    fn reconnect(&self) {
        let _ = self.control_tx.send(Control::Reconnect);
    }

    fn close(&self) {
        let _ = self.control_tx.send(Control::Close);
    }
}

struct LinkWorker {
    endpoint: Url,
    policy: ReconnectPolicy,
    status: Arc<ArcSwap<LinkStatus>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    generation: ConnectionGeneration,
}

impl LinkWorker {
    async fn run(mut self) {
        let mut attempt = 0u32;
        if !self.publish(ConnectionState::Connecting) {
            return;
        }

        loop {
            let connected = tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Reconnect) => continue,
                    Some(Control::Close) | None => break,
                },
                connected = connect_async(self.endpoint.as_str()) => connected,
            };

            match connected {
                Ok((stream, _response)) => {
                    attempt = 0;
                    self.generation = self.generation.next();
                    tracing::info!(generation = %self.generation, "channel connected");
                    if !self.publish(ConnectionState::Connected) {
                        return;
                    }

                    match self.pump(stream).await {
                        LinkOutcome::Closed => break,
                        LinkOutcome::Dropped(reason) => {
                            tracing::warn!(generation = %self.generation, reason = %reason, "channel dropped");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(attempt, error = %error, "channel connect attempt failed");
                }
            }

            attempt += 1;
            if !self.policy.allows(attempt) {
                tracing::error!(attempts = attempt - 1, "reconnect budget exhausted");
                if !self.publish(ConnectionState::Disconnected)
                    || self
                        .events_tx
                        .send(TransportEvent::GaveUp {
                            attempts: attempt - 1,
                        })
                        .is_err()
                {
                    return;
                }

                match self.control_rx.recv().await {
                    Some(Control::Reconnect) => {
                        attempt = 0;
                        if !self.publish(ConnectionState::Connecting) {
                            return;
                        }
                        continue;
                    }
                    Some(Control::Close) | None => break,
                }
            }

            let delay = self.policy.delay_for(attempt);
            let scheduled = ReconnectAttempt {
                attempt,
                max_attempts: self.policy.max_attempts,
                delay,
            };
            if !self.publish(ConnectionState::Reconnecting)
                || self
                    .events_tx
                    .send(TransportEvent::ReconnectScheduled(scheduled))
                    .is_err()
            {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                control = self.control_rx.recv() => match control {
                    Some(Control::Reconnect) => {}
                    Some(Control::Close) | None => break,
                },
            }

            if !self.publish(ConnectionState::Connecting) {
                return;
            }
        }

        tracing::info!("channel closed");
        self.publish(ConnectionState::Closed);
    }

    async fn pump(&mut self, stream: WsStream) -> LinkOutcome {
        let (mut sink, mut frames) = stream.split();

        loop {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Reconnect) => {}
                    Some(Control::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return LinkOutcome::Closed;
                    }
                },
                outbound = self.outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        return LinkOutcome::Closed;
                    };
                    if outbound.generation != self.generation {
                        tracing::debug!(
                            tag = outbound.tag,
                            issued_on = %outbound.generation,
                            current = %self.generation,
                            "dropping frame issued on a previous connection"
                        );
                        continue;
                    }
                    if let Err(error) = sink.send(WsMessage::Text(outbound.frame.into())).await {
                        return LinkOutcome::Dropped(error.to_string());
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match Inbound::decode(text.as_str()) {
                        Ok(inbound) => {
                            if self.events_tx.send(TransportEvent::Frame(inbound)).is_err() {
                                return LinkOutcome::Closed;
                            }
                        }
                        Err(error) => {
                            tracing::warn!(error = %error, "dropping undecodable frame");
                        }
                    },
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if let Err(error) = sink.send(WsMessage::Pong(payload)).await {
                            return LinkOutcome::Dropped(error.to_string());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return LinkOutcome::Dropped("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => return LinkOutcome::Dropped(error.to_string()),
                },
            }
        }
    }

    /// Publishes a state change; returns false once the owner stopped listening.
    fn publish(&self, state: ConnectionState) -> bool {
        self.status.store(Arc::new(LinkStatus {
            state,
            generation: self.generation,
        }));
        self.events_tx
            .send(TransportEvent::StateChanged {
                state,
                generation: self.generation,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    async fn next_event(events: &mut TransportEvents) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("transport event in time")
            .expect("worker still running")
    }

    fn state(state: ConnectionState, generation: u64) -> TransportEvent {
        TransportEvent::StateChanged {
            state,
            generation: ConnectionGeneration::new(generation),
        }
    }

    fn scheduled(attempt: u32, delay_ms: u64) -> TransportEvent {
        TransportEvent::ReconnectScheduled(ReconnectAttempt {
            attempt,
            max_attempts: 2,
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[test]
    fn endpoint_carries_the_token_query() {
        let config = TransportConfig::new(" ws://localhost:8003/ws/chat ").with_token("abc def");
        let endpoint = config.endpoint().unwrap();

        assert_eq!(endpoint.as_str(), "ws://localhost:8003/ws/chat?token=abc+def");
    }

    #[test]
    fn blank_tokens_are_not_sent() {
        let config = TransportConfig::new("ws://localhost/ws/chat").with_token("  ");
        assert_eq!(config.token, None);
        assert!(config.endpoint().unwrap().query().is_none());
    }

    #[test]
    fn send_is_rejected_until_connected() {
        let handle = WsTransport::open(TransportConfig::new("ws://127.0.0.1:9/ws")).unwrap();

        assert_eq!(handle.transport.state(), ConnectionState::Disconnected);
        assert!(
            !handle
                .transport
                .send(ConnectionGeneration::default(), &ClientMessage::Pause)
        );
    }

    #[tokio::test]
    async fn dropped_link_backs_off_gives_up_and_restarts_on_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        // One connection is accepted; the port refuses everything afterwards.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(listener);
            let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = release_rx.await;
            drop(socket);
        });

        let policy = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };
        let TransportHandle {
            transport,
            mut events,
            worker,
        } = WsTransport::open(
            TransportConfig::new(format!("ws://{address}/ws/chat")).with_reconnect(policy),
        )
        .unwrap();
        let worker = tokio::spawn(worker);

        assert_eq!(next_event(&mut events).await, state(ConnectionState::Connecting, 0));
        assert_eq!(next_event(&mut events).await, state(ConnectionState::Connected, 1));
        assert!(!transport.send(ConnectionGeneration::new(0), &ClientMessage::Pause));
        assert!(transport.send(ConnectionGeneration::new(1), &ClientMessage::Pause));

        release_tx.send(()).unwrap();
        server.await.unwrap();

        let mut observed = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let gave_up = matches!(event, TransportEvent::GaveUp { .. });
            observed.push(event);
            if gave_up {
                break;
            }
        }
        assert_eq!(
            observed,
            vec![
                state(ConnectionState::Reconnecting, 1),
                scheduled(1, 10),
                state(ConnectionState::Connecting, 1),
                state(ConnectionState::Reconnecting, 1),
                scheduled(2, 20),
                state(ConnectionState::Connecting, 1),
                state(ConnectionState::Disconnected, 1),
                TransportEvent::GaveUp { attempts: 2 },
            ]
        );
        assert!(!transport.send(ConnectionGeneration::new(1), &ClientMessage::Pause));

        transport.reconnect();
        assert_eq!(next_event(&mut events).await, state(ConnectionState::Connecting, 1));
        assert_eq!(next_event(&mut events).await, state(ConnectionState::Reconnecting, 1));
        assert_eq!(next_event(&mut events).await, scheduled(1, 10));

        transport.close();
        while next_event(&mut events).await != state(ConnectionState::Closed, 1) {}
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn invalid_urls_are_reported() {
        assert!(WsTransport::open(TransportConfig::new("not a url")).is_err());
    }
}
