//! Connection Pump
//!
//! Drives one client connection through Connecting → Active → Closing →
//! Closed. The pump task reads client frames and invokes the service; a
//! spawned writer task owns the socket sink and drains replies and queued
//! deliveries.
//!
//! Replies travel on their own bounded channel so an error notification is
//! never evicted by the drop-oldest delivery queue.

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::messages::{ClientMessage, ServerMessage};
use crate::channel::Channel;
use crate::connection::{CloseReason, ConnectionContext};
use crate::envelope::{Envelope, DEFAULT_CONTENT_TYPE};
use crate::error::{AdapterError, AdapterResult};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL};
use crate::registry::SubscriptionRegistry;
use crate::service::Service;

const REPLY_CAPACITY: usize = 32;

/// Close reasons are limited to 123 bytes by the WebSocket protocol
const MAX_CLOSE_REASON: usize = 123;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Transport contract of a connection
#[derive(Debug, Clone)]
pub enum PumpMode {
    /// Bound to the channel of the handshake URL; every frame is a payload
    Channel {
        channel: Channel,
        token: String,
        content_type: String,
    },
    /// JSON control frames; `default_token` applies when a frame carries none
    Command { default_token: Option<String> },
}

impl PumpMode {
    fn label(&self) -> &'static str {
        match self {
            PumpMode::Channel { .. } => "channel",
            PumpMode::Command { .. } => "command",
        }
    }
}

/// Publish retry and close policy
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub publish_retries: u32,
    pub retry_backoff: Duration,
    /// Upper bound for the writer to stop and for the close frame to go out
    pub close_timeout: Duration,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            publish_retries: 2,
            retry_backoff: Duration::from_millis(100),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// One client connection
pub struct ConnectionPump {
    ctx: Arc<ConnectionContext>,
    service: Arc<dyn Service>,
    registry: Arc<SubscriptionRegistry>,
    mode: PumpMode,
    settings: PumpSettings,
    state: watch::Sender<PumpState>,
}

impl ConnectionPump {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        service: Arc<dyn Service>,
        registry: Arc<SubscriptionRegistry>,
        mode: PumpMode,
        settings: PumpSettings,
    ) -> Self {
        let (state, _) = watch::channel(PumpState::Connecting);
        Self {
            ctx,
            service,
            registry,
            mode,
            settings,
            state,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<PumpState> {
        self.state.subscribe()
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    /// Run the connection to completion
    pub async fn run<S, R, E>(self, mut sink: S, mut stream: R)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display + Send,
    {
        let connection_id = self.ctx.id();

        if let Err(e) = self.connect().await {
            tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket connection rejected");
            self.registry.remove_all(connection_id).await;
            self.say_goodbye(&mut sink, Some(rejection_reason(&e))).await;
            self.state.send_replace(PumpState::Closed);
            return;
        }

        metrics::counter!(CONNECTIONS_TOTAL, "mode" => self.mode.label()).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        tracing::info!(connection_id = %connection_id, mode = self.mode.label(), "WebSocket connected");

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
        if let PumpMode::Command { .. } = self.mode {
            let connected = ServerMessage::Connected {
                connection_id: connection_id.to_string(),
            };
            let _ = reply_tx.send(connected).await;
        }

        let raw_deliveries = matches!(self.mode, PumpMode::Channel { .. });
        let mut writer = tokio::spawn(write_loop(
            sink,
            Arc::clone(&self.ctx),
            reply_rx,
            raw_deliveries,
        ));
        self.state.send_replace(PumpState::Active);

        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        let keep_open = tokio::select! {
                            _ = self.ctx.cancelled() => false,
                            keep_open = self.handle_frame(message, &reply_tx) => keep_open,
                        };
                        if !keep_open {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.state.send_replace(PumpState::Closing);
        self.ctx.cancel();
        let cancelled = self.registry.remove_all(connection_id).await;
        let abandoned = self.ctx.outbound().close();
        drop(reply_tx);

        match tokio::time::timeout(self.settings.close_timeout, &mut writer).await {
            Ok(Ok(mut sink)) => self.say_goodbye(&mut sink, self.ctx.close_reason()).await,
            Ok(Err(e)) => {
                tracing::error!(connection_id = %connection_id, error = %e, "WebSocket writer task failed");
            }
            Err(_) => {
                tracing::warn!(connection_id = %connection_id, "WebSocket writer stalled, aborting");
                writer.abort();
            }
        }

        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        tracing::info!(
            connection_id = %connection_id,
            subscriptions = cancelled,
            abandoned,
            "WebSocket disconnected"
        );
        self.state.send_replace(PumpState::Closed);
    }

    /// Send the close frame, if any, and close the sink within the close timeout
    async fn say_goodbye<S>(&self, sink: &mut S, reason: Option<CloseReason>)
    where
        S: Sink<Message> + Unpin,
    {
        let goodbye = async {
            if let Some(reason) = reason {
                let _ = sink.send(close_message(&reason)).await;
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(self.settings.close_timeout, goodbye)
            .await
            .is_err()
        {
            tracing::debug!(connection_id = %self.ctx.id(), "WebSocket close handshake timed out");
        }
    }

    /// Registration plus the implicit subscribe of channel mode
    async fn connect(&self) -> AdapterResult<()> {
        self.registry.register(self.ctx.id()).await?;

        if let PumpMode::Channel { channel, token, .. } = &self.mode {
            self.service.subscribe(&self.ctx, channel, token).await?;
        }
        Ok(())
    }

    /// Handle one client frame; returns false when the connection should close
    async fn handle_frame(&self, message: Message, replies: &mpsc::Sender<ServerMessage>) -> bool {
        let reply = match (&self.mode, message) {
            (_, Message::Close(_)) => {
                tracing::debug!(connection_id = %self.ctx.id(), "Client requested close");
                return false;
            }
            (_, Message::Ping(_)) | (_, Message::Pong(_)) => return true,

            (PumpMode::Channel { channel, token, content_type }, Message::Text(text)) => self
                .publish_with_retry(channel, token, content_type, text.into_bytes())
                .await
                .err()
                .map(|e| ServerMessage::error(&e, Some(channel.to_string().as_str()))),
            (PumpMode::Channel { channel, token, content_type }, Message::Binary(bytes)) => self
                .publish_with_retry(channel, token, content_type, bytes)
                .await
                .err()
                .map(|e| ServerMessage::error(&e, Some(channel.to_string().as_str()))),

            (PumpMode::Command { default_token }, Message::Text(text)) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(command) => Some(self.handle_command(command, default_token.as_deref()).await),
                    Err(e) => {
                        tracing::debug!(connection_id = %self.ctx.id(), error = %e, "Invalid client message");
                        let err = AdapterError::MalformedMessage(format!("Invalid message format: {}", e));
                        Some(ServerMessage::error(&err, None))
                    }
                }
            }
            (PumpMode::Command { .. }, Message::Binary(_)) => {
                let err = AdapterError::MalformedMessage("Binary messages not supported".to_string());
                Some(ServerMessage::error(&err, None))
            }
        };

        match reply {
            Some(reply) => replies.send(reply).await.is_ok(),
            None => true,
        }
    }

    async fn handle_command(&self, command: ClientMessage, default_token: Option<&str>) -> ServerMessage {
        match command {
            ClientMessage::Subscribe { channel, token } => {
                let token = token.as_deref().or(default_token).unwrap_or_default();
                let result = match Channel::parse(&channel) {
                    Ok(parsed) => self.service.subscribe(&self.ctx, &parsed, token).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(sub) => ServerMessage::Subscribed {
                        channel: sub.channel.to_string(),
                        subscription_id: sub.id.to_string(),
                    },
                    Err(e) => ServerMessage::error(&e, Some(channel.as_str())),
                }
            }
            ClientMessage::Unsubscribe { channel } => {
                let result = match Channel::parse(&channel) {
                    Ok(parsed) => self.service.unsubscribe(&self.ctx, &parsed).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(removed) => ServerMessage::Unsubscribed { channel, removed },
                    Err(e) => ServerMessage::error(&e, Some(channel.as_str())),
                }
            }
            ClientMessage::Publish {
                channel,
                payload,
                encoding,
                content_type,
                token,
            } => {
                let token = token.as_deref().or(default_token).unwrap_or_default();
                let content_type = content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
                let result: AdapterResult<()> = async {
                    let parsed = Channel::parse(&channel)?;
                    let bytes = encoding.decode(&payload)?;
                    self.publish_with_retry(&parsed, token, content_type, bytes).await
                }
                .await;
                match result {
                    Ok(()) => ServerMessage::Published { channel },
                    Err(e) => ServerMessage::error(&e, Some(channel.as_str())),
                }
            }
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    /// Publish, retrying while the broker is unavailable
    async fn publish_with_retry(
        &self,
        channel: &Channel,
        token: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> AdapterResult<()> {
        let mut attempt = 0;
        loop {
            match self
                .service
                .publish(&self.ctx, channel, token, content_type, payload.clone())
                .await
            {
                Err(e) if e.is_retryable() && attempt < self.settings.publish_retries => {
                    attempt += 1;
                    tracing::debug!(
                        connection_id = %self.ctx.id(),
                        channel = %channel,
                        attempt,
                        "Retrying publish"
                    );
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                result => return result,
            }
        }
    }
}

/// Writer task: owns the sink until replies close or the queue is closed
async fn write_loop<S>(
    mut sink: S,
    ctx: Arc<ConnectionContext>,
    mut replies: mpsc::Receiver<ServerMessage>,
    raw_deliveries: bool,
) -> S
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => Message::Text(reply.to_json()),
                None => break,
            },
            delivery = ctx.outbound().pop() => match delivery {
                Some(envelope) => delivery_frame(&envelope, raw_deliveries),
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;
            sent = sink.send(message) => sent,
            _ = ctx.cancelled() => break,
        };
        if let Err(e) = sent {
            tracing::debug!(connection_id = %ctx.id(), error = %e, "WebSocket send failed, closing connection");
            ctx.cancel();
            break;
        }
    }
    sink
}

/// Frame carrying a delivery to the client
fn delivery_frame(envelope: &Envelope, raw: bool) -> Message {
    if !raw {
        return Message::Text(ServerMessage::from_envelope(envelope).to_json());
    }
    match String::from_utf8(envelope.payload.clone()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

fn rejection_reason(err: &AdapterError) -> CloseReason {
    let code = match err {
        AdapterError::Unauthorized(_) => CloseReason::POLICY,
        AdapterError::BrokerUnavailable(_) | AdapterError::TooManyConnections(_) => {
            CloseReason::TRY_AGAIN_LATER
        }
        _ => CloseReason::INTERNAL,
    };
    CloseReason::new(code, err.to_string())
}

fn close_message(reason: &CloseReason) -> Message {
    let mut text = reason.reason.clone();
    if text.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    Message::Close(Some(CloseFrame {
        code: reason.code,
        reason: text.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthority;
    use crate::broker::{InMemoryBroker, PubSub};
    use crate::envelope::EnvelopeCodec;
    use futures::channel::mpsc as fmpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio_util::sync::CancellationToken;

    type Inbound = fmpsc::UnboundedSender<Result<Message, axum::Error>>;
    type Outbound = fmpsc::UnboundedReceiver<Message>;

    struct Harness {
        broker: InMemoryBroker,
        authority: Arc<StaticAuthority>,
        registry: Arc<SubscriptionRegistry>,
        service: Arc<dyn Service>,
        root: CancellationToken,
    }

    fn harness() -> Harness {
        let broker = InMemoryBroker::default();
        let authority = Arc::new(StaticAuthority::new());
        authority.grant("token-a", "thing-a", ["alerts"]);
        authority.grant("token-b", "thing-b", ["alerts"]);
        let registry = Arc::new(SubscriptionRegistry::new(10));
        let service = crate::service::build(
            authority.clone(),
            Arc::new(broker.clone()),
            Arc::clone(&registry),
            EnvelopeCodec::default(),
        );
        Harness {
            broker,
            authority,
            registry,
            service,
            root: CancellationToken::new(),
        }
    }

    impl Harness {
        fn start(
            &self,
            mode: PumpMode,
        ) -> (
            Arc<ConnectionContext>,
            watch::Receiver<PumpState>,
            Inbound,
            Outbound,
            tokio::task::JoinHandle<()>,
        ) {
            let ctx = ConnectionContext::new(&self.root, 8);
            let pump = ConnectionPump::new(
                Arc::clone(&ctx),
                Arc::clone(&self.service),
                Arc::clone(&self.registry),
                mode,
                test_settings(),
            );
            let state = pump.state();
            let (in_tx, in_rx) = fmpsc::unbounded();
            let (out_tx, out_rx) = fmpsc::unbounded();
            let task = tokio::spawn(pump.run(out_tx, in_rx));
            (ctx, state, in_tx, out_rx, task)
        }
    }

    fn test_settings() -> PumpSettings {
        PumpSettings {
            publish_retries: 2,
            retry_backoff: Duration::from_millis(5),
            close_timeout: Duration::from_millis(200),
        }
    }

    fn channel_mode(token: &str) -> PumpMode {
        PumpMode::Channel {
            channel: Channel::parse("alerts").unwrap(),
            token: token.to_string(),
            content_type: "text/plain".to_string(),
        }
    }

    async fn next_frame(rx: &mut Outbound) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.next())
            .await
            .expect("frame in time")
            .expect("stream open")
    }

    async fn next_json(rx: &mut Outbound) -> ServerMessage {
        match next_frame(rx).await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    async fn wait_for(state: &mut watch::Receiver<PumpState>, target: PumpState) {
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == target))
            .await
            .expect("state reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_channel_mode_relays_raw_frames() {
        let h = harness();
        let (_ctx_a, mut state_a, _in_a, mut out_a, _) = h.start(channel_mode("token-a"));
        let (_ctx_b, mut state_b, in_b, _out_b, _) = h.start(channel_mode("token-b"));
        wait_for(&mut state_a, PumpState::Active).await;
        wait_for(&mut state_b, PumpState::Active).await;

        in_b.unbounded_send(Ok(Message::Text("fire".to_string()))).unwrap();
        assert_eq!(next_frame(&mut out_a).await, Message::Text("fire".to_string()));

        in_b.unbounded_send(Ok(Message::Binary(vec![0xff, 0x01]))).unwrap();
        assert_eq!(next_frame(&mut out_a).await, Message::Binary(vec![0xff, 0x01]));
    }

    #[tokio::test]
    async fn test_channel_mode_errors_keep_connection_open() {
        let h = harness();
        let (_ctx, mut state, input, mut output, _) = h.start(channel_mode("token-a"));
        wait_for(&mut state, PumpState::Active).await;

        input.unbounded_send(Ok(Message::Text(String::new()))).unwrap();
        match next_json(&mut output).await {
            ServerMessage::Error { code, channel, .. } => {
                assert_eq!(code, "malformed_message");
                assert_eq!(channel.as_deref(), Some("alerts"));
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(*state.borrow(), PumpState::Active);
    }

    #[tokio::test]
    async fn test_rejected_connection_closes_with_reason() {
        let h = harness();
        let (ctx, mut state, _input, mut output, task) = h.start(channel_mode("expired"));
        wait_for(&mut state, PumpState::Closed).await;
        task.await.unwrap();

        match next_frame(&mut output).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseReason::POLICY),
            other => panic!("Expected close frame, got {:?}", other),
        }
        assert_eq!(h.registry.connection_count().await, 0);
        assert!(!h.registry.contains(ctx.id(), &Channel::parse("alerts").unwrap()).await);
    }

    #[tokio::test]
    async fn test_command_mode_round_trip() {
        let h = harness();
        let (ctx, _state, input, mut output, _) = h.start(PumpMode::Command {
            default_token: Some("token-a".to_string()),
        });

        match next_json(&mut output).await {
            ServerMessage::Connected { connection_id } => {
                assert_eq!(connection_id, ctx.id().to_string())
            }
            other => panic!("Expected connected, got {:?}", other),
        }

        let send = |msg: ClientMessage| {
            input
                .unbounded_send(Ok(Message::Text(serde_json::to_string(&msg).unwrap())))
                .unwrap()
        };

        send(ClientMessage::Subscribe {
            channel: "alerts".to_string(),
            token: None,
        });
        assert!(matches!(next_json(&mut output).await, ServerMessage::Subscribed { .. }));

        send(ClientMessage::Ping);
        assert_eq!(next_json(&mut output).await, ServerMessage::Pong);

        // Published by another identity, delivered as a message frame
        let env = Envelope::new(Channel::parse("alerts").unwrap(), "thing-b", "text/plain", b"hi".to_vec());
        h.broker.publish(&env).await.unwrap();
        match next_json(&mut output).await {
            ServerMessage::Message { payload, publisher, .. } => {
                assert_eq!(payload, "hi");
                assert_eq!(publisher, "thing-b");
            }
            other => panic!("Expected message, got {:?}", other),
        }

        send(ClientMessage::Publish {
            channel: "alerts".to_string(),
            payload: "aGk=".to_string(),
            encoding: crate::websocket::PayloadEncoding::Base64,
            content_type: Some("text/plain".to_string()),
            token: Some("token-b".to_string()),
        });
        assert_eq!(
            next_json(&mut output).await,
            ServerMessage::Published {
                channel: "alerts".to_string()
            }
        );

        send(ClientMessage::Unsubscribe {
            channel: "alerts".to_string(),
        });
        assert_eq!(
            next_json(&mut output).await,
            ServerMessage::Unsubscribed {
                channel: "alerts".to_string(),
                removed: true
            }
        );
    }

    #[tokio::test]
    async fn test_command_mode_invalid_frames() {
        let h = harness();
        let (_ctx, _state, input, mut output, _) = h.start(PumpMode::Command { default_token: None });
        next_json(&mut output).await;

        input.unbounded_send(Ok(Message::Text("{not json".to_string()))).unwrap();
        assert!(matches!(
            next_json(&mut output).await,
            ServerMessage::Error { ref code, .. } if code == "malformed_message"
        ));

        input.unbounded_send(Ok(Message::Binary(vec![1, 2]))).unwrap();
        assert!(matches!(next_json(&mut output).await, ServerMessage::Error { .. }));

        let msg = r#"{"type":"subscribe","channel":"alerts"}"#;
        input.unbounded_send(Ok(Message::Text(msg.to_string()))).unwrap();
        assert!(matches!(
            next_json(&mut output).await,
            ServerMessage::Error { ref code, .. } if code == "unauthorized"
        ));

        let msg = r#"{"type":"subscribe","channel":"bad channel","token":"token-a"}"#;
        input.unbounded_send(Ok(Message::Text(msg.to_string()))).unwrap();
        assert!(matches!(
            next_json(&mut output).await,
            ServerMessage::Error { ref code, .. } if code == "invalid_channel"
        ));
    }

    #[tokio::test]
    async fn test_client_close_cleans_up() {
        let h = harness();
        let (ctx, mut state, input, _output, task) = h.start(channel_mode("token-a"));
        wait_for(&mut state, PumpState::Active).await;
        assert_eq!(h.broker.subscription_count(), 1);

        input.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();

        assert_eq!(*state.borrow(), PumpState::Closed);
        assert_eq!(h.registry.connection_count().await, 0);
        assert_eq!(h.broker.subscription_count(), 0);
        assert!(ctx.outbound().is_closed());
    }

    #[tokio::test]
    async fn test_broker_loss_closes_with_internal_error() {
        let h = harness();
        let (_ctx, mut state, _input, mut output, task) = h.start(channel_mode("token-a"));
        wait_for(&mut state, PumpState::Active).await;

        h.broker.disconnect();
        task.await.unwrap();

        match next_frame(&mut output).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseReason::INTERNAL),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_retries_then_reports() {
        let h = harness();
        let (_ctx, mut state, input, mut output, _) = h.start(PumpMode::Command {
            default_token: Some("token-a".to_string()),
        });
        next_json(&mut output).await;
        wait_for(&mut state, PumpState::Active).await;

        h.broker.disconnect();
        let msg = r#"{"type":"publish","channel":"alerts","payload":"x","content_type":"text/plain"}"#;
        input.unbounded_send(Ok(Message::Text(msg.to_string()))).unwrap();
        assert!(matches!(
            next_json(&mut output).await,
            ServerMessage::Error { ref code, .. } if code == "broker_unavailable"
        ));
        assert_eq!(h.broker.published_count(), 0);

        // Revocation is noticed on the next operation
        h.broker.reconnect();
        h.authority.revoke("token-a");
        input.unbounded_send(Ok(Message::Text(msg.to_string()))).unwrap();
        assert!(matches!(
            next_json(&mut output).await,
            ServerMessage::Error { ref code, .. } if code == "unauthorized"
        ));
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_going_away() {
        let h = harness();
        let (ctx, mut state, _input, mut output, task) = h.start(channel_mode("token-a"));
        wait_for(&mut state, PumpState::Active).await;

        ctx.terminate(CloseReason::shutdown());
        task.await.unwrap();
        match next_frame(&mut output).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseReason::GOING_AWAY),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }

    /// Accepts one frame, then never becomes ready again
    struct StalledSink {
        accepted: usize,
    }

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            if self.accepted == 0 {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }

        fn start_send(mut self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            self.accepted += 1;
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_stalled_client_still_reaches_closed() {
        let h = harness();
        let ctx = ConnectionContext::new(&h.root, 8);
        let pump = ConnectionPump::new(
            Arc::clone(&ctx),
            Arc::clone(&h.service),
            Arc::clone(&h.registry),
            PumpMode::Command {
                default_token: Some("token-a".to_string()),
            },
            test_settings(),
        );
        let mut state = pump.state();
        let (input, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let task = tokio::spawn(pump.run(StalledSink { accepted: 0 }, in_rx));
        wait_for(&mut state, PumpState::Active).await;

        // The connected frame took the only slot, so this pong never goes out
        input
            .unbounded_send(Ok(Message::Text(r#"{"type":"ping"}"#.to_string())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        ctx.terminate(CloseReason::shutdown());
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump finished")
            .unwrap();
        assert_eq!(*state.borrow(), PumpState::Closed);
        assert_eq!(h.registry.connection_count().await, 0);
    }

    /// Service whose every call waits forever
    struct HangingService;

    #[async_trait::async_trait]
    impl Service for HangingService {
        async fn publish(
            &self,
            _ctx: &Arc<ConnectionContext>,
            _channel: &Channel,
            _token: &str,
            _content_type: &str,
            _payload: Vec<u8>,
        ) -> AdapterResult<()> {
            std::future::pending().await
        }

        async fn subscribe(
            &self,
            _ctx: &Arc<ConnectionContext>,
            _channel: &Channel,
            _token: &str,
        ) -> AdapterResult<crate::registry::Subscription> {
            std::future::pending().await
        }

        async fn unsubscribe(
            &self,
            _ctx: &Arc<ConnectionContext>,
            _channel: &Channel,
        ) -> AdapterResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_operation() {
        let h = harness();
        let ctx = ConnectionContext::new(&h.root, 8);
        let pump = ConnectionPump::new(
            Arc::clone(&ctx),
            Arc::new(HangingService),
            Arc::clone(&h.registry),
            PumpMode::Command {
                default_token: Some("token-a".to_string()),
            },
            test_settings(),
        );
        let mut state = pump.state();
        let (input, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let (out_tx, mut output) = fmpsc::unbounded();
        let task = tokio::spawn(pump.run(out_tx, in_rx));

        assert!(matches!(next_json(&mut output).await, ServerMessage::Connected { .. }));
        let publish = r#"{"type":"publish","channel":"alerts","payload":"fire"}"#;
        input.unbounded_send(Ok(Message::Text(publish.to_string()))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*state.borrow(), PumpState::Active);

        ctx.terminate(CloseReason::shutdown());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pump finished")
            .unwrap();
        wait_for(&mut state, PumpState::Closed).await;
        match next_frame(&mut output).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseReason::GOING_AWAY),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
