//! Client side of the gateway signaling protocol.
//!
//! One [`GatewayClient`] owns one WebSocket. It authenticates with the
//! challenge handshake, numbers outbound frames with even sequence numbers and
//! fans every inbound frame out over a `broadcast` channel so peer requests and
//! RTC negotiations can each wait for the replies they care about.

mod signal;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::{
    ClientMessage, CloseCode, Envelope, PersonalIdentity, ServerMessage, SignatureContext,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::ClientConfig;

const INBOUND_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type Inbound = Arc<Envelope<ServerMessage>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    Connecting,
    Authenticating,
    Connected,
    Closed { code: Option<u16>, reason: String },
}

impl GatewayState {
    pub fn is_closed(&self) -> bool {
        matches!(self, GatewayState::Closed { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("failed to connect to gateway: {0}")]
    Connect(String),
    #[error("gateway closed the session (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("gateway socket closed")]
    SocketClosed,
    #[error("timed out waiting for the gateway")]
    Timeout,
    #[error("wait cancelled")]
    Cancelled,
    /// The waiter fell behind and may have missed the frame it wanted.
    #[error("missed {0} inbound frames while waiting")]
    Lagged(u64),
    #[error("unexpected gateway reply: {0}")]
    UnexpectedReply(&'static str),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

enum WsCommand {
    Frame(String),
    Close(u16, String),
}

struct Queued {
    message: ClientMessage,
    reply: oneshot::Sender<Result<u64, GatewayError>>,
}

#[derive(Default)]
struct Outbox {
    next_seq: u64,
    authenticated: bool,
    closed: bool,
    queued: VecDeque<Queued>,
}

struct Inner {
    identity: Arc<PersonalIdentity>,
    auth_timeout: Duration,
    state_tx: watch::Sender<GatewayState>,
    inbound: broadcast::Sender<Inbound>,
    writer: mpsc::UnboundedSender<WsCommand>,
    outbox: Mutex<Outbox>,
    cancel: CancellationToken,
}

/// Handle to an authenticated (or authenticating) gateway session. Cheap to
/// clone; all clones share the socket.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    /// Opens the socket and starts the challenge handshake in the background.
    /// Messages sent before the handshake finishes are queued.
    pub async fn connect(
        config: &ClientConfig,
        identity: Arc<PersonalIdentity>,
    ) -> Result<Self, GatewayError> {
        let url = Url::parse(&config.gateway_url)
            .map_err(|err| GatewayError::Connect(format!("{}: {err}", config.gateway_url)))?;
        let (state_tx, _) = watch::channel(GatewayState::Connecting);

        debug!(target = "gateway", url = %url, "connecting");
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| GatewayError::Connect(err.to_string()))?;
        let (sink, stream) = socket.split();

        let (writer, writer_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let inner = Arc::new(Inner {
            identity,
            auth_timeout: config.auth_timeout,
            state_tx,
            inbound,
            writer,
            outbox: Mutex::new(Outbox::default()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(write_loop(sink, writer_rx, inner.cancel.clone()));
        tokio::spawn(read_loop(stream, inner.clone()));

        let client = Self { inner };
        client.inner.set_state(GatewayState::Authenticating);
        tokio::spawn(client.clone().authenticate());
        Ok(client)
    }

    pub fn fingerprint(&self) -> parley_proto::Fingerprint {
        self.inner.identity.fingerprint()
    }

    pub fn identity(&self) -> &Arc<PersonalIdentity> {
        &self.inner.identity
    }

    pub fn state(&self) -> GatewayState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<GatewayState> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves once the handshake succeeded, or fails with the close that
    /// ended it.
    pub async fn wait_connected(&self) -> Result<(), GatewayError> {
        let mut rx = self.state_changes();
        let state = rx
            .wait_for(|state| matches!(state, GatewayState::Connected | GatewayState::Closed { .. }))
            .await
            .map_err(|_| GatewayError::SocketClosed)?
            .clone();
        match state {
            GatewayState::Closed { code, reason } => Err(GatewayError::Closed { code, reason }),
            _ => Ok(()),
        }
    }

    /// Every inbound frame from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.inner.inbound.subscribe()
    }

    /// Sends `message` and returns the sequence number it went out with.
    /// Before authentication completes the message waits in a FIFO queue.
    pub async fn send(&self, message: ClientMessage) -> Result<u64, GatewayError> {
        let pending = {
            let mut outbox = self.inner.outbox.lock();
            if outbox.closed {
                return Err(GatewayError::SocketClosed);
            }
            if outbox.authenticated {
                return self.inner.push_frame(&mut outbox, &message);
            }
            let (reply, pending) = oneshot::channel();
            trace!(target = "gateway", kind = message.kind(), "queueing until authenticated");
            outbox.queued.push_back(Queued { message, reply });
            pending
        };
        pending.await.map_err(|_| GatewayError::SocketClosed)?
    }

    /// Waits for the first inbound frame, arriving after this call, that
    /// matches `predicate`.
    pub async fn wait_for<F>(
        &self,
        predicate: F,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Inbound, GatewayError>
    where
        F: FnMut(&Envelope<ServerMessage>) -> bool,
    {
        self.wait_on(self.subscribe(), predicate, timeout, cancel).await
    }

    /// Sends `message` and waits for the reply `matcher` accepts. `matcher`
    /// receives the sequence number the request went out with.
    pub async fn request<F>(
        &self,
        message: ClientMessage,
        timeout: Duration,
        mut matcher: F,
    ) -> Result<Inbound, GatewayError>
    where
        F: FnMut(u64, &ServerMessage) -> bool,
    {
        let rx = self.subscribe();
        let seq = self.send(message).await?;
        self.wait_on(rx, |envelope| matcher(seq, &envelope.message), timeout, None)
            .await
    }

    /// Normal close. Pending waits fail with `SocketClosed`.
    pub fn close(&self) {
        self.inner
            .close_with(CloseCode::NORMAL, "client closed".to_string());
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    async fn wait_on<F>(
        &self,
        rx: broadcast::Receiver<Inbound>,
        predicate: F,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Inbound, GatewayError>
    where
        F: FnMut(&Envelope<ServerMessage>) -> bool,
    {
        let external = cancel.cloned().unwrap_or_default();
        next_matching(rx, predicate, timeout, &self.inner.cancel, &external).await
    }

    async fn authenticate(self) {
        match self.handshake().await {
            Ok(()) => {
                info!(
                    target = "gateway",
                    identity = %self.fingerprint().short(),
                    "authenticated with gateway"
                );
            }
            Err(GatewayError::SocketClosed) => {}
            Err(err) => {
                warn!(target = "gateway", error = %err, "gateway handshake failed");
                let code = match err {
                    GatewayError::Timeout => CloseCode::ChallengeTimeout,
                    GatewayError::Encode(_) => CloseCode::InvalidFormat,
                    _ => CloseCode::ChallengeFailed,
                };
                self.inner
                    .close_with(code.code(), code.reason().to_string());
            }
        }
    }

    async fn handshake(&self) -> Result<(), GatewayError> {
        let identity = self.inner.identity.clone();
        let timeout = self.inner.auth_timeout;

        let rx = self.subscribe();
        let identify_seq = self.inner.send_now(&ClientMessage::Identify {
            public_key: identity.public_key_bytes().to_vec(),
            identity: identity.fingerprint(),
        })?;
        let reply = self
            .wait_on(
                rx,
                |envelope| matches!(envelope.message, ServerMessage::Challenge { for_seq, .. } if for_seq == identify_seq),
                timeout,
                None,
            )
            .await?;
        let ServerMessage::Challenge { challenge, .. } = &reply.message else {
            return Err(GatewayError::UnexpectedReply("expected CHALLENGE"));
        };

        let response = identity.sign(SignatureContext::GatewayChallenge, challenge);
        let rx = self.subscribe();
        let response_seq = self.inner.send_now(&ClientMessage::ChallengeResponse {
            for_seq: identify_seq,
            response: response.to_vec(),
        })?;
        self.wait_on(
            rx,
            |envelope| matches!(envelope.message, ServerMessage::ChallengeSuccess { for_seq } if for_seq == response_seq),
            timeout,
            None,
        )
        .await?;

        self.inner.flush_queue();
        Ok(())
    }
}

/// First frame on `rx` accepted by `predicate`. Fails with `SocketClosed`
/// once `closed` fires and with `Cancelled` once `cancel` does.
async fn next_matching<F>(
    mut rx: broadcast::Receiver<Inbound>,
    mut predicate: F,
    timeout: Duration,
    closed: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<Inbound, GatewayError>
where
    F: FnMut(&Envelope<ServerMessage>) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(envelope) => {
                    if predicate(&envelope) {
                        return Ok(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "gateway", skipped, "waiter fell behind inbound frames");
                    return Err(GatewayError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(GatewayError::SocketClosed),
            },
            _ = closed.cancelled() => return Err(GatewayError::SocketClosed),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(GatewayError::Timeout),
        }
    }
}

impl Inner {
    fn set_state(&self, next: GatewayState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_closed() || *state == next {
                return false;
            }
            debug!(target = "gateway", from = ?state, to = ?next, "gateway state");
            *state = next;
            true
        });
    }

    /// Assigns the next sequence number and hands the frame to the writer.
    /// Called with the outbox locked so numbering matches wire order.
    fn push_frame(&self, outbox: &mut Outbox, message: &ClientMessage) -> Result<u64, GatewayError> {
        let seq = outbox.next_seq;
        let text = Envelope::new(seq, message)
            .to_text()
            .map_err(|err| GatewayError::Encode(err.to_string()))?;
        self.writer
            .send(WsCommand::Frame(text))
            .map_err(|_| GatewayError::SocketClosed)?;
        outbox.next_seq += 2;
        trace!(target = "gateway", seq, kind = message.kind(), "sent frame");
        Ok(seq)
    }

    /// Handshake frames bypass the queue.
    fn send_now(&self, message: &ClientMessage) -> Result<u64, GatewayError> {
        let mut outbox = self.outbox.lock();
        if outbox.closed {
            return Err(GatewayError::SocketClosed);
        }
        self.push_frame(&mut outbox, message)
    }

    fn flush_queue(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.closed {
                return;
            }
            outbox.authenticated = true;
            while let Some(queued) = outbox.queued.pop_front() {
                let result = self.push_frame(&mut outbox, &queued.message);
                let _ = queued.reply.send(result);
            }
        }
        self.set_state(GatewayState::Connected);
    }

    fn close_with(&self, code: u16, reason: String) {
        let _ = self.writer.send(WsCommand::Close(code, reason.clone()));
        self.finish(Some(code), reason);
    }

    /// Terminal transition: rejects queued senders and wakes every waiter.
    fn finish(&self, code: Option<u16>, reason: String) {
        let queued = {
            let mut outbox = self.outbox.lock();
            if outbox.closed {
                return;
            }
            outbox.closed = true;
            std::mem::take(&mut outbox.queued)
        };
        for queued in queued {
            let _ = queued.reply.send(Err(GatewayError::SocketClosed));
        }
        info!(target = "gateway", code, reason = %reason, "gateway session closed");
        self.state_tx.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = GatewayState::Closed { code, reason };
            true
        });
        self.cancel.cancel();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            command = commands.recv() => command,
            _ = cancel.cancelled() => None,
        };
        match command {
            Some(WsCommand::Frame(text)) => {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(target = "gateway", error = %err, "gateway write failed");
                    break;
                }
            }
            Some(WsCommand::Close(code, reason)) => {
                let frame = CloseFrame {
                    code: WsCloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            None => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, inner: Arc<Inner>) {
    let mut ended: Option<(Option<u16>, String)> = None;
    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => match Envelope::<ServerMessage>::from_text(&text) {
                Ok(envelope) => {
                    trace!(
                        target = "gateway",
                        seq = envelope.seq,
                        kind = envelope.message.kind(),
                        "received frame"
                    );
                    let _ = inner.inbound.send(Arc::new(envelope));
                }
                Err(err) => {
                    warn!(target = "gateway", error = %err, "unparsable gateway frame");
                    let code = CloseCode::InvalidFormat;
                    inner.close_with(code.code(), code.reason().to_string());
                    return;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                ended = Some(match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                });
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                ended = Some((None, err.to_string()));
                break;
            }
            None => break,
        }
    }
    let (code, reason) = ended.unwrap_or_else(|| (None, "connection closed".to_string()));
    inner.finish(code, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_gateway::GatewayConfig;
    use test_timeout::tokio_timeout_test;

    async fn connect(url: &str, identity: PersonalIdentity) -> GatewayClient {
        let config = ClientConfig {
            gateway_url: url.to_string(),
            ..ClientConfig::default()
        };
        GatewayClient::connect(&config, Arc::new(identity)).await.unwrap()
    }

    #[tokio_timeout_test]
    async fn handshake_reaches_connected() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let client = connect(&gateway.ws_url(), PersonalIdentity::generate()).await;
        client.wait_connected().await.unwrap();
        assert_eq!(client.state(), GatewayState::Connected);
    }

    #[tokio_timeout_test]
    async fn queued_sends_flush_in_order_with_even_seqs() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let client = connect(&gateway.ws_url(), PersonalIdentity::generate()).await;

        let offline = PersonalIdentity::generate().fingerprint();
        let first = client.clone();
        let second = client.clone();
        let a = tokio::spawn(async move {
            first
                .send(ClientMessage::PeerRequestCancel {
                    connection_id: uuid::Uuid::new_v4(),
                })
                .await
        });
        tokio::task::yield_now().await;
        let b = tokio::spawn(async move {
            second
                .send(ClientMessage::PeerRequest {
                    peer_identity: offline,
                    connection_id: uuid::Uuid::new_v4(),
                })
                .await
        });

        let seq_a = a.await.unwrap().unwrap();
        let seq_b = b.await.unwrap().unwrap();
        // IDENTIFY and CHALLENGE_RESPONSE take 0 and 2.
        assert_eq!((seq_a, seq_b), (4, 6));
        assert_eq!(client.state(), GatewayState::Connected);
    }

    #[tokio_timeout_test]
    async fn request_correlates_offline_reply() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let client = connect(&gateway.ws_url(), PersonalIdentity::generate()).await;
        client.wait_connected().await.unwrap();

        let connection_id = uuid::Uuid::new_v4();
        let reply = client
            .request(
                ClientMessage::PeerRequest {
                    peer_identity: PersonalIdentity::generate().fingerprint(),
                    connection_id,
                },
                Duration::from_secs(2),
                |seq, message| message.reply_to() == Some(seq),
            )
            .await
            .unwrap();
        assert!(matches!(
            reply.message,
            ServerMessage::PeerOffline { connection_id: id, .. } if id == connection_id
        ));
    }

    #[tokio_timeout_test]
    async fn close_rejects_later_sends_and_pending_waits() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let client = connect(&gateway.ws_url(), PersonalIdentity::generate()).await;
        client.wait_connected().await.unwrap();

        let waiter = client.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_for(|_| false, Duration::from_secs(30), None)
                .await
        });
        tokio::task::yield_now().await;
        client.close();

        assert_eq!(wait.await.unwrap().unwrap_err(), GatewayError::SocketClosed);
        let err = client
            .send(ClientMessage::PeerRequestCancel {
                connection_id: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::SocketClosed);
        assert!(matches!(
            client.state(),
            GatewayState::Closed { code: Some(1000), .. }
        ));
    }

    #[tokio_timeout_test]
    async fn wait_for_honours_timeout_and_cancellation() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let client = connect(&gateway.ws_url(), PersonalIdentity::generate()).await;
        client.wait_connected().await.unwrap();

        let err = client
            .wait_for(|_| false, Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);

        let token = CancellationToken::new();
        token.cancel();
        let err = client
            .wait_for(|_| false, Duration::from_secs(5), Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
    }

    #[tokio_timeout_test]
    async fn duplicate_identity_is_closed_by_gateway() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let secret = [7u8; 32];
        let first = connect(&gateway.ws_url(), PersonalIdentity::from_secret_bytes(&secret)).await;
        first.wait_connected().await.unwrap();

        let second = connect(&gateway.ws_url(), PersonalIdentity::from_secret_bytes(&secret)).await;
        let err = second.wait_connected().await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Closed { code: Some(code), .. } if code == CloseCode::ExistingSession.code()
        ));
    }

    #[tokio_timeout_test]
    async fn falling_behind_fails_the_wait() {
        let (tx, rx) = broadcast::channel(2);
        for seq in [1, 3, 5] {
            let _ = tx.send(Arc::new(Envelope::new(
                seq,
                ServerMessage::ChallengeSuccess { for_seq: 0 },
            )));
        }
        let never = CancellationToken::new();
        let err = next_matching(rx, |_| true, Duration::from_secs(5), &never, &never)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Lagged(1));
    }
}
