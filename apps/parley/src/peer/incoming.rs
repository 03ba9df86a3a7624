use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use parley_proto::{ClientMessage, Fingerprint, ServerMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::secure::SecureChannel;
use super::{PeerConnector, PeerRequestError, advance};
use crate::gateway::Inbound;
use crate::otr::{OtrConfig, Role};
use crate::rtc::{RtcChannel, SignalRelay, SignalSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    Pending,
    Accepted,
    Connected,
    Rejected,
    Cancelled,
    WebRtcFailed,
}

impl IncomingState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, IncomingState::Pending | IncomingState::Accepted)
    }
}

impl fmt::Display for IncomingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncomingState::Pending => "PENDING",
            IncomingState::Accepted => "ACCEPTED",
            IncomingState::Connected => "CONNECTED",
            IncomingState::Rejected => "REJECTED",
            IncomingState::Cancelled => "CANCELLED",
            IncomingState::WebRtcFailed => "WEBRTC_FAILED",
        };
        f.write_str(name)
    }
}

struct IncomingInner {
    connection_id: Uuid,
    peer: Fingerprint,
    connector: PeerConnector,
    state_tx: watch::Sender<IncomingState>,
    /// Serializes accept and reject.
    decision: tokio::sync::Mutex<()>,
    channel: Mutex<Option<RtcChannel>>,
    cancel: CancellationToken,
}

impl IncomingInner {
    fn state(&self) -> IncomingState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: IncomingState) -> bool {
        let changed = advance(&self.state_tx, next, |state| state.is_terminal());
        if changed {
            info!(
                target = "peer",
                connection_id = %self.connection_id,
                peer = %self.peer.short(),
                state = %next,
                "incoming request state"
            );
        }
        changed
    }

    /// The requester withdrew, or the gateway refused our answer.
    async fn cancelled_remotely(&self) {
        if !self.transition(IncomingState::Cancelled) {
            return;
        }
        self.cancel.cancel();
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    fn invalid(&self, action: &'static str) -> PeerRequestError {
        PeerRequestError::InvalidStateTransition {
            action,
            state: self.state().to_string(),
        }
    }
}

/// A request addressed to us. Cheap to clone.
#[derive(Clone)]
pub struct IncomingPeerRequest {
    inner: Arc<IncomingInner>,
}

impl IncomingPeerRequest {
    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    /// The requester's fingerprint.
    pub fn peer(&self) -> Fingerprint {
        self.inner.peer
    }

    pub fn state(&self) -> IncomingState {
        self.inner.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<IncomingState> {
        self.inner.state_tx.subscribe()
    }

    pub fn channel(&self) -> Option<RtcChannel> {
        self.inner.channel.lock().clone()
    }

    /// Accepts the request and opens the polite side of the channel.
    pub async fn accept(&self) -> Result<(), PeerRequestError> {
        let inner = &self.inner;
        let _decision = inner.decision.lock().await;
        if inner.state() != IncomingState::Pending {
            return Err(inner.invalid("accept"));
        }
        let gateway = &inner.connector.gateway;
        let relay: Arc<dyn SignalRelay> = Arc::new(gateway.clone());
        let signals = SignalSession::open(relay, inner.peer, inner.connection_id);
        gateway
            .send(ClientMessage::PeerAccept {
                peer_identity: inner.peer,
                connection_id: inner.connection_id,
            })
            .await?;
        if !inner.transition(IncomingState::Accepted) {
            return Err(inner.invalid("accept"));
        }

        let config = &inner.connector.config.rtc;
        let channel = match RtcChannel::open(signals, inner.connector.factory.as_ref(), true, config).await {
            Ok(channel) => channel,
            Err(err) => {
                inner.transition(IncomingState::WebRtcFailed);
                return Err(err.into());
            }
        };
        *inner.channel.lock() = Some(channel.clone());
        tokio::spawn(follow(inner.clone(), channel));
        Ok(())
    }

    /// Declines the request. Only valid while PENDING.
    pub async fn reject(&self) -> Result<(), PeerRequestError> {
        let inner = &self.inner;
        let _decision = inner.decision.lock().await;
        if inner.state() != IncomingState::Pending {
            return Err(inner.invalid("reject"));
        }
        inner
            .connector
            .gateway
            .send(ClientMessage::PeerReject {
                peer_identity: inner.peer,
                connection_id: inner.connection_id,
            })
            .await?;
        if !inner.transition(IncomingState::Rejected) {
            return Err(inner.invalid("reject"));
        }
        Ok(())
    }

    pub async fn wait_for_outcome(&self) -> IncomingState {
        let mut rx = self.state_changes();
        let outcome = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        outcome
    }

    /// Once CONNECTED, runs the key exchange as responder.
    pub async fn secure(&self) -> Result<SecureChannel, PeerRequestError> {
        let outcome = self.wait_for_outcome().await;
        let channel = match (outcome, self.channel()) {
            (IncomingState::Connected, Some(channel)) => channel,
            _ => return Err(self.inner.invalid("secure")),
        };
        let connector = &self.inner.connector;
        SecureChannel::establish(
            channel,
            connector.gateway.identity(),
            self.inner.peer,
            Role::Responder,
            OtrConfig::from(connector.config()),
        )
        .await
    }
}

async fn follow(inner: Arc<IncomingInner>, channel: RtcChannel) {
    tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => {}
        connected = channel.wait_connected() => match connected {
            Ok(()) => {
                inner.transition(IncomingState::Connected);
            }
            Err(err) => {
                debug!(target = "peer", connection_id = %inner.connection_id, error = %err, "rtc channel did not connect");
                inner.transition(IncomingState::WebRtcFailed);
            }
        },
    }
}

/// Stream of requests addressed to us.
pub struct IncomingPeerRequests {
    rx: mpsc::UnboundedReceiver<IncomingPeerRequest>,
}

impl IncomingPeerRequests {
    /// Next request, or `None` once the gateway session has ended.
    pub async fn next(&mut self) -> Option<IncomingPeerRequest> {
        self.rx.recv().await
    }
}

pub(super) fn listen(connector: PeerConnector) -> IncomingPeerRequests {
    let (tx, rx) = mpsc::unbounded_channel();
    let inbound = connector.gateway.subscribe();
    tokio::spawn(dispatch(connector, inbound, tx));
    IncomingPeerRequests { rx }
}

/// Turns GOT_PEER_REQUEST into request handles and routes cancellations to
/// the handle they name. One task sees both, so a cancel can never overtake
/// the request it cancels.
async fn dispatch(
    connector: PeerConnector,
    mut inbound: broadcast::Receiver<Inbound>,
    tx: mpsc::UnboundedSender<IncomingPeerRequest>,
) {
    let mut live: HashMap<Uuid, Weak<IncomingInner>> = HashMap::new();
    let closed = connector.gateway.cancel_token().clone();
    loop {
        let envelope = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            _ = tx.closed() => break,
            received = inbound.recv() => match received {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "peer", skipped, "incoming request listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match &envelope.message {
            ServerMessage::GotPeerRequest {
                peer_identity,
                connection_id,
            } => {
                debug!(target = "peer", %connection_id, peer = %peer_identity.short(), "got peer request");
                let (state_tx, _) = watch::channel(IncomingState::Pending);
                let inner = Arc::new(IncomingInner {
                    connection_id: *connection_id,
                    peer: *peer_identity,
                    connector: connector.clone(),
                    state_tx,
                    decision: tokio::sync::Mutex::new(()),
                    channel: Mutex::new(None),
                    cancel: CancellationToken::new(),
                });
                live.retain(|_, request| request.strong_count() > 0);
                live.insert(*connection_id, Arc::downgrade(&inner));
                if tx.send(IncomingPeerRequest { inner }).is_err() {
                    break;
                }
            }
            ServerMessage::GotPeerRequestCancelled { connection_id } => {
                let request = live.get(connection_id).and_then(Weak::upgrade);
                if let Some(request) = request {
                    request.cancelled_remotely().await;
                }
            }
            _ => {}
        }
    }

    // Requests still waiting on an answer can no longer be answered.
    for request in live.values().filter_map(Weak::upgrade) {
        if request.state() == IncomingState::Pending {
            request.cancelled_remotely().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_gateway::GatewayConfig;
    use parley_proto::PersonalIdentity;
    use test_timeout::tokio_timeout_test;

    use super::*;
    use crate::config::ClientConfig;
    use crate::gateway::GatewayClient;
    use crate::peer::OutgoingState;
    use crate::rtc::{LoopbackFactory, RtcConfig};

    async fn connector(url: &str, factory: &LoopbackFactory) -> PeerConnector {
        connector_with_timeout(url, factory, Duration::from_secs(5)).await
    }

    async fn connector_with_timeout(
        url: &str,
        factory: &LoopbackFactory,
        peer_request_timeout: Duration,
    ) -> PeerConnector {
        let config = ClientConfig {
            gateway_url: url.to_string(),
            peer_request_timeout,
            rtc: RtcConfig::host_only(),
            ..ClientConfig::default()
        };
        let gateway = GatewayClient::connect(&config, Arc::new(PersonalIdentity::generate()))
            .await
            .unwrap();
        gateway.wait_connected().await.unwrap();
        PeerConnector::new(gateway, Arc::new(factory.clone()), config)
    }

    #[tokio_timeout_test(15)]
    async fn reject_settles_both_sides() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let factory = LoopbackFactory::new();
        let alice = connector(&gateway.ws_url(), &factory).await;
        let bob = connector(&gateway.ws_url(), &factory).await;
        let mut requests = bob.incoming();

        let outgoing = alice.request(bob.gateway().fingerprint()).await.unwrap();
        let incoming = requests.next().await.unwrap();
        assert_eq!(incoming.connection_id(), outgoing.connection_id());
        assert_eq!(incoming.peer(), alice.gateway().fingerprint());

        incoming.reject().await.unwrap();
        assert_eq!(incoming.state(), IncomingState::Rejected);
        assert_eq!(outgoing.wait_for_outcome().await, OutgoingState::Rejected);

        let again = incoming.reject().await;
        assert!(matches!(
            again,
            Err(PeerRequestError::InvalidStateTransition { action: "reject", .. })
        ));
        assert!(incoming.accept().await.is_err());
    }

    #[tokio_timeout_test(15)]
    async fn requester_cancel_reaches_the_target() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let factory = LoopbackFactory::new();
        let alice = connector(&gateway.ws_url(), &factory).await;
        let bob = connector(&gateway.ws_url(), &factory).await;
        let mut requests = bob.incoming();

        let outgoing = alice.request(bob.gateway().fingerprint()).await.unwrap();
        let incoming = requests.next().await.unwrap();

        outgoing.cancel().await.unwrap();
        assert_eq!(outgoing.state(), OutgoingState::Cancelled);
        assert_eq!(incoming.wait_for_outcome().await, IncomingState::Cancelled);
        assert!(outgoing.cancel().await.is_err());
    }

    #[tokio_timeout_test(15)]
    async fn request_to_an_absent_peer_is_offline() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let factory = LoopbackFactory::new();
        let alice = connector(&gateway.ws_url(), &factory).await;

        let outgoing = alice
            .request(PersonalIdentity::generate().fingerprint())
            .await
            .unwrap();
        assert_eq!(outgoing.wait_for_outcome().await, OutgoingState::PeerOffline);
        assert!(outgoing.channel().is_none());
    }

    #[tokio_timeout_test(15)]
    async fn unanswered_request_times_out() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let factory = LoopbackFactory::new();
        let alice = connector_with_timeout(&gateway.ws_url(), &factory, Duration::from_millis(200)).await;
        let bob = connector(&gateway.ws_url(), &factory).await;
        let mut requests = bob.incoming();

        let outgoing = alice.request(bob.gateway().fingerprint()).await.unwrap();
        let incoming = requests.next().await.unwrap();
        assert_eq!(outgoing.wait_for_outcome().await, OutgoingState::TimedOut);
        // The timeout withdraws the request at the gateway too.
        assert_eq!(incoming.wait_for_outcome().await, IncomingState::Cancelled);
    }

    #[tokio_timeout_test(20)]
    async fn accepted_request_connects_both_channels() {
        let gateway = parley_gateway::spawn_local(GatewayConfig::default()).await.unwrap();
        let factory = LoopbackFactory::new();
        let alice = connector(&gateway.ws_url(), &factory).await;
        let bob = connector(&gateway.ws_url(), &factory).await;
        let mut requests = bob.incoming();

        let outgoing = alice.request(bob.gateway().fingerprint()).await.unwrap();
        let incoming = requests.next().await.unwrap();
        incoming.accept().await.unwrap();

        assert_eq!(incoming.wait_for_outcome().await, IncomingState::Connected);
        assert_eq!(outgoing.wait_for_outcome().await, OutgoingState::Connected);
        let requester = outgoing.channel().unwrap();
        let acceptor = incoming.channel().unwrap();
        assert!(!requester.is_polite());
        assert!(acceptor.is_polite());

        requester.send(b"ping").await.unwrap();
        assert_eq!(acceptor.recv().await.unwrap(), b"ping");
    }
}
