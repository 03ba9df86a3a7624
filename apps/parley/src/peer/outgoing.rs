use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_proto::{ClientMessage, Fingerprint, ServerMessage};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::secure::SecureChannel;
use super::{PeerConnector, PeerRequestError, advance};
use crate::gateway::Inbound;
use crate::otr::{OtrConfig, Role};
use crate::rtc::{RtcChannel, SignalRelay, SignalSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    Pending,
    Accepted,
    Connected,
    Rejected,
    PeerOffline,
    Cancelled,
    WebRtcFailed,
    /// No reply within the peer-request timeout.
    TimedOut,
}

impl OutgoingState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OutgoingState::Pending | OutgoingState::Accepted)
    }
}

impl fmt::Display for OutgoingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutgoingState::Pending => "PENDING",
            OutgoingState::Accepted => "ACCEPTED",
            OutgoingState::Connected => "CONNECTED",
            OutgoingState::Rejected => "REJECTED",
            OutgoingState::PeerOffline => "PEER_OFFLINE",
            OutgoingState::Cancelled => "CANCELLED",
            OutgoingState::WebRtcFailed => "WEBRTC_FAILED",
            OutgoingState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

struct OutgoingInner {
    connection_id: Uuid,
    peer: Fingerprint,
    connector: PeerConnector,
    state_tx: watch::Sender<OutgoingState>,
    channel: Mutex<Option<RtcChannel>>,
    cancel: CancellationToken,
}

impl OutgoingInner {
    fn state(&self) -> OutgoingState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: OutgoingState) -> bool {
        let changed = advance(&self.state_tx, next, |state| state.is_terminal());
        if changed {
            info!(
                target = "peer",
                connection_id = %self.connection_id,
                peer = %self.peer.short(),
                state = %next,
                "outgoing request state"
            );
        }
        changed
    }

    async fn send_cancel(&self) {
        let cancel = ClientMessage::PeerRequestCancel {
            connection_id: self.connection_id,
        };
        if let Err(err) = self.connector.gateway.send(cancel).await {
            debug!(target = "peer", connection_id = %self.connection_id, error = %err, "could not send cancel");
        }
    }
}

/// A request we sent. Cheap to clone.
#[derive(Clone)]
pub struct OutgoingPeerRequest {
    inner: Arc<OutgoingInner>,
}

pub(super) async fn start(
    connector: PeerConnector,
    peer: Fingerprint,
) -> Result<OutgoingPeerRequest, PeerRequestError> {
    let connection_id = Uuid::new_v4();
    let gateway = connector.gateway.clone();

    // Subscribe before sending so neither the reply nor an early offer from
    // the peer can slip past.
    let relay: Arc<dyn SignalRelay> = Arc::new(gateway.clone());
    let signals = SignalSession::open(relay, peer, connection_id);
    let replies = gateway.subscribe();
    let seq = gateway
        .send(ClientMessage::PeerRequest {
            peer_identity: peer,
            connection_id,
        })
        .await?;
    debug!(target = "peer", %connection_id, peer = %peer.short(), seq, "peer request sent");

    let (state_tx, _) = watch::channel(OutgoingState::Pending);
    let inner = Arc::new(OutgoingInner {
        connection_id,
        peer,
        connector,
        state_tx,
        channel: Mutex::new(None),
        cancel: CancellationToken::new(),
    });
    tokio::spawn(drive(inner.clone(), replies, seq, signals));
    Ok(OutgoingPeerRequest { inner })
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Accepted,
    Rejected,
    Offline,
    Cancelled,
    /// Frames were dropped before we read them; the answer may be among them.
    Lost,
}

fn classify(seq: u64, connection_id: Uuid, message: &ServerMessage) -> Option<Reply> {
    if let ServerMessage::GotPeerRequestCancelled { connection_id: id } = message {
        return (*id == connection_id).then_some(Reply::Cancelled);
    }
    if message.reply_to() != Some(seq) {
        return None;
    }
    match message {
        ServerMessage::PeerRequestAccepted { connection_id: id, .. } if *id == connection_id => {
            Some(Reply::Accepted)
        }
        ServerMessage::PeerRequestRejected { connection_id: id, .. } if *id == connection_id => {
            Some(Reply::Rejected)
        }
        ServerMessage::PeerOffline { .. } => Some(Reply::Offline),
        _ => None,
    }
}

async fn next_reply(
    replies: &mut broadcast::Receiver<Inbound>,
    seq: u64,
    connection_id: Uuid,
) -> Reply {
    loop {
        match replies.recv().await {
            Ok(envelope) => {
                if let Some(reply) = classify(seq, connection_id, &envelope.message) {
                    return reply;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "peer", %connection_id, skipped, "request listener lagged");
                return Reply::Lost;
            }
            Err(broadcast::error::RecvError::Closed) => return Reply::Cancelled,
        }
    }
}

async fn drive(
    inner: Arc<OutgoingInner>,
    mut replies: broadcast::Receiver<Inbound>,
    seq: u64,
    signals: SignalSession,
) {
    let gateway = inner.connector.gateway.clone();
    let deadline = Instant::now() + inner.connector.config.peer_request_timeout;

    let reply = tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => return,
        reply = next_reply(&mut replies, seq, inner.connection_id) => reply,
        _ = gateway.cancel_token().cancelled() => Reply::Cancelled,
        _ = tokio::time::sleep_until(deadline) => {
            if inner.transition(OutgoingState::TimedOut) {
                inner.send_cancel().await;
            }
            return;
        }
    };
    drop(replies);

    match reply {
        Reply::Accepted => {}
        Reply::Rejected => {
            inner.transition(OutgoingState::Rejected);
            return;
        }
        Reply::Offline => {
            inner.transition(OutgoingState::PeerOffline);
            return;
        }
        Reply::Cancelled => {
            inner.transition(OutgoingState::Cancelled);
            return;
        }
        Reply::Lost => {
            // The answer is unknown; withdraw the request.
            if inner.transition(OutgoingState::Cancelled) {
                inner.send_cancel().await;
            }
            return;
        }
    }

    if !inner.transition(OutgoingState::Accepted) {
        return;
    }
    let config = &inner.connector.config.rtc;
    let channel = match RtcChannel::open(signals, inner.connector.factory.as_ref(), false, config).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(target = "peer", connection_id = %inner.connection_id, error = %err, "failed to open rtc channel");
            inner.transition(OutgoingState::WebRtcFailed);
            return;
        }
    };
    *inner.channel.lock() = Some(channel.clone());

    tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => channel.close().await,
        connected = channel.wait_connected() => match connected {
            Ok(()) => {
                inner.transition(OutgoingState::Connected);
            }
            Err(err) => {
                debug!(target = "peer", connection_id = %inner.connection_id, error = %err, "rtc channel did not connect");
                inner.transition(OutgoingState::WebRtcFailed);
            }
        },
    }
}

impl OutgoingPeerRequest {
    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    pub fn peer(&self) -> Fingerprint {
        self.inner.peer
    }

    pub fn state(&self) -> OutgoingState {
        self.inner.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<OutgoingState> {
        self.inner.state_tx.subscribe()
    }

    /// The RTC channel, once the peer has accepted.
    pub fn channel(&self) -> Option<RtcChannel> {
        self.inner.channel.lock().clone()
    }

    /// Withdraws the request. Valid while PENDING or ACCEPTED.
    pub async fn cancel(&self) -> Result<(), PeerRequestError> {
        if !self.inner.transition(OutgoingState::Cancelled) {
            return Err(PeerRequestError::InvalidStateTransition {
                action: "cancel",
                state: self.state().to_string(),
            });
        }
        self.inner.cancel.cancel();
        self.inner.send_cancel().await;
        let channel = self.inner.channel.lock().clone();
        if let Some(channel) = channel {
            channel.close().await;
        }
        Ok(())
    }

    /// Waits for a terminal state and returns it.
    pub async fn wait_for_outcome(&self) -> OutgoingState {
        let mut rx = self.state_changes();
        let outcome = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        outcome
    }

    /// Once CONNECTED, runs the key exchange as initiator.
    pub async fn secure(&self) -> Result<SecureChannel, PeerRequestError> {
        let outcome = self.wait_for_outcome().await;
        let channel = match (outcome, self.channel()) {
            (OutgoingState::Connected, Some(channel)) => channel,
            _ => {
                return Err(PeerRequestError::InvalidStateTransition {
                    action: "secure",
                    state: outcome.to_string(),
                });
            }
        };
        let connector = &self.inner.connector;
        SecureChannel::establish(
            channel,
            connector.gateway.identity(),
            self.inner.peer,
            Role::Initiator,
            OtrConfig::from(connector.config()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_proto::Envelope;
    use test_timeout::tokio_timeout_test;

    fn frame(seq: u64, message: ServerMessage) -> Inbound {
        Arc::new(Envelope::new(seq, message))
    }

    #[test]
    fn replies_match_on_seq_and_connection() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let accepted = ServerMessage::PeerRequestAccepted {
            for_seq: 4,
            connection_id: id,
        };
        assert_eq!(classify(4, id, &accepted), Some(Reply::Accepted));
        assert_eq!(classify(6, id, &accepted), None);
        assert_eq!(classify(4, other, &accepted), None);
        assert_eq!(
            classify(4, id, &ServerMessage::PeerOffline { for_seq: 4, connection_id: other }),
            Some(Reply::Offline)
        );
        assert_eq!(
            classify(4, id, &ServerMessage::GotPeerRequestCancelled { connection_id: id }),
            Some(Reply::Cancelled)
        );
    }

    #[tokio_timeout_test]
    async fn unrelated_frames_are_skipped() {
        let id = Uuid::new_v4();
        let (tx, mut rx) = broadcast::channel(8);
        let _ = tx.send(frame(1, ServerMessage::GotPeerRequestCancelled {
            connection_id: Uuid::new_v4(),
        }));
        let _ = tx.send(frame(3, ServerMessage::PeerRequestRejected {
            for_seq: 2,
            connection_id: id,
        }));
        assert_eq!(next_reply(&mut rx, 2, id).await, Reply::Rejected);
    }

    #[tokio_timeout_test]
    async fn a_lagged_listener_gives_up_on_the_reply() {
        let id = Uuid::new_v4();
        let (tx, mut rx) = broadcast::channel(1);
        let _ = tx.send(frame(1, ServerMessage::PeerRequestAccepted {
            for_seq: 2,
            connection_id: id,
        }));
        let _ = tx.send(frame(3, ServerMessage::ChallengeSuccess { for_seq: 0 }));
        assert_eq!(next_reply(&mut rx, 2, id).await, Reply::Lost);
    }
}
