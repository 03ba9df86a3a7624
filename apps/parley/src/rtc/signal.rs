use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parley_proto::{Fingerprint, IceCandidate, SessionDescription};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::RtcError;

/// Signaling traffic for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
    /// The relay could not reach the peer.
    PeerOffline,
    /// The peer request behind this attempt was withdrawn.
    Cancelled,
}

/// Carries signals between two identities, scoped by connection ID.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    async fn send_signal(
        &self,
        peer: Fingerprint,
        connection_id: Uuid,
        signal: Signal,
    ) -> Result<(), RtcError>;

    /// Signals from `peer` for `connection_id`, from the moment of the call.
    fn subscribe_signals(&self, peer: Fingerprint, connection_id: Uuid) -> BoxStream<'static, Signal>;
}

/// A relay subscription for one attempt. Open it before anything can reply
/// so early descriptions are buffered rather than lost.
pub struct SignalSession {
    sender: SignalSender,
    inbound: BoxStream<'static, Signal>,
}

#[derive(Clone)]
pub(crate) struct SignalSender {
    relay: Arc<dyn SignalRelay>,
    peer: Fingerprint,
    connection_id: Uuid,
}

impl SignalSender {
    pub(crate) async fn send(&self, signal: Signal) -> Result<(), RtcError> {
        self.relay
            .send_signal(self.peer, self.connection_id, signal)
            .await
    }
}

impl SignalSession {
    pub fn open(relay: Arc<dyn SignalRelay>, peer: Fingerprint, connection_id: Uuid) -> Self {
        let inbound = relay.subscribe_signals(peer, connection_id);
        Self {
            sender: SignalSender {
                relay,
                peer,
                connection_id,
            },
            inbound,
        }
    }

    pub fn peer(&self) -> Fingerprint {
        self.sender.peer
    }

    pub fn connection_id(&self) -> Uuid {
        self.sender.connection_id
    }

    pub(crate) fn into_parts(self) -> (SignalSender, BoxStream<'static, Signal>) {
        (self.sender, self.inbound)
    }
}

/// Adapts a broadcast receiver into a stream of the items `select` keeps.
/// Ends when `cancel` fires or the sender goes away.
pub(crate) fn select_stream<T, U, F>(
    rx: broadcast::Receiver<T>,
    cancel: CancellationToken,
    select: F,
) -> BoxStream<'static, U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Option<U> + Send + 'static,
{
    futures::stream::unfold((rx, cancel, select), |(mut rx, cancel, mut select)| async move {
        loop {
            let received = tokio::select! {
                biased;
                received = rx.recv() => received,
                _ = cancel.cancelled() => return None,
            };
            match received {
                Ok(item) => {
                    if let Some(out) = select(item) {
                        return Some((out, (rx, cancel, select)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "webrtc", skipped, "signal subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
pub(crate) mod memory {
    //! Two relays wired back to back, for negotiation tests without a gateway.

    use super::*;

    type Routed = (Fingerprint, Uuid, Signal);

    pub(crate) struct MemoryRelay {
        me: Fingerprint,
        inbox: broadcast::Sender<Routed>,
        outbox: broadcast::Sender<Routed>,
        cancel: CancellationToken,
    }

    pub(crate) fn relay_pair(a: Fingerprint, b: Fingerprint) -> (Arc<MemoryRelay>, Arc<MemoryRelay>) {
        let (to_a, _) = broadcast::channel(256);
        let (to_b, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        (
            Arc::new(MemoryRelay {
                me: a,
                inbox: to_a.clone(),
                outbox: to_b.clone(),
                cancel: cancel.clone(),
            }),
            Arc::new(MemoryRelay {
                me: b,
                inbox: to_b,
                outbox: to_a,
                cancel,
            }),
        )
    }

    impl MemoryRelay {
        /// Delivers `signal` to this relay's subscribers as if `from` sent it.
        pub(crate) fn inject(&self, from: Fingerprint, connection_id: Uuid, signal: Signal) {
            let _ = self.inbox.send((from, connection_id, signal));
        }
    }

    #[async_trait]
    impl SignalRelay for MemoryRelay {
        async fn send_signal(
            &self,
            _peer: Fingerprint,
            connection_id: Uuid,
            signal: Signal,
        ) -> Result<(), RtcError> {
            self.outbox
                .send((self.me, connection_id, signal))
                .map(|_| ())
                .map_err(|_| RtcError::Signaling("no subscriber".into()))
        }

        fn subscribe_signals(&self, peer: Fingerprint, connection_id: Uuid) -> BoxStream<'static, Signal> {
            select_stream(self.inbox.subscribe(), self.cancel.clone(), move |(from, id, signal)| {
                (from == peer && id == connection_id).then_some(signal)
            })
        }
    }
}
