use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use parley_proto::{Fingerprint, IceCandidate, SdpKind, SessionDescription};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::signal::SignalSender;
use super::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, RtcConfig,
    RtcError, RtcState, Signal, SignalSession, SignalingState,
};

/// Counters describing how negotiation went. Exposed for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationStats {
    pub offers_sent: u32,
    pub answers_sent: u32,
    pub offers_ignored: u32,
    pub rollbacks: u32,
    pub candidates_buffered: u32,
    pub candidates_discarded: u32,
}

struct ChannelInner {
    connection_id: Uuid,
    peer: Fingerprint,
    polite: bool,
    pc: Arc<dyn PeerConnection>,
    state_tx: watch::Sender<RtcState>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    stats: Mutex<NegotiationStats>,
    pc_closed: AtomicBool,
    /// Set when the data channel missed its open deadline.
    timed_out: AtomicBool,
    cancel: CancellationToken,
}

impl ChannelInner {
    fn state(&self) -> RtcState {
        *self.state_tx.borrow()
    }

    /// CLOSED is absorbing.
    fn set_state(&self, next: RtcState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next || *state == RtcState::Closed {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(
                target = "webrtc",
                connection_id = %self.connection_id,
                peer = %self.peer.short(),
                state = ?next,
                "rtc channel state"
            );
        }
        changed
    }

    async fn shutdown(&self) {
        self.set_state(RtcState::Closed);
        self.cancel.cancel();
        if !self.pc_closed.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.pc.close().await {
                debug!(target = "webrtc", connection_id = %self.connection_id, error = %err, "peer connection close failed");
            }
        }
    }
}

/// One reliable, ordered byte channel to a peer, established with perfect
/// negotiation over a [`SignalSession`].
#[derive(Clone)]
pub struct RtcChannel {
    inner: Arc<ChannelInner>,
}

impl RtcChannel {
    pub async fn open(
        signals: SignalSession,
        factory: &dyn PeerConnectionFactory,
        polite: bool,
        config: &RtcConfig,
    ) -> Result<Self, RtcError> {
        let (pc, events) = factory.create(config).await?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RtcState::Connecting);
        let inner = Arc::new(ChannelInner {
            connection_id: signals.connection_id(),
            peer: signals.peer(),
            polite,
            pc,
            state_tx,
            incoming: AsyncMutex::new(incoming_rx),
            stats: Mutex::new(NegotiationStats::default()),
            pc_closed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        debug!(
            target = "webrtc",
            connection_id = %inner.connection_id,
            polite,
            "opening rtc channel"
        );

        let (relay, inbound) = signals.into_parts();
        let negotiator = Negotiator {
            inner: inner.clone(),
            relay,
            incoming_tx,
            making_offer: false,
            ignore_offer: false,
            setting_remote_answer_pending: false,
            pending_candidates: Vec::new(),
            opened: false,
        };
        tokio::spawn(negotiator.run(events, inbound, config.open_timeout));
        Ok(Self { inner })
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    pub fn peer(&self) -> Fingerprint {
        self.inner.peer
    }

    pub fn is_polite(&self) -> bool {
        self.inner.polite
    }

    pub fn state(&self) -> RtcState {
        self.inner.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<RtcState> {
        self.inner.state_tx.subscribe()
    }

    pub fn negotiation_stats(&self) -> NegotiationStats {
        *self.inner.stats.lock()
    }

    /// Resolves on CONNECTED; fails if the channel closes first, with
    /// `Timeout` when it closed because it never opened.
    pub async fn wait_connected(&self) -> Result<(), RtcError> {
        let mut rx = self.state_changes();
        let state = *rx
            .wait_for(|state| matches!(state, RtcState::Connected | RtcState::Closed))
            .await
            .map_err(|_| RtcError::Closed)?;
        match state {
            RtcState::Connected => Ok(()),
            _ if self.inner.timed_out.load(Ordering::SeqCst) => Err(RtcError::Timeout),
            _ => Err(RtcError::Closed),
        }
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), RtcError> {
        match self.state() {
            RtcState::Connected => self.inner.pc.send(data).await,
            RtcState::Closed => Err(RtcError::Closed),
            _ => Err(RtcError::NotConnected),
        }
    }

    /// Next inbound message; `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inner.incoming.lock().await.recv().await
    }

    pub async fn close(&self) {
        self.inner.shutdown().await;
    }
}

/// Driver task state. Every negotiation transition happens on this task.
struct Negotiator {
    inner: Arc<ChannelInner>,
    relay: SignalSender,
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    making_offer: bool,
    ignore_offer: bool,
    setting_remote_answer_pending: bool,
    pending_candidates: Vec<IceCandidate>,
    opened: bool,
}

impl Negotiator {
    async fn run(
        mut self,
        mut events: PeerEvents,
        mut inbound: BoxStream<'static, Signal>,
        open_timeout: Duration,
    ) {
        let cancel = self.inner.cancel.clone();
        let open_deadline = tokio::time::sleep(open_timeout);
        tokio::pin!(open_deadline);
        let mut signals_open = true;

        loop {
            // Local events first so simultaneous offers collide deterministically.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                _ = &mut open_deadline, if !self.opened => {
                    warn!(
                        target = "webrtc",
                        connection_id = %self.inner.connection_id,
                        timeout_ms = open_timeout.as_millis() as u64,
                        "data channel did not open in time"
                    );
                    self.inner.timed_out.store(true, Ordering::SeqCst);
                    break;
                }
                signal = inbound.next(), if signals_open => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => {
                        debug!(target = "webrtc", connection_id = %self.inner.connection_id, "signaling ended");
                        signals_open = false;
                    }
                },
            }
            if self.inner.state() == RtcState::Closed {
                break;
            }
        }
        self.inner.shutdown().await;
    }

    async fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => self.make_offer().await,
            PeerEvent::IceCandidate(candidate) => {
                trace!(target = "webrtc", connection_id = %self.inner.connection_id, "local candidate");
                if let Err(err) = self.relay.send(Signal::Candidate(candidate)).await {
                    warn!(target = "webrtc", connection_id = %self.inner.connection_id, error = %err, "failed to relay candidate");
                }
            }
            PeerEvent::IceConnectionState(state) => self.on_ice_state(state),
            PeerEvent::DataChannelOpen => {
                self.opened = true;
                self.inner.set_state(RtcState::Connected);
            }
            PeerEvent::DataChannelMessage(data) => {
                let _ = self.incoming_tx.send(data);
            }
            PeerEvent::DataChannelClosed => {
                self.inner.set_state(RtcState::Closed);
            }
        }
    }

    fn on_ice_state(&mut self, state: IceConnectionState) {
        debug!(target = "webrtc", connection_id = %self.inner.connection_id, ice = ?state, "ice state");
        match state {
            IceConnectionState::Disconnected => {
                if self.inner.state() == RtcState::Connected {
                    self.inner.set_state(RtcState::Disconnected);
                }
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if self.inner.state() == RtcState::Disconnected {
                    self.inner.set_state(RtcState::Connected);
                }
            }
            IceConnectionState::Failed | IceConnectionState::Closed => {
                self.inner.set_state(RtcState::Closed);
            }
            IceConnectionState::New | IceConnectionState::Checking => {}
        }
    }

    async fn make_offer(&mut self) {
        self.making_offer = true;
        let pc = &self.inner.pc;
        let result = async {
            let offer = pc.create_offer().await?;
            pc.set_local_description(offer.clone()).await?;
            self.relay.send(Signal::Description(offer)).await
        }
        .await;
        self.making_offer = false;

        match result {
            Ok(()) => self.inner.stats.lock().offers_sent += 1,
            Err(err) => warn!(
                target = "webrtc",
                connection_id = %self.inner.connection_id,
                error = %err,
                "failed to send offer"
            ),
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Description(description) => {
                if let Err(err) = self.on_description(description).await {
                    warn!(
                        target = "webrtc",
                        connection_id = %self.inner.connection_id,
                        error = %err,
                        "failed to apply remote description"
                    );
                }
            }
            Signal::Candidate(candidate) => self.on_candidate(candidate).await,
            Signal::PeerOffline => {
                info!(target = "webrtc", connection_id = %self.inner.connection_id, "peer went offline");
                self.inner.set_state(RtcState::Closed);
            }
            Signal::Cancelled => {
                if !self.opened {
                    info!(target = "webrtc", connection_id = %self.inner.connection_id, "peer request withdrawn");
                    self.inner.set_state(RtcState::Closed);
                }
            }
        }
    }

    async fn on_description(&mut self, description: SessionDescription) -> Result<(), RtcError> {
        let pc = self.inner.pc.clone();
        let is_offer = description.is_offer();
        let ready_for_offer = !self.making_offer
            && (pc.signaling_state() == SignalingState::Stable || self.setting_remote_answer_pending);
        let offer_collision = is_offer && !ready_for_offer;

        self.ignore_offer = !self.inner.polite && offer_collision;
        if self.ignore_offer {
            debug!(target = "webrtc", connection_id = %self.inner.connection_id, "ignoring colliding offer");
            self.inner.stats.lock().offers_ignored += 1;
            return Ok(());
        }

        if offer_collision && pc.signaling_state() == SignalingState::HaveLocalOffer {
            debug!(target = "webrtc", connection_id = %self.inner.connection_id, "rolling back local offer");
            pc.set_local_description(SessionDescription {
                kind: SdpKind::Rollback,
                sdp: String::new(),
            })
            .await?;
            self.inner.stats.lock().rollbacks += 1;
        }

        self.setting_remote_answer_pending = description.kind == SdpKind::Answer;
        let applied = pc.set_remote_description(description).await;
        self.setting_remote_answer_pending = false;
        applied?;

        self.flush_candidates().await;

        if is_offer {
            let answer = pc.create_answer().await?;
            pc.set_local_description(answer.clone()).await?;
            self.relay.send(Signal::Description(answer)).await?;
            self.inner.stats.lock().answers_sent += 1;
        }
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        let pc = self.inner.pc.clone();
        if !pc.has_remote_description().await {
            if self.ignore_offer {
                self.inner.stats.lock().candidates_discarded += 1;
            } else {
                self.inner.stats.lock().candidates_buffered += 1;
                self.pending_candidates.push(candidate);
            }
            return;
        }
        if let Err(err) = pc.add_ice_candidate(candidate).await {
            if self.ignore_offer {
                self.inner.stats.lock().candidates_discarded += 1;
            } else {
                warn!(target = "webrtc", connection_id = %self.inner.connection_id, error = %err, "failed to add remote candidate");
            }
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.inner.pc.add_ice_candidate(candidate).await {
                warn!(target = "webrtc", connection_id = %self.inner.connection_id, error = %err, "failed to add buffered candidate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::LoopbackFactory;
    use crate::rtc::signal::memory::{MemoryRelay, relay_pair};
    use parley_proto::PersonalIdentity;
    use test_timeout::tokio_timeout_test;

    struct Pair {
        impolite: RtcChannel,
        polite: RtcChannel,
        factory: LoopbackFactory,
        relays: (Arc<MemoryRelay>, Arc<MemoryRelay>),
        fingerprints: (Fingerprint, Fingerprint),
        connection_id: Uuid,
    }

    async fn open_pair() -> Pair {
        let alice = PersonalIdentity::generate().fingerprint();
        let bob = PersonalIdentity::generate().fingerprint();
        let (alice_relay, bob_relay) = relay_pair(alice, bob);
        let connection_id = Uuid::new_v4();
        let factory = LoopbackFactory::new();
        let config = RtcConfig::host_only();

        let alice_signals = SignalSession::open(alice_relay.clone(), bob, connection_id);
        let bob_signals = SignalSession::open(bob_relay.clone(), alice, connection_id);
        let impolite = RtcChannel::open(alice_signals, &factory, false, &config)
            .await
            .unwrap();
        let polite = RtcChannel::open(bob_signals, &factory, true, &config)
            .await
            .unwrap();
        Pair {
            impolite,
            polite,
            factory,
            relays: (alice_relay, bob_relay),
            fingerprints: (alice, bob),
            connection_id,
        }
    }

    #[tokio_timeout_test(10)]
    async fn simultaneous_offers_resolve_to_impolite_offer() {
        let pair = open_pair().await;
        pair.impolite.wait_connected().await.unwrap();
        pair.polite.wait_connected().await.unwrap();

        let impolite = pair.impolite.negotiation_stats();
        let polite = pair.polite.negotiation_stats();
        assert_eq!(impolite.offers_sent, 1);
        assert_eq!(polite.offers_sent, 1);
        assert_eq!(impolite.offers_ignored, 1);
        assert_eq!(impolite.rollbacks, 0);
        assert_eq!(polite.rollbacks, 1);
        assert_eq!(polite.answers_sent, 1);
        assert_eq!(impolite.answers_sent, 0);

        let peers = pair.factory.peers();
        let (alice_pc, bob_pc) = (&peers[0], &peers[1]);
        assert_eq!(bob_pc.remote_peer(), Some(alice_pc.id()));
        assert_eq!(alice_pc.remote_peer(), Some(bob_pc.id()));
    }

    #[tokio_timeout_test(10)]
    async fn bytes_flow_both_ways_in_order() {
        let pair = open_pair().await;
        pair.impolite.wait_connected().await.unwrap();
        pair.polite.wait_connected().await.unwrap();

        for n in 0u8..5 {
            pair.impolite.send(&[n]).await.unwrap();
        }
        for n in 0u8..5 {
            assert_eq!(pair.polite.recv().await.unwrap(), vec![n]);
        }
        pair.polite.send(b"back").await.unwrap();
        assert_eq!(pair.impolite.recv().await.unwrap(), b"back".to_vec());
    }

    #[tokio_timeout_test(10)]
    async fn ice_disconnect_recovers_to_connected() {
        let pair = open_pair().await;
        pair.polite.wait_connected().await.unwrap();
        let mut states = pair.polite.state_changes();
        let pc = &pair.factory.peers()[1];

        pc.simulate_ice_state(IceConnectionState::Disconnected);
        states
            .wait_for(|state| *state == RtcState::Disconnected)
            .await
            .unwrap();
        assert_eq!(pair.polite.send(b"x").await, Err(RtcError::NotConnected));

        pc.simulate_ice_state(IceConnectionState::Connected);
        states
            .wait_for(|state| *state == RtcState::Connected)
            .await
            .unwrap();
    }

    #[tokio_timeout_test(10)]
    async fn ice_failure_closes_the_channel() {
        let pair = open_pair().await;
        pair.polite.wait_connected().await.unwrap();
        pair.factory.peers()[1].simulate_ice_state(IceConnectionState::Failed);
        let mut states = pair.polite.state_changes();
        states
            .wait_for(|state| *state == RtcState::Closed)
            .await
            .unwrap();
    }

    #[tokio_timeout_test(10)]
    async fn closing_one_side_closes_the_other() {
        let pair = open_pair().await;
        pair.impolite.wait_connected().await.unwrap();
        pair.polite.wait_connected().await.unwrap();

        pair.impolite.close().await;
        assert_eq!(pair.impolite.state(), RtcState::Closed);
        let mut states = pair.polite.state_changes();
        states
            .wait_for(|state| *state == RtcState::Closed)
            .await
            .unwrap();
        assert_eq!(pair.polite.recv().await, None);
    }

    #[tokio_timeout_test(10)]
    async fn peer_offline_signal_closes_a_connecting_channel() {
        let alice = PersonalIdentity::generate().fingerprint();
        let bob = PersonalIdentity::generate().fingerprint();
        let (alice_relay, _bob_relay) = relay_pair(alice, bob);
        let connection_id = Uuid::new_v4();
        let factory = LoopbackFactory::new();

        let signals = SignalSession::open(alice_relay.clone(), bob, connection_id);
        let channel = RtcChannel::open(signals, &factory, false, &RtcConfig::host_only())
            .await
            .unwrap();
        alice_relay.inject(bob, connection_id, Signal::PeerOffline);
        assert_eq!(channel.wait_connected().await, Err(RtcError::Closed));
    }

    #[tokio_timeout_test(10)]
    async fn early_candidates_are_buffered_until_the_offer_lands() {
        let pair = open_pair().await;
        let (alice, _bob) = pair.fingerprints;
        // A candidate for this attempt that races ahead of any description.
        pair.relays.1.inject(
            alice,
            pair.connection_id,
            Signal::Candidate(IceCandidate {
                candidate: "candidate:early 1 udp 1 127.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
        );
        pair.polite.wait_connected().await.unwrap();
        assert!(pair.polite.negotiation_stats().candidates_buffered >= 1);
    }

    #[tokio_timeout_test(5)]
    async fn unopened_channel_times_out() {
        let alice = PersonalIdentity::generate().fingerprint();
        let bob = PersonalIdentity::generate().fingerprint();
        let (alice_relay, _bob_relay) = relay_pair(alice, bob);
        let factory = LoopbackFactory::new();
        let config = RtcConfig::host_only().with_open_timeout(Duration::from_millis(100));

        let signals = SignalSession::open(alice_relay, bob, Uuid::new_v4());
        let channel = RtcChannel::open(signals, &factory, false, &config).await.unwrap();
        assert_eq!(channel.wait_connected().await, Err(RtcError::Timeout));
    }
}
