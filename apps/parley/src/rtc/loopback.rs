//! In-process peer connections.
//!
//! Loopback peers follow the JSEP signaling-state rules closely enough to
//! exercise perfect negotiation: offers collide, rollbacks are explicit and
//! candidates need a remote description. Two peers "connect" once both have
//! completed an offer/answer exchange naming each other, at which point the
//! data channel opens on both sides and `send` delivers to the other peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;

use super::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, RtcConfig,
    RtcError, SignalingState,
};

#[derive(Default)]
struct Hub {
    peers: Mutex<Vec<Weak<LoopbackPeer>>>,
    by_id: Mutex<HashMap<u64, Weak<LoopbackPeer>>>,
    next_id: AtomicU64,
}

impl Hub {
    fn get(&self, id: u64) -> Option<Arc<LoopbackPeer>> {
        self.by_id.lock().get(&id).and_then(Weak::upgrade)
    }
}

/// Creates loopback peers that can find each other. Peers only connect to
/// peers from the same factory.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    hub: Arc<Hub>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live peers in creation order.
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.hub
            .peers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(&self, _config: &RtcConfig) -> Result<(Arc<dyn PeerConnection>, PeerEvents), RtcError> {
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(LoopbackPeer {
            id,
            hub: self.hub.clone(),
            events,
            state: Mutex::new(PeerState::default()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.hub.peers.lock().push(Arc::downgrade(&peer));
        self.hub.by_id.lock().insert(id, Arc::downgrade(&peer));
        // The pre-negotiated data channel needs an m-line.
        let _ = peer.events.send(PeerEvent::NegotiationNeeded);
        Ok((peer, rx))
    }
}

#[derive(Default)]
struct PeerState {
    signaling: SignalingState,
    generation: u32,
    remote_id: Option<u64>,
    negotiated: bool,
    gathered: bool,
    remote_candidates: Vec<IceCandidate>,
    rollbacks: u32,
}

pub struct LoopbackPeer {
    id: u64,
    hub: Arc<Hub>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackPeer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer named by the applied remote description.
    pub fn remote_peer(&self) -> Option<u64> {
        self.state.lock().remote_id
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn remote_candidates(&self) -> usize {
        self.state.lock().remote_candidates.len()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Raises an ICE connection state change as the engine would.
    pub fn simulate_ice_state(&self, state: IceConnectionState) {
        let _ = self.events.send(PeerEvent::IceConnectionState(state));
    }

    fn description(&self, kind: SdpKind, generation: u32) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("v=0 loopback id={} gen={generation}", self.id),
        }
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:loopback{} 1 udp 1 127.0.0.1 {} typ host", self.id, 40000 + self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn ensure_live(&self) -> Result<(), RtcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        Ok(())
    }

    fn ready_for(&self) -> Option<u64> {
        let state = self.state.lock();
        let ready = state.negotiated
            && state.signaling == SignalingState::Stable
            && !self.closed.load(Ordering::SeqCst);
        if ready { state.remote_id } else { None }
    }

    fn try_open(&self) {
        let Some(remote_id) = self.ready_for() else {
            return;
        };
        let Some(remote) = self.hub.get(remote_id) else {
            return;
        };
        if remote.ready_for() == Some(self.id) {
            self.mark_open();
            remote.mark_open();
        }
    }

    fn mark_open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self
                .events
                .send(PeerEvent::IceConnectionState(IceConnectionState::Connected));
            let _ = self.events.send(PeerEvent::DataChannelOpen);
        }
    }

    fn remote_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::DataChannelClosed);
        }
    }
}

fn parse_peer_id(sdp: &str) -> Option<u64> {
    sdp.split_whitespace()
        .find_map(|token| token.strip_prefix("id="))
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                state.generation += 1;
                Ok(self.description(SdpKind::Offer, state.generation))
            }
            other => Err(RtcError::InvalidState(format!("cannot create offer in {other:?}"))),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_live()?;
        let state = self.state.lock();
        match state.signaling {
            SignalingState::HaveRemoteOffer => Ok(self.description(SdpKind::Answer, state.generation)),
            other => Err(RtcError::InvalidState(format!("cannot create answer in {other:?}"))),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.ensure_live()?;
        let candidate = {
            let mut state = self.state.lock();
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.negotiated = true;
                }
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.rollbacks += 1;
                    return Ok(());
                }
                (kind, current) => {
                    return Err(RtcError::InvalidState(format!(
                        "cannot apply local {kind:?} in {current:?}"
                    )));
                }
            }
            if state.gathered {
                None
            } else {
                state.gathered = true;
                Some(self.local_candidate())
            }
        };
        if let Some(candidate) = candidate {
            let _ = self.events.send(PeerEvent::IceCandidate(candidate));
        }
        self.try_open();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.ensure_live()?;
        {
            let mut state = self.state.lock();
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.negotiated = true;
                }
                (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    return Ok(());
                }
                (kind, current) => {
                    return Err(RtcError::InvalidState(format!(
                        "cannot apply remote {kind:?} in {current:?}"
                    )));
                }
            }
            let remote_id = parse_peer_id(&description.sdp)
                .ok_or_else(|| RtcError::PeerConnection("unrecognised loopback sdp".into()))?;
            state.remote_id = Some(remote_id);
        }
        self.try_open();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        if state.remote_id.is_none() {
            return Err(RtcError::InvalidState("remote description not set".into()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_id.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        if self.closed.load(Ordering::SeqCst) {
            return SignalingState::Closed;
        }
        self.state.lock().signaling
    }

    async fn send(&self, data: &[u8]) -> Result<(), RtcError> {
        self.ensure_live()?;
        if !self.is_open() {
            return Err(RtcError::NotConnected);
        }
        let remote = self
            .remote_peer()
            .and_then(|id| self.hub.get(id))
            .ok_or(RtcError::NotConnected)?;
        remote
            .events
            .send(PeerEvent::DataChannelMessage(data.to_vec()))
            .map_err(|_| RtcError::Closed)
    }

    async fn close(&self) -> Result<(), RtcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(remote) = self.remote_peer().and_then(|id| self.hub.get(id)) {
            remote.remote_closed();
        }
        Ok(())
    }
}
