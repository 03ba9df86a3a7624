//! WebRTC channel establishment with perfect negotiation.
//!
//! The accepting side of a peer request is *polite* and the requesting side
//! *impolite*. Both open the same pre-negotiated data channel, so both raise
//! negotiation-needed and colliding offers are routine: the impolite side
//! ignores the polite offer, the polite side rolls its own back.
//!
//! [`PeerConnection`] abstracts the underlying engine. [`WebRtcFactory`] wraps
//! webrtc-rs; [`LoopbackFactory`] is an in-process stand-in with the same
//! signaling state rules.

pub mod channel;
pub mod config;
pub mod loopback;
pub mod native;
pub mod signal;

use std::sync::Arc;

use async_trait::async_trait;
use parley_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

pub use channel::{NegotiationStats, RtcChannel};
pub use config::RtcConfig;
pub use loopback::{LoopbackFactory, LoopbackPeer};
pub use native::WebRtcFactory;
pub use signal::{Signal, SignalRelay, SignalSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcState {
    Connecting,
    Connected,
    /// ICE lost connectivity; may recover.
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Events a peer connection raises towards its negotiation driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    DataChannelOpen,
    DataChannelMessage(Vec<u8>),
    DataChannelClosed,
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtcError {
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    #[error("signaling relay failed: {0}")]
    Signaling(String),
    #[error("data channel is not open")]
    NotConnected,
    #[error("channel closed")]
    Closed,
    #[error("timed out waiting for the channel to open")]
    Timeout,
}

/// The subset of an RTCPeerConnection the negotiation driver needs.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    /// Accepts offers, answers and `rollback`.
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    async fn send(&self, data: &[u8]) -> Result<(), RtcError>;
    async fn close(&self) -> Result<(), RtcError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Creates a connection with its data channel already declared.
    async fn create(&self, config: &RtcConfig) -> Result<(Arc<dyn PeerConnection>, PeerEvents), RtcError>;
}
