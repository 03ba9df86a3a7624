//! Peer requests: asking another identity for a channel, and answering such
//! requests.
//!
//! The requester gets an [`OutgoingPeerRequest`] and opens the impolite side
//! of the RTC channel once the peer accepts. The target sees an
//! [`IncomingPeerRequest`] and opens the polite side when it accepts.
//! [`SecureChannel`] then runs the key exchange over the connected channel.

pub mod incoming;
pub mod outgoing;
pub mod secure;

use std::sync::Arc;

use parley_proto::Fingerprint;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::gateway::{GatewayClient, GatewayError};
use crate::otr::OtrError;
use crate::rtc::{PeerConnectionFactory, RtcError};

pub use incoming::{IncomingPeerRequest, IncomingPeerRequests, IncomingState};
pub use outgoing::{OutgoingPeerRequest, OutgoingState};
pub use secure::SecureChannel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerRequestError {
    #[error("cannot {action} a request that is {state}")]
    InvalidStateTransition { action: &'static str, state: String },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Rtc(#[from] RtcError),
    #[error(transparent)]
    Otr(#[from] OtrError),
}

/// Moves `tx` to `next` unless the current state is terminal. Returns whether
/// the state changed.
pub(crate) fn advance<S>(tx: &watch::Sender<S>, next: S, is_terminal: impl Fn(&S) -> bool) -> bool
where
    S: PartialEq,
{
    tx.send_if_modified(|state| {
        if *state == next || is_terminal(state) {
            return false;
        }
        *state = next;
        true
    })
}

/// Entry point for peer requests over one gateway session.
#[derive(Clone)]
pub struct PeerConnector {
    gateway: GatewayClient,
    factory: Arc<dyn PeerConnectionFactory>,
    config: Arc<ClientConfig>,
}

impl PeerConnector {
    pub fn new(
        gateway: GatewayClient,
        factory: Arc<dyn PeerConnectionFactory>,
        config: ClientConfig,
    ) -> Self {
        Self {
            gateway,
            factory,
            config: Arc::new(config),
        }
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends a peer request to `peer`.
    pub async fn request(&self, peer: Fingerprint) -> Result<OutgoingPeerRequest, PeerRequestError> {
        outgoing::start(self.clone(), peer).await
    }

    /// Starts listening for requests addressed to us. Requests that arrive
    /// before this call are not seen.
    pub fn incoming(&self) -> IncomingPeerRequests {
        incoming::listen(self.clone())
    }
}
