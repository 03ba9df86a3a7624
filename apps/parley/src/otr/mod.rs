//! Off-the-record style session engine.
//!
//! A four message authenticated key exchange binds a fresh Diffie-Hellman
//! secret to both parties' long-term signing identities. Afterwards every
//! payload is encrypted with AES-128-CTR and authenticated with HMAC-SHA256
//! under keys that ratchet forward as each side acknowledges the other's
//! newest DH key. Retired MAC keys are published so transcripts stay
//! deniable.
//!
//! The key exchange ([`ake`]) and the ratchet ([`keys`]) are synchronous
//! state machines; [`OtrSession`] drives them over an [`OtrTransport`].

pub mod ake;
pub mod crypto;
pub mod keys;
pub mod messages;
pub mod session;
pub mod transport;

use parley_proto::WireError;
use thiserror::Error;

pub use ake::{AkeInitiator, AkeOutcome, AkeResponder};
pub use keys::KeyState;
pub use messages::OtrMessage;
pub use session::{OtrConfig, OtrSession, Role};
pub use transport::{LinkState, OtrTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtrState {
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
    Closed,
}

/// Coarse classification of [`OtrError`], used for close reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolViolation,
    CryptoVerificationFailure,
    Timeout,
    Replay,
    TransientNetwork,
    SocketClosed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtrError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("replayed or reordered message (counter {counter})")]
    Replay { counter: u64 },
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
}

impl OtrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OtrError::Protocol(_) | OtrError::Wire(_) => ErrorKind::ProtocolViolation,
            OtrError::Verification(_) => ErrorKind::CryptoVerificationFailure,
            OtrError::Replay { .. } => ErrorKind::Replay,
            OtrError::Timeout(_) => ErrorKind::Timeout,
            OtrError::Transport(_) => ErrorKind::TransientNetwork,
            OtrError::Closed => ErrorKind::SocketClosed,
        }
    }
}
