//! Shared protocol definitions for parley clients and the parley gateway.

pub mod codec;
pub mod gateway;
pub mod identity;
pub mod keystore;

pub use codec::{FieldKind, Value, WireError};
pub use gateway::{ClientMessage, CloseCode, Envelope, IceCandidate, ServerMessage, SessionDescription, SdpKind};
pub use identity::{Fingerprint, Identity, IdentityError, PersonalIdentity, SignatureContext};
pub use keystore::WrappedIdentity;
