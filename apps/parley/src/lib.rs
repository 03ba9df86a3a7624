pub mod config;
pub mod gateway;
pub mod otr;
pub mod peer;
pub mod rtc;
pub mod telemetry;

pub use config::ClientConfig;
pub use gateway::{GatewayClient, GatewayError, GatewayState};
pub use otr::{OtrError, OtrSession, OtrState};
pub use peer::{
    IncomingPeerRequest, IncomingState, OutgoingPeerRequest, OutgoingState, PeerConnector,
    PeerRequestError, SecureChannel,
};
pub use rtc::{RtcChannel, RtcConfig, RtcError, RtcState};
