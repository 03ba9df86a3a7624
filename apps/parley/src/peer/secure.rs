use std::sync::Arc;

use parley_proto::{Fingerprint, Identity, PersonalIdentity};
use tokio::sync::watch;

use super::PeerRequestError;
use crate::otr::{OtrConfig, OtrError, OtrSession, OtrState, OtrTransport, Role};
use crate::rtc::RtcChannel;

/// An OTR session running over a connected RTC channel.
#[derive(Clone)]
pub struct SecureChannel {
    rtc: RtcChannel,
    otr: OtrSession,
}

impl SecureChannel {
    /// Waits for `rtc` to connect, then runs the key exchange over it.
    pub async fn establish(
        rtc: RtcChannel,
        identity: &PersonalIdentity,
        expected_peer: Fingerprint,
        role: Role,
        config: OtrConfig,
    ) -> Result<Self, PeerRequestError> {
        rtc.wait_connected().await?;
        let transport: Arc<dyn OtrTransport> = Arc::new(rtc.clone());
        let otr = OtrSession::establish(transport, identity, expected_peer, role, config).await?;
        Ok(Self { rtc, otr })
    }

    pub async fn send(&self, plaintext: &[u8]) -> Result<(), OtrError> {
        self.otr.send(plaintext).await
    }

    pub async fn recv(&self) -> Result<Vec<u8>, OtrError> {
        self.otr.recv().await
    }

    pub fn state(&self) -> OtrState {
        self.otr.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<OtrState> {
        self.otr.state_changes()
    }

    /// The authenticated peer identity.
    pub fn peer(&self) -> Option<Identity> {
        self.otr.peer()
    }

    pub fn rtc(&self) -> &RtcChannel {
        &self.rtc
    }

    pub fn session(&self) -> &OtrSession {
        &self.otr
    }

    /// Closes the session, and with it the RTC channel.
    pub async fn close(&self) {
        self.otr.close().await;
    }
}
