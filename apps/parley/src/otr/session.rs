use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use parley_proto::{Fingerprint, Identity, PersonalIdentity};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ake::{AkeInitiator, AkeOutcome, AkeResponder};
use super::keys::KeyState;
use super::messages::OtrMessage;
use super::transport::{LinkState, OtrTransport};
use super::{OtrError, OtrState};
use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends DH_COMMIT; the side that requested the peer connection.
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
pub struct OtrConfig {
    pub ake_timeout: Duration,
}

impl Default for OtrConfig {
    fn default() -> Self {
        Self {
            ake_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ClientConfig> for OtrConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ake_timeout: config.ake_timeout,
        }
    }
}

struct SessionInner {
    transport: Arc<dyn OtrTransport>,
    config: OtrConfig,
    /// Held across encrypt and send so counters reach the wire in order.
    keys: AsyncMutex<Option<KeyState>>,
    state_tx: watch::Sender<OtrState>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    last_error: Mutex<Option<OtrError>>,
    peer: Mutex<Option<Identity>>,
    ssid: Mutex<Option<[u8; 8]>>,
    cancel: CancellationToken,
}

impl SessionInner {
    fn state(&self) -> OtrState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: OtrState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next || *state == OtrState::Closed {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(target = "otr", state = ?next, "otr session state");
        }
        changed
    }

    /// Records the first failure as the close reason, then closes.
    async fn fail(&self, err: OtrError) {
        warn!(target = "otr", kind = ?err.kind(), error = %err, "otr session failed");
        self.last_error.lock().get_or_insert(err);
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let first = self.set_state(OtrState::Closed);
        self.cancel.cancel();
        self.incoming_tx.lock().take();
        if first {
            self.transport.close().await;
        }
    }

    async fn next_message(&self) -> Result<OtrMessage, OtrError> {
        let frame = self.transport.recv().await.ok_or(OtrError::Closed)?;
        OtrMessage::decode(&frame)
    }

    async fn send_message(&self, message: &OtrMessage) -> Result<(), OtrError> {
        self.transport.send(message.encode()?).await
    }

    async fn run_ake(
        &self,
        identity: &PersonalIdentity,
        expected_peer: &Fingerprint,
        role: Role,
    ) -> Result<AkeOutcome, OtrError> {
        match role {
            Role::Initiator => {
                let (initiator, commit) = AkeInitiator::start();
                self.send_message(&commit).await?;
                let (awaiting, reveal) = initiator.on_dh_key(identity, self.next_message().await?)?;
                self.send_message(&reveal).await?;
                awaiting.on_signature(expected_peer, self.next_message().await?)
            }
            Role::Responder => {
                let (responder, dh_key) = AkeResponder::on_dh_commit(self.next_message().await?)?;
                self.send_message(&dh_key).await?;
                let (signature, outcome) = responder.on_reveal_signature(
                    identity,
                    expected_peer,
                    self.next_message().await?,
                )?;
                self.send_message(&signature).await?;
                Ok(outcome)
            }
        }
    }

    async fn open_frame(&self, frame: &[u8]) -> Result<Vec<u8>, OtrError> {
        let data = match OtrMessage::decode(frame)? {
            OtrMessage::Data(data) => data,
            other => {
                return Err(OtrError::Protocol(format!(
                    "unexpected {:?} after key exchange",
                    other.message_type()
                )));
            }
        };
        let mut keys = self.keys.lock().await;
        let keys = keys.as_mut().ok_or(OtrError::Closed)?;
        keys.decrypt(&data)
    }
}

/// An authenticated, encrypted session with one peer.
#[derive(Clone)]
pub struct OtrSession {
    inner: Arc<SessionInner>,
}

impl OtrSession {
    pub fn new(transport: Arc<dyn OtrTransport>, config: OtrConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(OtrState::Connecting);
        Self {
            inner: Arc::new(SessionInner {
                transport,
                config,
                keys: AsyncMutex::new(None),
                state_tx,
                incoming: AsyncMutex::new(incoming_rx),
                incoming_tx: Mutex::new(Some(incoming_tx)),
                last_error: Mutex::new(None),
                peer: Mutex::new(None),
                ssid: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Creates a session and completes the key exchange on it.
    pub async fn establish(
        transport: Arc<dyn OtrTransport>,
        identity: &PersonalIdentity,
        expected_peer: Fingerprint,
        role: Role,
        config: OtrConfig,
    ) -> Result<Self, OtrError> {
        let session = Self::new(transport, config);
        session.handshake(identity, expected_peer, role).await?;
        Ok(session)
    }

    /// Runs the key exchange. The transport must already be up. Any failure
    /// closes the session.
    pub async fn handshake(
        &self,
        identity: &PersonalIdentity,
        expected_peer: Fingerprint,
        role: Role,
    ) -> Result<(), OtrError> {
        let inner = &self.inner;
        if inner.state() != OtrState::Connecting {
            return Err(OtrError::Protocol("key exchange already attempted".into()));
        }
        if inner.transport.link_state() != LinkState::Up {
            return Err(OtrError::Transport("transport is not connected".into()));
        }
        inner.set_state(OtrState::Authenticating);
        debug!(target = "otr", role = ?role, peer = %expected_peer.short(), "starting key exchange");

        let result = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => Err(OtrError::Closed),
            result = tokio::time::timeout(
                inner.config.ake_timeout,
                inner.run_ake(identity, &expected_peer, role),
            ) => result.unwrap_or(Err(OtrError::Timeout("key exchange"))),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                inner.fail(err.clone()).await;
                return Err(err);
            }
        };

        *inner.ssid.lock() = Some(outcome.ssid);
        *inner.peer.lock() = Some(outcome.peer.clone());
        let keys = match KeyState::from_ake(outcome) {
            Ok(keys) => keys,
            Err(err) => {
                inner.fail(err.clone()).await;
                return Err(err);
            }
        };
        *inner.keys.lock().await = Some(keys);

        let Some(incoming_tx) = inner.incoming_tx.lock().clone() else {
            return Err(OtrError::Closed);
        };
        if !inner.set_state(OtrState::Connected) {
            return Err(OtrError::Closed);
        }
        tokio::spawn(drive(inner.clone(), incoming_tx));
        Ok(())
    }

    pub fn state(&self) -> OtrState {
        self.inner.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<OtrState> {
        self.inner.state_tx.subscribe()
    }

    /// Why the session closed, if it closed on an error.
    pub fn last_error(&self) -> Option<OtrError> {
        self.inner.last_error.lock().clone()
    }

    pub fn ssid(&self) -> Option<[u8; 8]> {
        *self.inner.ssid.lock()
    }

    /// The authenticated peer, once the exchange has completed.
    pub fn peer(&self) -> Option<Identity> {
        self.inner.peer.lock().clone()
    }

    pub async fn send(&self, plaintext: &[u8]) -> Result<(), OtrError> {
        match self.state() {
            OtrState::Connected => {}
            OtrState::Closed => return Err(OtrError::Closed),
            other => {
                return Err(OtrError::Transport(format!("session is {other:?}")));
            }
        }
        let mut keys = self.inner.keys.lock().await;
        let keys = keys.as_mut().ok_or(OtrError::Closed)?;
        let frame = keys.encrypt(plaintext)?;
        self.inner.transport.send(frame).await
    }

    /// Next decrypted payload. Once closed, returns the close reason.
    pub async fn recv(&self) -> Result<Vec<u8>, OtrError> {
        let next = self.inner.incoming.lock().await.recv().await;
        next.ok_or_else(|| self.last_error().unwrap_or(OtrError::Closed))
    }

    pub async fn close(&self) {
        self.inner.shutdown().await;
    }
}

/// Decrypts inbound frames and mirrors link state until the session ends.
async fn drive(inner: Arc<SessionInner>, incoming_tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut links = inner.transport.link_changes();
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            frame = inner.transport.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                match inner.open_frame(&frame).await {
                    Ok(plaintext) => {
                        if incoming_tx.send(plaintext).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        inner.fail(err).await;
                        return;
                    }
                }
            }
            link = links.next() => match link {
                Some(LinkState::Up) => {
                    if inner.state() == OtrState::Disconnected {
                        inner.set_state(OtrState::Connected);
                    }
                }
                Some(LinkState::Down) => {
                    if inner.state() == OtrState::Connected {
                        inner.set_state(OtrState::Disconnected);
                    }
                }
                Some(LinkState::Closed) | None => break,
            },
        }
    }
    drop(incoming_tx);
    inner.shutdown().await;
}

#[cfg(test)]
mod tests {
    use test_timeout::tokio_timeout_test;

    use super::*;
    use crate::otr::ErrorKind;
    use crate::otr::transport::memory::{MemoryTransport, transport_pair};

    fn config() -> OtrConfig {
        OtrConfig {
            ake_timeout: Duration::from_secs(5),
        }
    }

    async fn connected_pair() -> (OtrSession, OtrSession, Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let (a_link, b_link) = transport_pair();
        let (a, b) = tokio::join!(
            OtrSession::establish(a_link.clone(), &alice, bob.fingerprint(), Role::Initiator, config()),
            OtrSession::establish(b_link.clone(), &bob, alice.fingerprint(), Role::Responder, config()),
        );
        (a.unwrap(), b.unwrap(), a_link, b_link)
    }

    #[tokio_timeout_test(10)]
    async fn sessions_converge_and_exchange_messages() {
        let (alice, bob, _, _) = connected_pair().await;
        assert_eq!(alice.state(), OtrState::Connected);
        assert_eq!(bob.state(), OtrState::Connected);
        assert!(alice.ssid().is_some());
        assert_eq!(alice.ssid(), bob.ssid());

        alice.send(b"hello").await.unwrap();
        assert_eq!(bob.recv().await.unwrap(), b"hello");
        bob.send(b"hi alice").await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), b"hi alice");
    }

    #[tokio_timeout_test(10)]
    async fn replayed_frame_closes_the_receiver() {
        let (alice, bob, a_link, _) = connected_pair().await;
        alice.send(b"first").await.unwrap();
        alice.send(b"second").await.unwrap();
        assert_eq!(bob.recv().await.unwrap(), b"first");
        assert_eq!(bob.recv().await.unwrap(), b"second");

        // Frames 0 and 1 are DH_COMMIT and REVEAL_SIGNATURE.
        let first = a_link.sent.lock()[2].clone();
        a_link.inject_to_peer(first);

        assert_eq!(bob.recv().await.err(), Some(OtrError::Replay { counter: 1 }));
        assert_eq!(bob.state(), OtrState::Closed);
        assert_eq!(bob.last_error().map(|err| err.kind()), Some(ErrorKind::Replay));
    }

    #[tokio_timeout_test(10)]
    async fn key_exchange_times_out_without_a_peer() {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let (a_link, _b_link) = transport_pair();
        let result = OtrSession::establish(
            a_link,
            &alice,
            bob.fingerprint(),
            Role::Initiator,
            OtrConfig {
                ake_timeout: Duration::from_millis(100),
            },
        )
        .await;
        assert_eq!(result.err(), Some(OtrError::Timeout("key exchange")));
    }

    #[tokio_timeout_test(10)]
    async fn unexpected_peer_fails_verification() {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let carol = PersonalIdentity::generate();
        let (a_link, b_link) = transport_pair();
        let (a, b) = tokio::join!(
            OtrSession::establish(a_link, &alice, bob.fingerprint(), Role::Initiator, config()),
            OtrSession::establish(b_link, &bob, carol.fingerprint(), Role::Responder, config()),
        );
        assert_eq!(
            b.err().map(|err| err.kind()),
            Some(ErrorKind::CryptoVerificationFailure)
        );
        assert!(a.is_err());
    }

    #[tokio_timeout_test(10)]
    async fn link_loss_is_mirrored_as_disconnected() {
        let (alice, _bob, a_link, _) = connected_pair().await;
        let mut states = alice.state_changes();

        a_link.set_link(LinkState::Down);
        states
            .wait_for(|state| *state == OtrState::Disconnected)
            .await
            .unwrap();

        a_link.set_link(LinkState::Up);
        states
            .wait_for(|state| *state == OtrState::Connected)
            .await
            .unwrap();
    }

    #[tokio_timeout_test(10)]
    async fn handshake_requires_a_connected_link() {
        let alice = PersonalIdentity::generate();
        let (a_link, _b_link) = transport_pair();
        a_link.set_link(LinkState::Down);
        let session = OtrSession::new(a_link, config());
        let result = session
            .handshake(&alice, alice.fingerprint(), Role::Initiator)
            .await;
        assert!(matches!(result, Err(OtrError::Transport(_))));
        assert_eq!(session.state(), OtrState::Connecting);
    }
}
