//! Post-exchange key state and the data-message ratchet.
//!
//! Each side keeps its current and previous DH key and the peer's current
//! and previous public key, giving up to four session keys. A message names
//! the pair it was sealed under by key id. Receiving a message addressed to
//! our current key retires our previous one; receiving a new `next_dh` from
//! the peer's current key retires theirs. Receive MAC keys that were used
//! are published on our next send once their pair is retired.

use std::mem;

use rand::rngs::OsRng;
use tracing::trace;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::OtrError;
use super::ake::{AkeOutcome, shared_secret};
use super::crypto::{AES_KEY_LEN, MAC_LEN, aes_ctr, h2, hmac, hmac_verify, sha256};
use super::messages::{DH_PUBLIC_LEN, DataInner, DataMessage, OtrMessage};

const CURRENT: usize = 0;
const PREVIOUS: usize = 1;

struct DhKeyPair {
    keyid: u32,
    secret: StaticSecret,
    public: [u8; DH_PUBLIC_LEN],
}

impl DhKeyPair {
    fn generate(keyid: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        DhKeyPair {
            keyid,
            secret,
            public,
        }
    }
}

#[derive(Clone, Copy)]
struct PeerKey {
    keyid: u32,
    public: [u8; DH_PUBLIC_LEN],
}

/// One direction of a session key.
struct HalfKeyState {
    aes: [u8; AES_KEY_LEN],
    mac: [u8; MAC_LEN],
    counter: u64,
    mac_used: bool,
}

impl HalfKeyState {
    fn derive(byte: u8, shared: &[u8; 32]) -> Self {
        let mut full = h2(byte, shared);
        let mut aes = [0u8; AES_KEY_LEN];
        aes.copy_from_slice(&full[..AES_KEY_LEN]);
        full.zeroize();
        HalfKeyState {
            mac: sha256(&aes),
            aes,
            counter: 0,
            mac_used: false,
        }
    }
}

impl Drop for HalfKeyState {
    fn drop(&mut self) {
        self.aes.zeroize();
        self.mac.zeroize();
    }
}

struct SessionKeyState {
    send: HalfKeyState,
    recv: HalfKeyState,
}

impl SessionKeyState {
    fn derive(mine: &DhKeyPair, theirs: &PeerKey) -> Result<Self, OtrError> {
        let mut shared = shared_secret(&mine.secret, &theirs.public)?;
        // The side with the larger public key sends under byte 1.
        let (send, recv) = if mine.public > theirs.public {
            (1, 2)
        } else {
            (2, 1)
        };
        let keys = SessionKeyState {
            send: HalfKeyState::derive(send, &shared),
            recv: HalfKeyState::derive(recv, &shared),
        };
        shared.zeroize();
        Ok(keys)
    }
}

type Sessions = [[Option<SessionKeyState>; 2]; 2];

pub struct KeyState {
    ssid: [u8; 8],
    my_current: DhKeyPair,
    my_previous: DhKeyPair,
    peer_current: PeerKey,
    peer_previous: Option<PeerKey>,
    /// Indexed `[mine][theirs]` by `CURRENT`/`PREVIOUS`.
    sessions: Sessions,
    saved_mac_keys: Vec<[u8; MAC_LEN]>,
}

impl KeyState {
    pub fn from_ake(outcome: AkeOutcome) -> Result<Self, OtrError> {
        let my_previous = DhKeyPair {
            keyid: outcome.our_keyid,
            secret: outcome.our_secret,
            public: outcome.our_public,
        };
        let my_current = DhKeyPair::generate(outcome.our_keyid + 1);
        let peer_current = PeerKey {
            keyid: outcome.their_keyid,
            public: outcome.their_public,
        };
        let mut sessions: Sessions = Default::default();
        sessions[CURRENT][CURRENT] = Some(SessionKeyState::derive(&my_current, &peer_current)?);
        sessions[PREVIOUS][CURRENT] = Some(SessionKeyState::derive(&my_previous, &peer_current)?);
        Ok(KeyState {
            ssid: outcome.ssid,
            my_current,
            my_previous,
            peer_current,
            peer_previous: None,
            sessions,
            saved_mac_keys: Vec::new(),
        })
    }

    pub fn ssid(&self) -> [u8; 8] {
        self.ssid
    }

    pub fn my_keyid(&self) -> u32 {
        self.my_current.keyid
    }

    pub fn peer_keyid(&self) -> u32 {
        self.peer_current.keyid
    }

    pub fn peer_previous_keyid(&self) -> Option<u32> {
        self.peer_previous.map(|key| key.keyid)
    }

    pub fn saved_mac_key_count(&self) -> usize {
        self.saved_mac_keys.len()
    }

    /// Seals `plaintext` into an encoded DATA frame.
    ///
    /// Messages go out under our previous key, which the peer is known to
    /// hold, and advertise our current key as `next_dh`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, OtrError> {
        let session = self.sessions[PREVIOUS][CURRENT]
            .as_mut()
            .ok_or_else(|| OtrError::Protocol("no session key for sending".into()))?;
        session.send.counter += 1;
        let counter = session.send.counter.to_be_bytes();
        let inner = DataInner {
            sender_keyid: self.my_previous.keyid,
            recipient_keyid: self.peer_current.keyid,
            next_dh: self.my_current.public,
            counter,
            ciphertext: aes_ctr(&session.send.aes, counter, plaintext),
        }
        .encode()?;
        let mac = hmac(&session.send.mac, &[inner.as_slice()])?;

        let revealed_mac_keys = self.saved_mac_keys.concat();
        let frame = OtrMessage::Data(DataMessage {
            inner,
            mac,
            revealed_mac_keys,
        })
        .encode()?;
        for key in &mut self.saved_mac_keys {
            key.zeroize();
        }
        self.saved_mac_keys.clear();
        Ok(frame)
    }

    /// Authenticates and opens a DATA message, ratcheting as it directs.
    pub fn decrypt(&mut self, message: &DataMessage) -> Result<Vec<u8>, OtrError> {
        let inner = DataInner::decode(&message.inner)?;
        let mine = if inner.recipient_keyid == self.my_current.keyid {
            CURRENT
        } else if inner.recipient_keyid == self.my_previous.keyid {
            PREVIOUS
        } else {
            return Err(OtrError::Protocol(format!(
                "unknown recipient key id {}",
                inner.recipient_keyid
            )));
        };
        let theirs = if inner.sender_keyid == self.peer_current.keyid {
            CURRENT
        } else if self.peer_previous.map(|key| key.keyid) == Some(inner.sender_keyid) {
            PREVIOUS
        } else {
            return Err(OtrError::Protocol(format!(
                "unknown sender key id {}",
                inner.sender_keyid
            )));
        };

        let session = self.sessions[mine][theirs]
            .as_mut()
            .ok_or_else(|| OtrError::Protocol("no session key for message".into()))?;
        hmac_verify(&session.recv.mac, &[message.inner.as_slice()], &message.mac)?;
        let counter = u64::from_be_bytes(inner.counter);
        if counter <= session.recv.counter {
            return Err(OtrError::Replay { counter });
        }
        session.recv.counter = counter;
        session.recv.mac_used = true;
        let plaintext = aes_ctr(&session.recv.aes, inner.counter, &inner.ciphertext);

        trace!(
            target = "otr",
            sender_keyid = inner.sender_keyid,
            recipient_keyid = inner.recipient_keyid,
            counter,
            revealed = message.revealed_keys().count(),
            "opened data message"
        );

        if mine == CURRENT {
            self.rotate_mine()?;
        }
        if theirs == CURRENT && inner.next_dh != self.peer_current.public {
            self.rotate_peer(inner.next_dh)?;
        }
        Ok(plaintext)
    }

    fn retire(&mut self, session: Option<SessionKeyState>) {
        if let Some(session) = session {
            if session.recv.mac_used {
                self.saved_mac_keys.push(session.recv.mac);
            }
        }
    }

    fn rotate_mine(&mut self) -> Result<(), OtrError> {
        let next = DhKeyPair::generate(self.my_current.keyid + 1);
        let with_current = SessionKeyState::derive(&next, &self.peer_current)?;
        let with_previous = match &self.peer_previous {
            Some(peer) => Some(SessionKeyState::derive(&next, peer)?),
            None => None,
        };

        let retired = mem::take(&mut self.sessions[PREVIOUS]);
        for session in retired {
            self.retire(session);
        }
        self.sessions[PREVIOUS] = mem::take(&mut self.sessions[CURRENT]);
        self.sessions[CURRENT] = [Some(with_current), with_previous];
        self.my_previous = mem::replace(&mut self.my_current, next);
        Ok(())
    }

    fn rotate_peer(&mut self, next_dh: [u8; DH_PUBLIC_LEN]) -> Result<(), OtrError> {
        let next = PeerKey {
            keyid: self.peer_current.keyid + 1,
            public: next_dh,
        };
        let with_current = SessionKeyState::derive(&self.my_current, &next)?;
        let with_previous = SessionKeyState::derive(&self.my_previous, &next)?;

        for mine in [CURRENT, PREVIOUS] {
            let retired = self.sessions[mine][PREVIOUS].take();
            self.retire(retired);
            self.sessions[mine][PREVIOUS] = self.sessions[mine][CURRENT].take();
        }
        self.sessions[CURRENT][CURRENT] = Some(with_current);
        self.sessions[PREVIOUS][CURRENT] = Some(with_previous);
        self.peer_previous = Some(mem::replace(&mut self.peer_current, next));
        Ok(())
    }
}

impl Drop for KeyState {
    fn drop(&mut self) {
        for key in &mut self.saved_mac_keys {
            key.zeroize();
        }
    }
}
