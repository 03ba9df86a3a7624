//! Authenticated key exchange.
//!
//! ```text
//! initiator                               responder
//!    DH_COMMIT { AES_r(gx), SHA256(gx) } ->
//!                                      <- DH_KEY { gy }
//!    REVEAL_SIGNATURE { r, Enc_c(sig), MAC_m2 } ->
//!                                      <- SIGNATURE { Enc_c'(sig'), MAC_m2' }
//! ```
//!
//! Each step consumes the previous state, so a message can only be handled
//! in the state that expects it.

use parley_proto::{Fingerprint, Identity, PersonalIdentity, SignatureContext};
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::OtrError;
use super::crypto::{aes_ctr, h2, hmac, hmac_verify, sha256};
use super::messages::{DH_PUBLIC_LEN, OtrMessage, REVEAL_KEY_LEN, SignatureBlock};

/// Key id of the DH key used during the exchange. Data keys start after it.
pub const AKE_KEYID: u32 = 1;

const ZERO_COUNTER: [u8; 8] = [0; 8];

/// Result of a completed exchange, consumed by the data ratchet.
pub struct AkeOutcome {
    pub ssid: [u8; 8],
    pub our_secret: StaticSecret,
    pub our_public: [u8; DH_PUBLIC_LEN],
    pub our_keyid: u32,
    pub their_public: [u8; DH_PUBLIC_LEN],
    pub their_keyid: u32,
    pub peer: Identity,
}

struct DhKey {
    secret: StaticSecret,
    public: [u8; DH_PUBLIC_LEN],
}

impl DhKey {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        DhKey { secret, public }
    }
}

/// X25519 agreement, refusing low-order peer keys.
pub(crate) fn shared_secret(
    secret: &StaticSecret,
    their_public: &[u8; DH_PUBLIC_LEN],
) -> Result<[u8; 32], OtrError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(OtrError::Verification("degenerate dh public key".into()));
    }
    Ok(*shared.as_bytes())
}

/// Keys expanded from the exchange secret. The primed halves belong to the
/// responder's signature.
struct Expansion {
    ssid: [u8; 8],
    c: [u8; 16],
    c_prime: [u8; 16],
    m1: [u8; 32],
    m2: [u8; 32],
    m1_prime: [u8; 32],
    m2_prime: [u8; 32],
}

impl Expansion {
    fn derive(mut shared: [u8; 32]) -> Self {
        let mut ssid = [0u8; 8];
        ssid.copy_from_slice(&h2(0, &shared)[..8]);
        let mut both = h2(1, &shared);
        let mut c = [0u8; 16];
        let mut c_prime = [0u8; 16];
        c.copy_from_slice(&both[..16]);
        c_prime.copy_from_slice(&both[16..]);
        both.zeroize();
        let expansion = Expansion {
            ssid,
            c,
            c_prime,
            m1: h2(2, &shared),
            m2: h2(3, &shared),
            m1_prime: h2(4, &shared),
            m2_prime: h2(5, &shared),
        };
        shared.zeroize();
        expansion
    }

    fn initiator(&self) -> SealKeys<'_> {
        SealKeys {
            c: &self.c,
            m1: &self.m1,
            m2: &self.m2,
        }
    }

    fn responder(&self) -> SealKeys<'_> {
        SealKeys {
            c: &self.c_prime,
            m1: &self.m1_prime,
            m2: &self.m2_prime,
        }
    }
}

impl Drop for Expansion {
    fn drop(&mut self) {
        self.c.zeroize();
        self.c_prime.zeroize();
        self.m1.zeroize();
        self.m2.zeroize();
        self.m1_prime.zeroize();
        self.m2_prime.zeroize();
    }
}

struct SealKeys<'a> {
    c: &'a [u8; 16],
    m1: &'a [u8; 32],
    m2: &'a [u8; 32],
}

impl SealKeys<'_> {
    fn transcript(
        &self,
        sender_dh: &[u8; DH_PUBLIC_LEN],
        receiver_dh: &[u8; DH_PUBLIC_LEN],
        public_key: &[u8],
        keyid: u32,
    ) -> Result<[u8; 32], OtrError> {
        hmac(
            self.m1,
            &[
                sender_dh.as_slice(),
                receiver_dh.as_slice(),
                public_key,
                &keyid.to_be_bytes(),
            ],
        )
    }

    /// Signs the transcript and returns `(Enc_c(block), MAC_m2(Enc_c(block)))`.
    fn seal(
        &self,
        identity: &PersonalIdentity,
        own_dh: &[u8; DH_PUBLIC_LEN],
        their_dh: &[u8; DH_PUBLIC_LEN],
    ) -> Result<(Vec<u8>, [u8; 32]), OtrError> {
        let public_key = identity.public_key_bytes();
        let transcript = self.transcript(own_dh, their_dh, &public_key, AKE_KEYID)?;
        let block = SignatureBlock {
            public_key,
            keyid: AKE_KEYID,
            signature: identity.sign(SignatureContext::OtrTranscript, &transcript),
        };
        let encrypted = aes_ctr(self.c, ZERO_COUNTER, &block.encode()?);
        let mac = hmac(self.m2, &[encrypted.as_slice()])?;
        Ok((encrypted, mac))
    }

    /// Checks the MAC, then the sender's identity and transcript signature.
    fn open(
        &self,
        expected_peer: &Fingerprint,
        sender_dh: &[u8; DH_PUBLIC_LEN],
        own_dh: &[u8; DH_PUBLIC_LEN],
        encrypted: &[u8],
        mac: &[u8],
    ) -> Result<(Identity, u32), OtrError> {
        hmac_verify(self.m2, &[encrypted], mac)?;
        let block = SignatureBlock::decode(&aes_ctr(self.c, ZERO_COUNTER, encrypted))?;
        let peer = Identity::from_bytes(&block.public_key)
            .map_err(|err| OtrError::Verification(err.to_string()))?;
        if peer.fingerprint() != *expected_peer {
            return Err(OtrError::Verification(format!(
                "expected peer {}, got {}",
                expected_peer.short(),
                peer.fingerprint().short()
            )));
        }
        if block.keyid == 0 {
            return Err(OtrError::Protocol("key id 0 is reserved".into()));
        }
        let transcript = self.transcript(sender_dh, own_dh, &block.public_key, block.keyid)?;
        peer.verify(SignatureContext::OtrTranscript, &transcript, &block.signature)
            .map_err(|err| OtrError::Verification(err.to_string()))?;
        Ok((peer, block.keyid))
    }
}

fn unexpected(expected: &str, got: &OtrMessage) -> OtrError {
    OtrError::Protocol(format!(
        "expected {expected}, got {:?}",
        got.message_type()
    ))
}

/// Initiator waiting for `DH_KEY`.
pub struct AkeInitiator {
    dh: DhKey,
    r: [u8; REVEAL_KEY_LEN],
}

impl AkeInitiator {
    pub fn start() -> (Self, OtrMessage) {
        let dh = DhKey::generate();
        let mut r = [0u8; REVEAL_KEY_LEN];
        OsRng.fill_bytes(&mut r);
        let commit = OtrMessage::DhCommit {
            encrypted_gx: aes_ctr(&r, ZERO_COUNTER, &dh.public),
            hashed_gx: sha256(&dh.public),
        };
        (AkeInitiator { dh, r }, commit)
    }

    pub fn on_dh_key(
        self,
        identity: &PersonalIdentity,
        message: OtrMessage,
    ) -> Result<(AwaitingSignature, OtrMessage), OtrError> {
        let gy = match message {
            OtrMessage::DhKey { gy } => gy,
            other => return Err(unexpected("DH_KEY", &other)),
        };
        let keys = Expansion::derive(shared_secret(&self.dh.secret, &gy)?);
        let (encrypted_signature, mac) = keys.initiator().seal(identity, &self.dh.public, &gy)?;
        let reveal = OtrMessage::RevealSignature {
            r: self.r,
            encrypted_signature,
            mac,
        };
        Ok((
            AwaitingSignature {
                dh: self.dh,
                gy,
                keys,
            },
            reveal,
        ))
    }
}

/// Initiator waiting for the responder's `SIGNATURE`.
pub struct AwaitingSignature {
    dh: DhKey,
    gy: [u8; DH_PUBLIC_LEN],
    keys: Expansion,
}

impl AwaitingSignature {
    pub fn on_signature(
        self,
        expected_peer: &Fingerprint,
        message: OtrMessage,
    ) -> Result<AkeOutcome, OtrError> {
        let OtrMessage::Signature {
            encrypted_signature,
            mac,
        } = &message
        else {
            return Err(unexpected("SIGNATURE", &message));
        };
        let (peer, their_keyid) = self.keys.responder().open(
            expected_peer,
            &self.gy,
            &self.dh.public,
            encrypted_signature,
            mac,
        )?;
        Ok(AkeOutcome {
            ssid: self.keys.ssid,
            our_secret: self.dh.secret.clone(),
            our_public: self.dh.public,
            our_keyid: AKE_KEYID,
            their_public: self.gy,
            their_keyid,
            peer,
        })
    }
}

/// Responder holding the initiator's commitment.
pub struct AkeResponder {
    dh: DhKey,
    encrypted_gx: Vec<u8>,
    hashed_gx: [u8; 32],
}

impl AkeResponder {
    pub fn on_dh_commit(message: OtrMessage) -> Result<(Self, OtrMessage), OtrError> {
        let (encrypted_gx, hashed_gx) = match message {
            OtrMessage::DhCommit {
                encrypted_gx,
                hashed_gx,
            } => (encrypted_gx, hashed_gx),
            other => return Err(unexpected("DH_COMMIT", &other)),
        };
        let dh = DhKey::generate();
        let reply = OtrMessage::DhKey { gy: dh.public };
        Ok((
            AkeResponder {
                dh,
                encrypted_gx,
                hashed_gx,
            },
            reply,
        ))
    }

    pub fn on_reveal_signature(
        self,
        identity: &PersonalIdentity,
        expected_peer: &Fingerprint,
        message: OtrMessage,
    ) -> Result<(OtrMessage, AkeOutcome), OtrError> {
        let OtrMessage::RevealSignature {
            r,
            encrypted_signature,
            mac,
        } = &message
        else {
            return Err(unexpected("REVEAL_SIGNATURE", &message));
        };
        let gx: [u8; DH_PUBLIC_LEN] = aes_ctr(r, ZERO_COUNTER, &self.encrypted_gx)
            .try_into()
            .map_err(|_| OtrError::Protocol("committed dh key has the wrong length".into()))?;
        if sha256(&gx) != self.hashed_gx {
            return Err(OtrError::Verification("dh commitment mismatch".into()));
        }

        let keys = Expansion::derive(shared_secret(&self.dh.secret, &gx)?);
        let (peer, their_keyid) =
            keys.initiator()
                .open(expected_peer, &gx, &self.dh.public, encrypted_signature, mac)?;
        let (encrypted_signature, mac) = keys.responder().seal(identity, &self.dh.public, &gx)?;

        let outcome = AkeOutcome {
            ssid: keys.ssid,
            our_secret: self.dh.secret.clone(),
            our_public: self.dh.public,
            our_keyid: AKE_KEYID,
            their_public: gx,
            their_keyid,
            peer,
        };
        Ok((
            OtrMessage::Signature {
                encrypted_signature,
                mac,
            },
            outcome,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Runs a full exchange between two fresh identities.
    pub(crate) fn exchange(
        alice: &PersonalIdentity,
        bob: &PersonalIdentity,
    ) -> (AkeOutcome, AkeOutcome) {
        let (initiator, commit) = AkeInitiator::start();
        let (responder, dh_key) = AkeResponder::on_dh_commit(commit).unwrap();
        let (awaiting, reveal) = initiator.on_dh_key(alice, dh_key).unwrap();
        let (signature, bob_outcome) = responder
            .on_reveal_signature(bob, &alice.fingerprint(), reveal)
            .unwrap();
        let alice_outcome = awaiting.on_signature(&bob.fingerprint(), signature).unwrap();
        (alice_outcome, bob_outcome)
    }

    #[test]
    fn both_sides_agree_on_ssid_and_keys() {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let (a, b) = exchange(&alice, &bob);

        assert_eq!(a.ssid, b.ssid);
        assert_eq!(a.their_public, b.our_public);
        assert_eq!(b.their_public, a.our_public);
        assert_eq!(a.peer.fingerprint(), bob.fingerprint());
        assert_eq!(b.peer.fingerprint(), alice.fingerprint());
        assert_eq!(a.their_keyid, AKE_KEYID);
    }

    #[test]
    fn tampered_commitment_fails_the_responder() {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let (initiator, commit) = AkeInitiator::start();
        let OtrMessage::DhCommit {
            encrypted_gx,
            mut hashed_gx,
        } = commit
        else {
            panic!("expected DH_COMMIT");
        };
        hashed_gx[0] ^= 0xff;
        let (responder, dh_key) = AkeResponder::on_dh_commit(OtrMessage::DhCommit {
            encrypted_gx,
            hashed_gx,
        })
        .unwrap();
        let (_awaiting, reveal) = initiator.on_dh_key(&alice, dh_key).unwrap();

        let result = responder.on_reveal_signature(&bob, &alice.fingerprint(), reveal);
        assert!(matches!(result.err(), Some(OtrError::Verification(_))));
    }

    #[test]
    fn unexpected_peer_identity_is_rejected() {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let mallory = PersonalIdentity::generate();
        let (initiator, commit) = AkeInitiator::start();
        let (responder, dh_key) = AkeResponder::on_dh_commit(commit).unwrap();
        let (_awaiting, reveal) = initiator.on_dh_key(&mallory, dh_key).unwrap();

        let result = responder.on_reveal_signature(&bob, &alice.fingerprint(), reveal);
        assert!(matches!(result.err(), Some(OtrError::Verification(_))));
    }

    #[test]
    fn altered_signature_mac_is_rejected() {
        let alice = PersonalIdentity::generate();
        let bob = PersonalIdentity::generate();
        let (initiator, commit) = AkeInitiator::start();
        let (responder, dh_key) = AkeResponder::on_dh_commit(commit).unwrap();
        let (awaiting, reveal) = initiator.on_dh_key(&alice, dh_key).unwrap();
        let (signature, _) = responder
            .on_reveal_signature(&bob, &alice.fingerprint(), reveal)
            .unwrap();
        let OtrMessage::Signature {
            mut encrypted_signature,
            mac,
        } = signature
        else {
            panic!("expected SIGNATURE");
        };
        encrypted_signature[0] ^= 1;

        let result = awaiting.on_signature(
            &bob.fingerprint(),
            OtrMessage::Signature {
                encrypted_signature,
                mac,
            },
        );
        assert!(matches!(result.err(), Some(OtrError::Verification(_))));
    }

    #[test]
    fn out_of_order_message_is_a_protocol_error() {
        let alice = PersonalIdentity::generate();
        let (initiator, commit) = AkeInitiator::start();
        let result = initiator.on_dh_key(&alice, commit);
        assert!(matches!(result.err(), Some(OtrError::Protocol(_))));
    }
}
