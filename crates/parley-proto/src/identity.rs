//! Long-term signing identities and their fingerprints.
//!
//! An [`Identity`] is the public half of an Ed25519 signing key. Its
//! [`Fingerprint`] is the leftmost 128 bits of SHA-256 over the raw 32-byte
//! public key and is what users share and what the gateway routes by.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid signature encoding ({0} bytes)")]
    InvalidSignature(usize),
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    #[error("identity wrapping failed: {0}")]
    Wrap(String),
    #[error("identity unwrap failed: {0}")]
    Unwrap(String),
}

/// Purpose a signature is produced for. Each context signs under its own
/// label, so a signature obtained in one context never verifies in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureContext {
    GatewayChallenge,
    OtrTranscript,
}

impl SignatureContext {
    fn label(self) -> &'static [u8] {
        match self {
            SignatureContext::GatewayChallenge => b"parley:gateway-challenge:v1",
            SignatureContext::OtrTranscript => b"parley:otr-transcript:v1",
        }
    }

    fn bind(self, message: &[u8]) -> Vec<u8> {
        let label = self.label();
        let mut out = Vec::with_capacity(label.len() + 1 + message.len());
        out.extend_from_slice(label);
        out.push(0);
        out.extend_from_slice(message);
        out
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn of_public_key(raw: &[u8]) -> Self {
        let digest = Sha256::digest(raw);
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Fingerprint(out)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|err| IdentityError::InvalidFingerprint(format!("{s:?}: {err}")))?;
        let raw: [u8; FINGERPRINT_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            IdentityError::InvalidFingerprint(format!(
                "expected {FINGERPRINT_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Fingerprint(raw))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Public signing key of a party.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    key: VerifyingKey,
    fingerprint: Fingerprint,
}

impl Identity {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; PUBLIC_KEY_LEN] = raw.try_into().map_err(|_| {
            IdentityError::InvalidPublicKey(format!(
                "expected {PUBLIC_KEY_LEN} bytes, got {}",
                raw.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| IdentityError::InvalidPublicKey(err.to_string()))?;
        Ok(Self::from_verifying_key(key))
    }

    fn from_verifying_key(key: VerifyingKey) -> Self {
        let fingerprint = Fingerprint::of_public_key(key.as_bytes());
        Identity { key, fingerprint }
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn verify(
        &self,
        context: SignatureContext,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), IdentityError> {
        let signature = Signature::from_slice(signature)
            .map_err(|_| IdentityError::InvalidSignature(signature.len()))?;
        self.key
            .verify_strict(&context.bind(message), &signature)
            .map_err(|_| IdentityError::VerificationFailed)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// The local user's signing identity, including the private key.
pub struct PersonalIdentity {
    signing: SigningKey,
    public: Identity,
}

impl PersonalIdentity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = Identity::from_verifying_key(signing.verifying_key());
        PersonalIdentity { signing, public }
    }

    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn identity(&self) -> &Identity {
        &self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn sign(&self, context: SignatureContext, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(&context.bind(message)).to_bytes()
    }
}

impl fmt::Debug for PersonalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonalIdentity")
            .field("fingerprint", &self.public.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_truncated_sha256_of_raw_key() {
        let me = PersonalIdentity::generate();
        let digest = Sha256::digest(me.public_key_bytes());
        assert_eq!(me.fingerprint().as_bytes(), &digest[..16]);

        let rendered = me.fingerprint().to_string();
        assert_eq!(rendered.len(), 32);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(rendered.parse::<Fingerprint>().unwrap(), me.fingerprint());
    }

    #[test]
    fn fingerprint_parse_rejects_wrong_length() {
        assert!("abcd".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(16).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn signatures_verify_only_in_their_context() {
        let me = PersonalIdentity::generate();
        let sig = me.sign(SignatureContext::GatewayChallenge, b"challenge");

        let public = Identity::from_bytes(&me.public_key_bytes()).unwrap();
        public
            .verify(SignatureContext::GatewayChallenge, b"challenge", &sig)
            .unwrap();
        assert!(matches!(
            public.verify(SignatureContext::OtrTranscript, b"challenge", &sig),
            Err(IdentityError::VerificationFailed)
        ));
        assert!(matches!(
            public.verify(SignatureContext::GatewayChallenge, b"challengf", &sig),
            Err(IdentityError::VerificationFailed)
        ));
        assert!(matches!(
            public.verify(SignatureContext::GatewayChallenge, b"challenge", &sig[..10]),
            Err(IdentityError::InvalidSignature(10))
        ));
    }

    #[test]
    fn other_keys_do_not_verify() {
        let me = PersonalIdentity::generate();
        let mallory = PersonalIdentity::generate();
        let sig = mallory.sign(SignatureContext::GatewayChallenge, b"nonce");
        assert!(me
            .identity()
            .verify(SignatureContext::GatewayChallenge, b"nonce", &sig)
            .is_err());
    }

    #[test]
    fn public_key_import_rejects_bad_length() {
        assert!(matches!(
            Identity::from_bytes(&[1, 2, 3]),
            Err(IdentityError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn fingerprint_serializes_as_hex_string() {
        let fp: Fingerprint = "00112233445566778899aabbccddeeff".parse().unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"00112233445566778899aabbccddeeff\"");
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
