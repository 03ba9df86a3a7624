//! Password-wrapped export of a [`PersonalIdentity`].
//!
//! The password is stretched with Argon2id, expanded with HKDF-SHA256 and the
//! secret key is sealed with ChaCha20-Poly1305. The recorded fingerprint is
//! bound as associated data so a wrapped blob cannot be relabelled.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::identity::{Fingerprint, IdentityError, PersonalIdentity};

pub const WRAP_FORMAT_VERSION: u32 = 1;
const HKDF_INFO_WRAP: &[u8] = b"parley:identity-wrap:v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Argon2id cost parameters stored alongside the wrapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedIdentity {
    pub version: u32,
    pub fingerprint: Fingerprint,
    pub kdf: KdfParams,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl WrappedIdentity {
    pub fn wrap(identity: &PersonalIdentity, password: &str) -> Result<Self, IdentityError> {
        Self::wrap_with_params(identity, password, KdfParams::default())
    }

    pub fn wrap_with_params(
        identity: &PersonalIdentity,
        password: &str,
        kdf: KdfParams,
    ) -> Result<Self, IdentityError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let fingerprint = identity.fingerprint();
        let key = derive_wrapping_key(password, &salt, kdf).map_err(IdentityError::Wrap)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|err| IdentityError::Wrap(format!("invalid key: {err}")))?;
        let secret = identity.secret_bytes();
        let aad = fingerprint.to_string();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &secret[..],
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|err| IdentityError::Wrap(format!("encrypt failed: {err}")))?;

        Ok(WrappedIdentity {
            version: WRAP_FORMAT_VERSION,
            fingerprint,
            kdf,
            salt: BASE64_STANDARD.encode(salt),
            nonce: BASE64_STANDARD.encode(nonce_bytes),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    pub fn unwrap_identity(&self, password: &str) -> Result<PersonalIdentity, IdentityError> {
        if self.version != WRAP_FORMAT_VERSION {
            return Err(IdentityError::Unwrap(format!(
                "unsupported wrap version {}",
                self.version
            )));
        }
        let salt = decode_field("salt", &self.salt)?;
        let nonce_bytes = decode_field("nonce", &self.nonce)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(IdentityError::Unwrap("unexpected nonce length".into()));
        }
        let ciphertext = decode_field("ciphertext", &self.ciphertext)?;

        let key = derive_wrapping_key(password, &salt, self.kdf).map_err(IdentityError::Unwrap)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|err| IdentityError::Unwrap(format!("invalid key: {err}")))?;
        let aad = self.fingerprint.to_string();
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce_bytes),
                    Payload {
                        msg: &ciphertext,
                        aad: aad.as_bytes(),
                    },
                )
                .map_err(|_| {
                    debug!(
                        target = "keystore",
                        identity = %self.fingerprint.short(),
                        "wrapped identity failed authentication"
                    );
                    IdentityError::Unwrap("wrong password or corrupted data".into())
                })?,
        );
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            plaintext
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::Unwrap("unexpected secret length".into()))?,
        );

        let identity = PersonalIdentity::from_secret_bytes(&secret);
        if identity.fingerprint() != self.fingerprint {
            warn!(
                target = "keystore",
                recorded = %self.fingerprint.short(),
                actual = %identity.fingerprint().short(),
                "wrapped identity does not match its recorded fingerprint"
            );
            return Err(IdentityError::Unwrap(
                "unwrapped key does not match recorded fingerprint".into(),
            ));
        }
        Ok(identity)
    }

    pub fn to_json(&self) -> Result<String, IdentityError> {
        serde_json::to_string_pretty(self).map_err(|err| IdentityError::Wrap(err.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, IdentityError> {
        serde_json::from_str(raw).map_err(|err| IdentityError::Unwrap(err.to_string()))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, IdentityError> {
    BASE64_STANDARD
        .decode(value.as_bytes())
        .map_err(|err| IdentityError::Unwrap(format!("invalid {name} encoding: {err}")))
}

fn derive_wrapping_key(
    password: &str,
    salt: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; 32]>, String> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|err| format!("invalid argon2 params: {err}"))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut stretched = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut stretched[..])
        .map_err(|err| format!("argon2 derive failed: {err}"))?;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), &stretched[..]);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(HKDF_INFO_WRAP, &mut key[..])
        .map_err(|err| format!("hkdf expand failed: {err}"))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SignatureContext;

    fn cheap() -> KdfParams {
        KdfParams {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn wrapped_identity_survives_json_and_signs_the_same() {
        let me = PersonalIdentity::generate();
        let wrapped = WrappedIdentity::wrap_with_params(&me, "hunter2", cheap()).unwrap();
        let json = wrapped.to_json().unwrap();
        assert!(!json.contains(&hex::encode(*me.secret_bytes())));

        let restored = WrappedIdentity::from_json(&json)
            .unwrap()
            .unwrap_identity("hunter2")
            .unwrap();
        assert_eq!(restored.fingerprint(), me.fingerprint());
        let sig = restored.sign(SignatureContext::GatewayChallenge, b"x");
        me.identity()
            .verify(SignatureContext::GatewayChallenge, b"x", &sig)
            .unwrap();
    }

    #[test]
    fn wrong_password_fails() {
        let me = PersonalIdentity::generate();
        let wrapped = WrappedIdentity::wrap_with_params(&me, "correct", cheap()).unwrap();
        assert!(matches!(
            wrapped.unwrap_identity("incorrect"),
            Err(IdentityError::Unwrap(_))
        ));
    }

    #[test]
    fn relabelled_fingerprint_fails() {
        let me = PersonalIdentity::generate();
        let other = PersonalIdentity::generate();
        let mut wrapped = WrappedIdentity::wrap_with_params(&me, "pw", cheap()).unwrap();
        wrapped.fingerprint = other.fingerprint();
        assert!(wrapped.unwrap_identity("pw").is_err());
    }
}
