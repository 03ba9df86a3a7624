//! Primitive helpers shared by the key exchange and the data ratchet.

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::OtrError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const AES_KEY_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `SHA-256(byte || secret)`, the key derivation step used throughout.
pub fn h2(byte: u8, secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([byte]);
    hasher.update(secret);
    hasher.finalize().into()
}

/// AES-128 in counter mode. The IV is the 8-byte counter followed by zeros.
pub fn aes_ctr(key: &[u8; AES_KEY_LEN], counter: [u8; 8], data: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&counter);
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

fn keyed(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha256, OtrError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| OtrError::Verification("invalid mac key length".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

pub fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_LEN], OtrError> {
    Ok(keyed(key, parts)?.finalize().into_bytes().into())
}

/// Constant-time tag check.
pub fn hmac_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), OtrError> {
    keyed(key, parts)?
        .verify_slice(tag)
        .map_err(|_| OtrError::Verification("message authentication code mismatch".into()))
}
