//! OTR frames on the wire.
//!
//! Every frame opens with `SHORT version, BYTE type`; the body layouts are
//! fixed schemas over [`parley_proto::codec`].

use parley_proto::codec::{self, FieldKind, Value};

use super::OtrError;
use super::crypto::MAC_LEN;

pub const PROTOCOL_VERSION: u16 = 1;

pub const DH_PUBLIC_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const REVEAL_KEY_LEN: usize = 16;
pub const COUNTER_LEN: usize = 8;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

const HEADER: &[FieldKind] = &[FieldKind::Short, FieldKind::Byte];
const DH_COMMIT: &[FieldKind] = &[FieldKind::Var, FieldKind::Fixed(HASH_LEN)];
const DH_KEY: &[FieldKind] = &[FieldKind::Fixed(DH_PUBLIC_LEN)];
const REVEAL_SIGNATURE: &[FieldKind] = &[
    FieldKind::Fixed(REVEAL_KEY_LEN),
    FieldKind::Var,
    FieldKind::Fixed(MAC_LEN),
];
const SIGNATURE: &[FieldKind] = &[FieldKind::Var, FieldKind::Fixed(MAC_LEN)];
const DATA: &[FieldKind] = &[FieldKind::Var, FieldKind::Fixed(MAC_LEN), FieldKind::Var];
const DATA_INNER: &[FieldKind] = &[
    FieldKind::Int,
    FieldKind::Int,
    FieldKind::Fixed(DH_PUBLIC_LEN),
    FieldKind::Fixed(COUNTER_LEN),
    FieldKind::Var,
];
const SIGNATURE_BLOCK: &[FieldKind] = &[
    FieldKind::Fixed(PUBLIC_KEY_LEN),
    FieldKind::Int,
    FieldKind::Fixed(SIGNATURE_LEN),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    DhCommit = 0x02,
    Data = 0x03,
    DhKey = 0x0a,
    RevealSignature = 0x11,
    Signature = 0x12,
}

impl MessageType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(MessageType::DhCommit),
            0x03 => Some(MessageType::Data),
            0x0a => Some(MessageType::DhKey),
            0x11 => Some(MessageType::RevealSignature),
            0x12 => Some(MessageType::Signature),
            _ => None,
        }
    }

    fn schema(self) -> &'static [FieldKind] {
        match self {
            MessageType::DhCommit => DH_COMMIT,
            MessageType::Data => DATA,
            MessageType::DhKey => DH_KEY,
            MessageType::RevealSignature => REVEAL_SIGNATURE,
            MessageType::Signature => SIGNATURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtrMessage {
    DhCommit {
        encrypted_gx: Vec<u8>,
        hashed_gx: [u8; HASH_LEN],
    },
    DhKey {
        gy: [u8; DH_PUBLIC_LEN],
    },
    RevealSignature {
        r: [u8; REVEAL_KEY_LEN],
        encrypted_signature: Vec<u8>,
        mac: [u8; MAC_LEN],
    },
    Signature {
        encrypted_signature: Vec<u8>,
        mac: [u8; MAC_LEN],
    },
    Data(DataMessage),
}

impl OtrMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            OtrMessage::DhCommit { .. } => MessageType::DhCommit,
            OtrMessage::DhKey { .. } => MessageType::DhKey,
            OtrMessage::RevealSignature { .. } => MessageType::RevealSignature,
            OtrMessage::Signature { .. } => MessageType::Signature,
            OtrMessage::Data(_) => MessageType::Data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, OtrError> {
        let kind = self.message_type();
        let body = match self {
            OtrMessage::DhCommit {
                encrypted_gx,
                hashed_gx,
            } => vec![Value::from(encrypted_gx.as_slice()), Value::from(*hashed_gx)],
            OtrMessage::DhKey { gy } => vec![Value::from(*gy)],
            OtrMessage::RevealSignature {
                r,
                encrypted_signature,
                mac,
            } => vec![
                Value::from(*r),
                Value::from(encrypted_signature.as_slice()),
                Value::from(*mac),
            ],
            OtrMessage::Signature {
                encrypted_signature,
                mac,
            } => vec![Value::from(encrypted_signature.as_slice()), Value::from(*mac)],
            OtrMessage::Data(data) => vec![
                Value::from(data.inner.as_slice()),
                Value::from(data.mac),
                Value::from(data.revealed_mac_keys.as_slice()),
            ],
        };

        let mut out = codec::encode(
            HEADER,
            &[Value::Short(PROTOCOL_VERSION), Value::Byte(kind as u8)],
        )?;
        out.extend_from_slice(&codec::encode(kind.schema(), &body)?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OtrError> {
        let (header, consumed) = codec::decode_prefix(HEADER, bytes)?;
        let mut header = Fields::new(header);
        let version = header.short()?;
        if version != PROTOCOL_VERSION {
            return Err(OtrError::Protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        let type_byte = header.byte()?;
        let kind = MessageType::from_byte(type_byte).ok_or_else(|| {
            OtrError::Protocol(format!("unknown message type {type_byte:#04x}"))
        })?;

        let mut body = Fields::new(codec::decode(kind.schema(), &bytes[consumed..])?);
        let message = match kind {
            MessageType::DhCommit => OtrMessage::DhCommit {
                encrypted_gx: body.bytes()?,
                hashed_gx: body.fixed()?,
            },
            MessageType::DhKey => OtrMessage::DhKey { gy: body.fixed()? },
            MessageType::RevealSignature => OtrMessage::RevealSignature {
                r: body.fixed()?,
                encrypted_signature: body.bytes()?,
                mac: body.fixed()?,
            },
            MessageType::Signature => OtrMessage::Signature {
                encrypted_signature: body.bytes()?,
                mac: body.fixed()?,
            },
            MessageType::Data => {
                let data = DataMessage {
                    inner: body.bytes()?,
                    mac: body.fixed()?,
                    revealed_mac_keys: body.bytes()?,
                };
                if data.revealed_mac_keys.len() % MAC_LEN != 0 {
                    return Err(OtrError::Protocol(
                        "revealed mac keys are not whole keys".into(),
                    ));
                }
                OtrMessage::Data(data)
            }
        };
        Ok(message)
    }
}

/// Outer DATA frame. `mac` covers the encoded `inner` bytes exactly as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub inner: Vec<u8>,
    pub mac: [u8; MAC_LEN],
    pub revealed_mac_keys: Vec<u8>,
}

impl DataMessage {
    pub fn revealed_keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.revealed_mac_keys.chunks_exact(MAC_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInner {
    pub sender_keyid: u32,
    pub recipient_keyid: u32,
    pub next_dh: [u8; DH_PUBLIC_LEN],
    pub counter: [u8; COUNTER_LEN],
    pub ciphertext: Vec<u8>,
}

impl DataInner {
    pub fn encode(&self) -> Result<Vec<u8>, OtrError> {
        Ok(codec::encode(
            DATA_INNER,
            &[
                Value::Int(self.sender_keyid),
                Value::Int(self.recipient_keyid),
                Value::from(self.next_dh),
                Value::from(self.counter),
                Value::from(self.ciphertext.as_slice()),
            ],
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OtrError> {
        let mut fields = Fields::new(codec::decode(DATA_INNER, bytes)?);
        Ok(DataInner {
            sender_keyid: fields.int()?,
            recipient_keyid: fields.int()?,
            next_dh: fields.fixed()?,
            counter: fields.fixed()?,
            ciphertext: fields.bytes()?,
        })
    }
}

/// The plaintext each side encrypts during the key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub keyid: u32,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignatureBlock {
    pub fn encode(&self) -> Result<Vec<u8>, OtrError> {
        Ok(codec::encode(
            SIGNATURE_BLOCK,
            &[
                Value::from(self.public_key),
                Value::Int(self.keyid),
                Value::from(self.signature),
            ],
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OtrError> {
        let mut fields = Fields::new(codec::decode(SIGNATURE_BLOCK, bytes)?);
        Ok(SignatureBlock {
            public_key: fields.fixed()?,
            keyid: fields.int()?,
            signature: fields.fixed()?,
        })
    }
}

/// Typed, in-order access to decoded values.
struct Fields(std::vec::IntoIter<Value>);

impl Fields {
    fn new(values: Vec<Value>) -> Self {
        Fields(values.into_iter())
    }

    fn next(&mut self) -> Result<Value, OtrError> {
        self.0
            .next()
            .ok_or_else(|| OtrError::Protocol("frame ended early".into()))
    }

    fn byte(&mut self) -> Result<u8, OtrError> {
        self.next()?
            .as_byte()
            .ok_or_else(|| OtrError::Protocol("expected BYTE".into()))
    }

    fn short(&mut self) -> Result<u16, OtrError> {
        self.next()?
            .as_short()
            .ok_or_else(|| OtrError::Protocol("expected SHORT".into()))
    }

    fn int(&mut self) -> Result<u32, OtrError> {
        self.next()?
            .as_int()
            .ok_or_else(|| OtrError::Protocol("expected INT".into()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, OtrError> {
        self.next()?
            .into_bytes()
            .ok_or_else(|| OtrError::Protocol("expected bytes".into()))
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], OtrError> {
        let bytes = self.bytes()?;
        <[u8; N]>::try_from(bytes.as_slice())
            .map_err(|_| OtrError::Protocol(format!("expected {N} bytes, got {}", bytes.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_proto::WireError;

    #[test]
    fn frames_carry_version_and_type_header() {
        let encoded = OtrMessage::DhKey { gy: [9u8; 32] }.encode().unwrap();
        assert_eq!(&encoded[..3], &[0x00, 0x01, 0x0a]);
        assert_eq!(encoded.len(), 3 + 32);
    }

    #[test]
    fn data_frame_survives_the_wire() {
        let inner = DataInner {
            sender_keyid: 1,
            recipient_keyid: 2,
            next_dh: [3u8; 32],
            counter: 5u64.to_be_bytes(),
            ciphertext: b"opaque".to_vec(),
        };
        let message = OtrMessage::Data(DataMessage {
            inner: inner.encode().unwrap(),
            mac: [4u8; 32],
            revealed_mac_keys: [[6u8; 32], [7u8; 32]].concat(),
        });
        let decoded = OtrMessage::decode(&message.encode().unwrap()).unwrap();
        let OtrMessage::Data(data) = &decoded else {
            panic!("expected DATA, got {decoded:?}");
        };
        assert_eq!(data.revealed_keys().count(), 2);
        assert_eq!(DataInner::decode(&data.inner).unwrap(), inner);
    }

    #[test]
    fn unknown_version_is_a_protocol_violation() {
        let mut encoded = OtrMessage::DhKey { gy: [0u8; 32] }.encode().unwrap();
        encoded[1] = 2;
        assert!(matches!(
            OtrMessage::decode(&encoded),
            Err(OtrError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_type_is_a_protocol_violation() {
        let mut encoded = OtrMessage::DhKey { gy: [0u8; 32] }.encode().unwrap();
        encoded[2] = 0x7f;
        assert!(matches!(
            OtrMessage::decode(&encoded),
            Err(OtrError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_frame_reports_wire_error() {
        let encoded = OtrMessage::DhKey { gy: [0u8; 32] }.encode().unwrap();
        let err = OtrMessage::decode(&encoded[..20]).unwrap_err();
        assert!(matches!(err, OtrError::Wire(WireError::TruncatedInput { .. })));
    }

    #[test]
    fn partial_mac_keys_are_rejected() {
        let message = OtrMessage::Data(DataMessage {
            inner: vec![],
            mac: [0u8; 32],
            revealed_mac_keys: vec![1u8; 33],
        });
        assert!(OtrMessage::decode(&message.encode().unwrap()).is_err());
    }
}
