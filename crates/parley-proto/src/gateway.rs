//! Gateway wire protocol.
//!
//! Every frame is a JSON text message `{"seq": n, "type": "...", ...}`. The
//! client numbers its frames 0, 2, 4, ... and the server 1, 3, 5, ...; a reply
//! names the frame it answers in its `for` field. Binary fields are standard
//! base64, fingerprints are lowercase hex and connection IDs are UUIDs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Fingerprint;

/// A numbered frame on a gateway socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub seq: u64,
    #[serde(flatten)]
    pub message: T,
}

impl<T> Envelope<T> {
    pub fn new(seq: u64, message: T) -> Self {
        Envelope { seq, message }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Identify {
        #[serde(rename = "publicKey", with = "base64_bytes")]
        public_key: Vec<u8>,
        identity: Fingerprint,
    },
    ChallengeResponse {
        #[serde(rename = "for")]
        for_seq: u64,
        #[serde(with = "base64_bytes")]
        response: Vec<u8>,
    },
    PeerRequest {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerRequestCancel {
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerAccept {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerReject {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerMessageDescription {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
        description: SessionDescription,
    },
    PeerIceCandidate {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Identify { .. } => "IDENTIFY",
            ClientMessage::ChallengeResponse { .. } => "CHALLENGE_RESPONSE",
            ClientMessage::PeerRequest { .. } => "PEER_REQUEST",
            ClientMessage::PeerRequestCancel { .. } => "PEER_REQUEST_CANCEL",
            ClientMessage::PeerAccept { .. } => "PEER_ACCEPT",
            ClientMessage::PeerReject { .. } => "PEER_REJECT",
            ClientMessage::PeerMessageDescription { .. } => "PEER_MESSAGE_DESCRIPTION",
            ClientMessage::PeerIceCandidate { .. } => "PEER_ICE_CANDIDATE",
        }
    }
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Challenge {
        #[serde(rename = "for")]
        for_seq: u64,
        #[serde(with = "base64_bytes")]
        challenge: Vec<u8>,
    },
    ChallengeSuccess {
        #[serde(rename = "for")]
        for_seq: u64,
    },
    GotPeerRequest {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerRequestAccepted {
        #[serde(rename = "for")]
        for_seq: u64,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerRequestRejected {
        #[serde(rename = "for")]
        for_seq: u64,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    GotPeerRequestCancelled {
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    PeerOffline {
        #[serde(rename = "for")]
        for_seq: u64,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
    },
    GotPeerMessageDescription {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
        description: SessionDescription,
    },
    GotPeerIceCandidate {
        #[serde(rename = "peerIdentity")]
        peer_identity: Fingerprint,
        #[serde(rename = "connectionID")]
        connection_id: Uuid,
        candidate: IceCandidate,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Challenge { .. } => "CHALLENGE",
            ServerMessage::ChallengeSuccess { .. } => "CHALLENGE_SUCCESS",
            ServerMessage::GotPeerRequest { .. } => "GOT_PEER_REQUEST",
            ServerMessage::PeerRequestAccepted { .. } => "PEER_REQUEST_ACCEPTED",
            ServerMessage::PeerRequestRejected { .. } => "PEER_REQUEST_REJECTED",
            ServerMessage::GotPeerRequestCancelled { .. } => "GOT_PEER_REQUEST_CANCELLED",
            ServerMessage::PeerOffline { .. } => "PEER_OFFLINE",
            ServerMessage::GotPeerMessageDescription { .. } => "GOT_PEER_MESSAGE_DESCRIPTION",
            ServerMessage::GotPeerIceCandidate { .. } => "GOT_PEER_ICE_CANDIDATE",
        }
    }

    /// Sequence number of the client frame this message answers, if any.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            ServerMessage::Challenge { for_seq, .. }
            | ServerMessage::ChallengeSuccess { for_seq }
            | ServerMessage::PeerRequestAccepted { for_seq, .. }
            | ServerMessage::PeerRequestRejected { for_seq, .. }
            | ServerMessage::PeerOffline { for_seq, .. } => Some(*for_seq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// WebSocket close codes used by the gateway, all in the application range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    ChallengeFailed,
    ChallengeTimeout,
    SessionExists,
    InvalidState,
    InvalidFormat,
    NotAuthenticated,
    ExistingSession,
}

impl CloseCode {
    pub const NORMAL: u16 = 1000;

    pub const ALL: [CloseCode; 7] = [
        CloseCode::ChallengeFailed,
        CloseCode::ChallengeTimeout,
        CloseCode::SessionExists,
        CloseCode::InvalidState,
        CloseCode::InvalidFormat,
        CloseCode::NotAuthenticated,
        CloseCode::ExistingSession,
    ];

    pub fn code(self) -> u16 {
        match self {
            CloseCode::ChallengeFailed => 4001,
            CloseCode::ChallengeTimeout => 4002,
            CloseCode::SessionExists => 4003,
            CloseCode::InvalidState => 4004,
            CloseCode::InvalidFormat => 4005,
            CloseCode::NotAuthenticated => 4006,
            CloseCode::ExistingSession => 4007,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::ChallengeFailed => "CHALLENGE_FAILED",
            CloseCode::ChallengeTimeout => "CHALLENGE_TIMEOUT",
            CloseCode::SessionExists => "SESSION_EXISTS",
            CloseCode::InvalidState => "INVALID_STATE",
            CloseCode::InvalidFormat => "INVALID_FORMAT",
            CloseCode::NotAuthenticated => "NOT_AUTHENTICATED",
            CloseCode::ExistingSession => "EXISTING_SESSION",
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp() -> Fingerprint {
        "00112233445566778899aabbccddeeff".parse().unwrap()
    }

    #[test]
    fn identify_frame_layout() {
        let frame = Envelope::new(
            0,
            ClientMessage::Identify {
                public_key: vec![1, 2, 3],
                identity: fp(),
            },
        );
        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "seq": 0,
                "type": "IDENTIFY",
                "publicKey": "AQID",
                "identity": "00112233445566778899aabbccddeeff",
            })
        );
    }

    #[test]
    fn server_reply_parses_with_for_and_connection_id() {
        let id = Uuid::new_v4();
        let text = json!({
            "seq": 7,
            "type": "PEER_REQUEST_ACCEPTED",
            "for": 4,
            "connectionID": id.to_string(),
        })
        .to_string();
        let frame = Envelope::<ServerMessage>::from_text(&text).unwrap();
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.message.reply_to(), Some(4));
        assert_eq!(
            frame.message,
            ServerMessage::PeerRequestAccepted {
                for_seq: 4,
                connection_id: id
            }
        );
        assert_eq!(frame.message.kind(), "PEER_REQUEST_ACCEPTED");
    }

    #[test]
    fn description_and_candidate_use_browser_field_names() {
        let id = Uuid::new_v4();
        let frame = Envelope::new(
            2,
            ClientMessage::PeerIceCandidate {
                peer_identity: fp(),
                connection_id: id,
                candidate: IceCandidate {
                    candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        );
        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());

        let desc = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(desc, json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Envelope::<ClientMessage>::from_text(r#"{"seq":0,"type":"NOPE"}"#).is_err());
        assert!(Envelope::<ClientMessage>::from_text("not json").is_err());
    }

    #[test]
    fn close_codes_map_both_ways() {
        for code in CloseCode::ALL {
            assert_eq!(CloseCode::from_code(code.code()), Some(code));
            assert!((4000..5000).contains(&code.code()));
        }
        assert_eq!(CloseCode::ChallengeFailed.code(), 4001);
        assert_eq!(CloseCode::ExistingSession.code(), 4007);
        assert_eq!(CloseCode::from_code(1000), None);
    }
}
