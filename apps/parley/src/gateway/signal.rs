use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_proto::{ClientMessage, Fingerprint, ServerMessage};
use uuid::Uuid;

use super::GatewayClient;
use crate::rtc::signal::select_stream;
use crate::rtc::{RtcError, Signal, SignalRelay};

#[async_trait]
impl SignalRelay for GatewayClient {
    async fn send_signal(
        &self,
        peer: Fingerprint,
        connection_id: Uuid,
        signal: Signal,
    ) -> Result<(), RtcError> {
        let message = match signal {
            Signal::Description(description) => ClientMessage::PeerMessageDescription {
                peer_identity: peer,
                connection_id,
                description,
            },
            Signal::Candidate(candidate) => ClientMessage::PeerIceCandidate {
                peer_identity: peer,
                connection_id,
                candidate,
            },
            Signal::PeerOffline | Signal::Cancelled => {
                return Err(RtcError::Signaling(
                    "only descriptions and candidates are relayed".into(),
                ));
            }
        };
        self.send(message)
            .await
            .map(|_| ())
            .map_err(|err| RtcError::Signaling(err.to_string()))
    }

    fn subscribe_signals(&self, peer: Fingerprint, connection_id: Uuid) -> BoxStream<'static, Signal> {
        select_stream(
            self.subscribe(),
            self.cancel_token().clone(),
            move |envelope| match &envelope.message {
                ServerMessage::GotPeerMessageDescription {
                    peer_identity,
                    connection_id: id,
                    description,
                } if *peer_identity == peer && *id == connection_id => {
                    Some(Signal::Description(description.clone()))
                }
                ServerMessage::GotPeerIceCandidate {
                    peer_identity,
                    connection_id: id,
                    candidate,
                } if *peer_identity == peer && *id == connection_id => {
                    Some(Signal::Candidate(candidate.clone()))
                }
                ServerMessage::PeerOffline {
                    connection_id: id, ..
                } if *id == connection_id => Some(Signal::PeerOffline),
                ServerMessage::GotPeerRequestCancelled { connection_id: id }
                    if *id == connection_id =>
                {
                    Some(Signal::Cancelled)
                }
                _ => None,
            },
        )
    }
}
