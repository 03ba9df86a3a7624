use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, RtcConfig,
    RtcError, SignalingState,
};

fn pc_error(err: webrtc::Error) -> RtcError {
    RtcError::PeerConnection(err.to_string())
}

/// Builds webrtc-rs peer connections carrying one negotiated data channel.
pub struct WebRtcFactory {
    api: API,
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(&self, config: &RtcConfig) -> Result<(Arc<dyn PeerConnection>, PeerEvents), RtcError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(pc_error)?,
        );
        let (events, rx) = mpsc::unbounded_channel();

        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::NegotiationNeeded);
            })
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        trace!(target = "webrtc", candidate = %init.candidate, "local candidate");
                        let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(target = "webrtc", error = %err, "failed to serialise candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(target = "webrtc", state = %state, "ice connection state");
                if let Some(state) = map_ice_state(state) {
                    let _ = tx.send(PeerEvent::IceConnectionState(state));
                }
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(config.data_channel_id),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(&config.data_channel_label, Some(init))
            .await
            .map_err(pc_error)?;
        wire_data_channel(&dc, events);

        Ok((Arc::new(NativePeer { pc, dc }), rx))
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelOpen);
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelClosed);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelMessage(msg.data.to_vec()));
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn to_native(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(pc_error),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(pc_error),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(pc_error),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            Ok(rollback)
        }
    }
}

fn from_native(description: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::PeerConnection("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

struct NativePeer {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl PeerConnection for NativePeer {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        from_native(self.pc.create_offer(None).await.map_err(pc_error)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        from_native(self.pc.create_answer(None).await.map_err(pc_error)?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        let mut native = to_native(description)?;
        if native.sdp_type == RTCSdpType::Rollback && native.sdp.is_empty() {
            // webrtc-rs wants the description being rolled back.
            if let Some(pending) = self.pc.pending_local_description().await {
                native.sdp = pending.sdp;
            }
        }
        self.pc.set_local_description(native).await.map_err(pc_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc
            .set_remote_description(to_native(description)?)
            .await
            .map_err(pc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(pc_error)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), RtcError> {
        self.dc
            .send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(pc_error)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(pc_error)
    }
}
