use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parley_proto::{
    ClientMessage, CloseCode, Envelope, Fingerprint, Identity, ServerMessage, SignatureContext,
};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::router::{Outbound, PeerRouter, PendingRequest, SocketHandle, SocketId};

pub const CHALLENGE_LEN: usize = 16;

pub struct AppState {
    pub router: PeerRouter,
    pub config: GatewayConfig,
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

enum AuthState {
    Unauthenticated,
    ChallengePending {
        identity: Identity,
        challenge: [u8; CHALLENGE_LEN],
        for_seq: u64,
        deadline: Instant,
    },
    Authenticated {
        fingerprint: Fingerprint,
    },
}

/// State owned by one socket's handler task.
struct SocketSession {
    socket_id: SocketId,
    handle: SocketHandle,
    auth: AuthState,
    router: PeerRouter,
    config: GatewayConfig,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let socket_id = state.router.allocate_socket_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        let mut next_seq: u64 = 1;
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let envelope = Envelope::new(next_seq, message);
                    next_seq += 2;
                    let text = match envelope.to_text() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(target = "gateway", socket_id, error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    let frame = CloseFrame {
                        code: code.code(),
                        reason: Cow::Borrowed(code.reason()),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
        debug!(target = "gateway", socket_id, "writer task ended");
    });

    debug!(target = "gateway", socket_id, remote = %remote_addr, "websocket connected");

    let mut session = SocketSession {
        socket_id,
        handle: SocketHandle { socket_id, tx },
        auth: AuthState::Unauthenticated,
        router: state.router.clone(),
        config: state.config.clone(),
    };

    loop {
        let deadline = session.challenge_deadline();
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = sleep_until(deadline) => {
                info!(target = "gateway", socket_id, "challenge expired");
                session.close(CloseCode::ChallengeTimeout);
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                session.close(CloseCode::InvalidFormat);
                break;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(target = "gateway", socket_id, error = %err, "websocket error");
                break;
            }
        };

        let envelope = match Envelope::<ClientMessage>::from_text(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target = "gateway", socket_id, error = %err, "malformed frame");
                session.close(CloseCode::InvalidFormat);
                break;
            }
        };

        if let Err(code) = session.handle(envelope) {
            session.close(code);
            break;
        }
    }

    session.cleanup();
    drop(session);
    let _ = writer.await;
    debug!(target = "gateway", socket_id, "websocket disconnected");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SocketSession {
    fn challenge_deadline(&self) -> Option<Instant> {
        match &self.auth {
            AuthState::ChallengePending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        match &self.auth {
            AuthState::Authenticated { fingerprint } => Some(*fingerprint),
            _ => None,
        }
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.handle.deliver(message);
    }

    fn close(&self, code: CloseCode) {
        info!(
            target = "gateway",
            socket_id = self.socket_id,
            code = code.code(),
            reason = code.reason(),
            "closing socket"
        );
        let _ = self.handle.tx.send(Outbound::Close(code));
    }

    fn handle(&mut self, envelope: Envelope<ClientMessage>) -> Result<(), CloseCode> {
        let Envelope { seq, message } = envelope;
        debug!(target = "gateway", socket_id = self.socket_id, seq, kind = message.kind(), "frame");
        match message {
            ClientMessage::Identify {
                public_key,
                identity,
            } => self.on_identify(seq, &public_key, identity),
            ClientMessage::ChallengeResponse { for_seq, response } => {
                self.on_challenge_response(seq, for_seq, &response)
            }
            routed => {
                let Some(me) = self.fingerprint() else {
                    return Err(CloseCode::NotAuthenticated);
                };
                self.route(me, seq, routed)
            }
        }
    }

    fn on_identify(
        &mut self,
        seq: u64,
        public_key: &[u8],
        claimed: Fingerprint,
    ) -> Result<(), CloseCode> {
        if !matches!(self.auth, AuthState::Unauthenticated) {
            return Err(CloseCode::SessionExists);
        }
        if self.router.is_bound(&claimed) {
            return Err(CloseCode::ExistingSession);
        }
        let identity = Identity::from_bytes(public_key).map_err(|err| {
            warn!(target = "gateway", socket_id = self.socket_id, error = %err, "bad public key");
            CloseCode::ChallengeFailed
        })?;
        if identity.fingerprint() != claimed {
            warn!(
                target = "gateway",
                socket_id = self.socket_id,
                claimed = %claimed,
                "fingerprint does not match public key"
            );
            return Err(CloseCode::ChallengeFailed);
        }

        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        self.auth = AuthState::ChallengePending {
            identity,
            challenge,
            for_seq: seq,
            deadline: Instant::now() + self.config.challenge_timeout,
        };
        self.send(ServerMessage::Challenge {
            for_seq: seq,
            challenge: challenge.to_vec(),
        });
        Ok(())
    }

    fn on_challenge_response(
        &mut self,
        seq: u64,
        for_seq: u64,
        response: &[u8],
    ) -> Result<(), CloseCode> {
        let AuthState::ChallengePending {
            identity,
            challenge,
            for_seq: challenge_seq,
            ..
        } = &self.auth
        else {
            return Err(CloseCode::InvalidState);
        };

        if for_seq != *challenge_seq {
            return Err(CloseCode::ChallengeFailed);
        }
        if identity
            .verify(SignatureContext::GatewayChallenge, challenge, response)
            .is_err()
        {
            info!(
                target = "gateway",
                socket_id = self.socket_id,
                peer = %identity.fingerprint(),
                "challenge signature rejected"
            );
            return Err(CloseCode::ChallengeFailed);
        }

        let fingerprint = identity.fingerprint();
        self.router
            .register(fingerprint, self.handle.clone())
            .map_err(|_| CloseCode::ExistingSession)?;
        self.auth = AuthState::Authenticated { fingerprint };
        info!(target = "gateway", socket_id = self.socket_id, peer = %fingerprint, "authenticated");
        self.send(ServerMessage::ChallengeSuccess { for_seq: seq });
        Ok(())
    }

    fn route(&mut self, me: Fingerprint, seq: u64, message: ClientMessage) -> Result<(), CloseCode> {
        match message {
            ClientMessage::PeerRequest {
                peer_identity,
                connection_id,
            } => {
                let Some(target) = self.router.lookup(&peer_identity) else {
                    self.offline(seq, connection_id);
                    return Ok(());
                };
                let request = PendingRequest {
                    requester: me,
                    requester_socket: self.socket_id,
                    target: peer_identity,
                    request_seq: seq,
                    opened_at: Instant::now(),
                };
                self.router
                    .open_request(connection_id, request)
                    .map_err(|err| {
                        warn!(target = "gateway", socket_id = self.socket_id, error = %err, "rejecting peer request");
                        CloseCode::InvalidState
                    })?;
                info!(
                    target = "gateway",
                    %connection_id,
                    from = %me.short(),
                    to = %peer_identity.short(),
                    "peer request"
                );
                if !target.deliver(ServerMessage::GotPeerRequest {
                    peer_identity: me,
                    connection_id,
                }) {
                    self.router.close_request(&connection_id, &me);
                    self.offline(seq, connection_id);
                }
            }
            ClientMessage::PeerRequestCancel { connection_id } => {
                match self.router.request(&connection_id) {
                    Some(request) if request.requester == me => {
                        self.router.close_request(&connection_id, &me);
                        if let Some(target) = self.router.lookup(&request.target) {
                            target.deliver(ServerMessage::GotPeerRequestCancelled { connection_id });
                        }
                    }
                    _ => debug!(target = "gateway", %connection_id, "cancel for unknown request"),
                }
            }
            ClientMessage::PeerAccept {
                peer_identity,
                connection_id,
            } => {
                let answered = self
                    .router
                    .answer_request(&connection_id, &me, &peer_identity);
                let Some(request) = answered else {
                    self.send(ServerMessage::GotPeerRequestCancelled { connection_id });
                    return Ok(());
                };
                let delivered = self
                    .router
                    .lookup(&request.requester)
                    .filter(|handle| handle.socket_id == request.requester_socket)
                    .map(|handle| {
                        handle.deliver(ServerMessage::PeerRequestAccepted {
                            for_seq: request.request_seq,
                            connection_id,
                        })
                    })
                    .unwrap_or(false);
                if !delivered {
                    self.offline(seq, connection_id);
                }
            }
            ClientMessage::PeerReject {
                peer_identity,
                connection_id,
            } => {
                let answered = self
                    .router
                    .answer_request(&connection_id, &me, &peer_identity);
                let Some(request) = answered else {
                    self.send(ServerMessage::GotPeerRequestCancelled { connection_id });
                    return Ok(());
                };
                let delivered = self
                    .router
                    .lookup(&request.requester)
                    .map(|handle| {
                        handle.deliver(ServerMessage::PeerRequestRejected {
                            for_seq: request.request_seq,
                            connection_id,
                        })
                    })
                    .unwrap_or(false);
                if !delivered {
                    self.offline(seq, connection_id);
                }
            }
            ClientMessage::PeerMessageDescription {
                peer_identity,
                connection_id,
                description,
            } => self.relay(
                seq,
                peer_identity,
                connection_id,
                ServerMessage::GotPeerMessageDescription {
                    peer_identity: me,
                    connection_id,
                    description,
                },
            ),
            ClientMessage::PeerIceCandidate {
                peer_identity,
                connection_id,
                candidate,
            } => self.relay(
                seq,
                peer_identity,
                connection_id,
                ServerMessage::GotPeerIceCandidate {
                    peer_identity: me,
                    connection_id,
                    candidate,
                },
            ),
            ClientMessage::Identify { .. } | ClientMessage::ChallengeResponse { .. } => {
                return Err(CloseCode::SessionExists)
            }
        }
        Ok(())
    }

    fn relay(&self, seq: u64, target: Fingerprint, connection_id: Uuid, message: ServerMessage) {
        let delivered = self
            .router
            .lookup(&target)
            .map(|handle| handle.deliver(message))
            .unwrap_or(false);
        if !delivered {
            self.offline(seq, connection_id);
        }
    }

    fn offline(&self, seq: u64, connection_id: Uuid) {
        debug!(target = "gateway", %connection_id, seq, "peer offline");
        self.send(ServerMessage::PeerOffline {
            for_seq: seq,
            connection_id,
        });
    }

    /// Deregisters the identity and settles every request this socket was a
    /// party to.
    fn cleanup(&mut self) {
        let Some(me) = self.fingerprint() else {
            return;
        };
        self.router.deregister(&me, self.socket_id);
        for (connection_id, request) in self.router.drain_requests_for(&me, self.socket_id) {
            if request.requester == me {
                if let Some(target) = self.router.lookup(&request.target) {
                    target.deliver(ServerMessage::GotPeerRequestCancelled { connection_id });
                }
            } else if let Some(requester) = self.router.lookup(&request.requester) {
                requester.deliver(ServerMessage::PeerOffline {
                    for_seq: request.request_seq,
                    connection_id,
                });
            }
        }
        info!(target = "gateway", socket_id = self.socket_id, peer = %me, "deregistered");
    }
}
