//! Shared routing tables.
//!
//! `identities` maps an authenticated fingerprint to the socket that proved
//! ownership of it. `requests` tracks peer requests by connection ID so
//! replies can be correlated with the requester's original frame and so a
//! disconnect can be reported to the other party. A request leaves the table
//! as soon as it is answered or withdrawn; unanswered ones expire after the
//! request TTL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_proto::{CloseCode, Fingerprint, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);

pub type SocketId = u64;

/// What a socket's writer task sends next.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    Close(CloseCode),
}

#[derive(Debug, Clone)]
pub struct SocketHandle {
    pub socket_id: SocketId,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketHandle {
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues `message` for the socket; `false` once the socket is gone.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub requester: Fingerprint,
    pub requester_socket: SocketId,
    pub target: Fingerprint,
    pub request_seq: u64,
    pub opened_at: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("fingerprint {0} is bound to another live socket")]
    IdentityTaken(Fingerprint),
    #[error("connection {0} already has a pending request")]
    DuplicateConnection(Uuid),
}

#[derive(Debug)]
struct Tables {
    identities: DashMap<Fingerprint, SocketHandle>,
    requests: DashMap<Uuid, PendingRequest>,
    request_ttl: Duration,
    next_socket_id: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PeerRouter {
    inner: Arc<Tables>,
}

impl Default for PeerRouter {
    fn default() -> Self {
        Self::with_request_ttl(DEFAULT_REQUEST_TTL)
    }
}

impl PeerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unanswered requests older than `request_ttl` are dropped.
    pub fn with_request_ttl(request_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Tables {
                identities: DashMap::new(),
                requests: DashMap::new(),
                request_ttl,
                next_socket_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn allocate_socket_id(&self) -> SocketId {
        self.inner.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether `fingerprint` is bound to a socket that is still open.
    pub fn is_bound(&self, fingerprint: &Fingerprint) -> bool {
        self.inner
            .identities
            .get(fingerprint)
            .map(|handle| handle.is_live())
            .unwrap_or(false)
    }

    /// Binds `fingerprint` to `handle`. A stale entry whose socket already
    /// went away is replaced.
    pub fn register(&self, fingerprint: Fingerprint, handle: SocketHandle) -> Result<(), RouteError> {
        match self.inner.identities.entry(fingerprint) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() && occupied.get().socket_id != handle.socket_id {
                    return Err(RouteError::IdentityTaken(fingerprint));
                }
                occupied.insert(handle);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
            }
        }
        Ok(())
    }

    /// Removes the binding only if it still belongs to `socket_id`.
    pub fn deregister(&self, fingerprint: &Fingerprint, socket_id: SocketId) {
        self.inner
            .identities
            .remove_if(fingerprint, |_, handle| handle.socket_id == socket_id);
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<SocketHandle> {
        self.inner
            .identities
            .get(fingerprint)
            .map(|handle| handle.clone())
            .filter(SocketHandle::is_live)
    }

    pub fn open_request(&self, connection_id: Uuid, request: PendingRequest) -> Result<(), RouteError> {
        self.expire_requests();
        match self.inner.requests.entry(connection_id) {
            Entry::Occupied(_) => Err(RouteError::DuplicateConnection(connection_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(request);
                Ok(())
            }
        }
    }

    pub fn request(&self, connection_id: &Uuid) -> Option<PendingRequest> {
        self.inner
            .requests
            .get(connection_id)
            .map(|entry| entry.clone())
    }

    /// Removes and returns the request from `requester` to `target`. Used
    /// when the target answers it.
    pub fn answer_request(
        &self,
        connection_id: &Uuid,
        target: &Fingerprint,
        requester: &Fingerprint,
    ) -> Option<PendingRequest> {
        self.inner
            .requests
            .remove_if(connection_id, |_, request| {
                &request.target == target && &request.requester == requester
            })
            .map(|(_, request)| request)
    }

    /// Removes a request if `party` is one of its two ends.
    pub fn close_request(&self, connection_id: &Uuid, party: &Fingerprint) -> Option<PendingRequest> {
        self.inner
            .requests
            .remove_if(connection_id, |_, request| {
                &request.requester == party || &request.target == party
            })
            .map(|(_, request)| request)
    }

    /// Removes and returns every request `fingerprint` takes part in through
    /// `socket_id`.
    pub fn drain_requests_for(
        &self,
        fingerprint: &Fingerprint,
        socket_id: SocketId,
    ) -> Vec<(Uuid, PendingRequest)> {
        let ids: Vec<Uuid> = self
            .inner
            .requests
            .iter()
            .filter(|entry| {
                let request = entry.value();
                (&request.requester == fingerprint && request.requester_socket == socket_id)
                    || &request.target == fingerprint
            })
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.inner.requests.remove(&id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.requests.len()
    }

    fn expire_requests(&self) {
        let ttl = self.inner.request_ttl;
        self.inner.requests.retain(|connection_id, request| {
            let live = request.opened_at.elapsed() < ttl;
            if !live {
                debug!(target = "gateway", %connection_id, "peer request expired");
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_proto::PersonalIdentity;

    fn handle(router: &PeerRouter) -> (SocketHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SocketHandle {
                socket_id: router.allocate_socket_id(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn live_binding_blocks_a_second_socket() {
        let router = PeerRouter::new();
        let fp = PersonalIdentity::generate().fingerprint();
        let (first, _rx1) = handle(&router);
        let (second, _rx2) = handle(&router);

        router.register(fp, first.clone()).unwrap();
        assert!(router.is_bound(&fp));
        assert_eq!(
            router.register(fp, second.clone()),
            Err(RouteError::IdentityTaken(fp))
        );

        // Only the owner can remove the binding.
        router.deregister(&fp, second.socket_id);
        assert!(router.is_bound(&fp));
        router.deregister(&fp, first.socket_id);
        assert!(!router.is_bound(&fp));
    }

    #[test]
    fn stale_binding_is_replaced() {
        let router = PeerRouter::new();
        let fp = PersonalIdentity::generate().fingerprint();
        let (first, rx1) = handle(&router);
        let (second, _rx2) = handle(&router);
        router.register(fp, first).unwrap();
        drop(rx1);

        assert!(!router.is_bound(&fp));
        router.register(fp, second.clone()).unwrap();
        assert_eq!(router.lookup(&fp).map(|h| h.socket_id), Some(second.socket_id));
    }

    #[test]
    fn requests_are_unique_and_drained_by_either_party() {
        let router = PeerRouter::new();
        let alice = PersonalIdentity::generate().fingerprint();
        let bob = PersonalIdentity::generate().fingerprint();
        let id = Uuid::new_v4();
        let request = PendingRequest {
            requester: alice,
            requester_socket: 7,
            target: bob,
            request_seq: 4,
            opened_at: Instant::now(),
        };

        router.open_request(id, request.clone()).unwrap();
        assert_eq!(
            router.open_request(id, request.clone()),
            Err(RouteError::DuplicateConnection(id))
        );

        let drained = router.drain_requests_for(&bob, 99);
        assert_eq!(drained.len(), 1);
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn answering_removes_the_request() {
        let router = PeerRouter::new();
        let alice = PersonalIdentity::generate().fingerprint();
        let bob = PersonalIdentity::generate().fingerprint();
        let id = Uuid::new_v4();
        router
            .open_request(
                id,
                PendingRequest {
                    requester: alice,
                    requester_socket: 1,
                    target: bob,
                    request_seq: 0,
                    opened_at: Instant::now(),
                },
            )
            .unwrap();

        // Only the target can answer, and only once.
        assert!(router.answer_request(&id, &alice, &bob).is_none());
        assert_eq!(router.answer_request(&id, &bob, &alice).map(|r| r.request_seq), Some(0));
        assert!(router.answer_request(&id, &bob, &alice).is_none());
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn stale_requests_expire_when_new_ones_open() {
        let router = PeerRouter::with_request_ttl(Duration::from_millis(50));
        let alice = PersonalIdentity::generate().fingerprint();
        let bob = PersonalIdentity::generate().fingerprint();
        let request = |opened_at| PendingRequest {
            requester: alice,
            requester_socket: 1,
            target: bob,
            request_seq: 0,
            opened_at,
        };
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        router
            .open_request(stale, request(Instant::now() - Duration::from_secs(1)))
            .unwrap();
        router.open_request(fresh, request(Instant::now())).unwrap();

        assert!(router.request(&stale).is_none());
        assert!(router.request(&fresh).is_some());
        assert_eq!(router.pending_count(), 1);
    }
}
