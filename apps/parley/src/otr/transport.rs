use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;

use super::OtrError;
use crate::rtc::{RtcChannel, RtcError, RtcState};

/// Connectivity of the link under an OTR session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet usable, or temporarily lost.
    Down,
    Up,
    Closed,
}

/// An ordered, reliable message pipe to one peer.
#[async_trait]
pub trait OtrTransport: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), OtrError>;
    /// `None` once the link is closed and drained.
    async fn recv(&self) -> Option<Vec<u8>>;
    fn link_state(&self) -> LinkState;
    /// Link state changes, starting with the current state.
    fn link_changes(&self) -> BoxStream<'static, LinkState>;
    async fn close(&self);
}

fn link_of(state: RtcState) -> LinkState {
    match state {
        RtcState::Connected => LinkState::Up,
        RtcState::Connecting | RtcState::Disconnected => LinkState::Down,
        RtcState::Closed => LinkState::Closed,
    }
}

/// Yields the mapped state now and after each change, ending when the
/// sender goes away.
pub(crate) fn watch_links<T, F>(rx: watch::Receiver<T>, map: F) -> BoxStream<'static, LinkState>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) -> LinkState + Send + Sync + 'static,
{
    futures::stream::unfold((rx, map, true), |(mut rx, map, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let link = map(&rx.borrow_and_update());
        Some((link, (rx, map, false)))
    })
    .boxed()
}

#[async_trait]
impl OtrTransport for RtcChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<(), OtrError> {
        RtcChannel::send(self, &frame).await.map_err(|err| match err {
            RtcError::Closed => OtrError::Closed,
            other => OtrError::Transport(other.to_string()),
        })
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        RtcChannel::recv(self).await
    }

    fn link_state(&self) -> LinkState {
        link_of(self.state())
    }

    fn link_changes(&self) -> BoxStream<'static, LinkState> {
        watch_links(self.state_changes(), |state| link_of(*state))
    }

    async fn close(&self) {
        RtcChannel::close(self).await;
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! A transport pair over channels, with hooks for failure tests.

    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::{Mutex as AsyncMutex, mpsc};

    use super::*;

    pub(crate) struct MemoryTransport {
        tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        link: Arc<watch::Sender<LinkState>>,
        /// Every frame this side sent, in order.
        pub(crate) sent: Mutex<Vec<Vec<u8>>>,
    }

    pub(crate) fn transport_pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(LinkState::Up);
        let link = Arc::new(link);
        let a = MemoryTransport {
            tx: Mutex::new(Some(b_tx)),
            rx: AsyncMutex::new(a_rx),
            link: link.clone(),
            sent: Mutex::new(Vec::new()),
        };
        let b = MemoryTransport {
            tx: Mutex::new(Some(a_tx)),
            rx: AsyncMutex::new(b_rx),
            link,
            sent: Mutex::new(Vec::new()),
        };
        (Arc::new(a), Arc::new(b))
    }

    impl MemoryTransport {
        /// Puts a frame on the peer's receive queue without recording it.
        pub(crate) fn inject_to_peer(&self, frame: Vec<u8>) {
            if let Some(tx) = self.tx.lock().as_ref() {
                let _ = tx.send(frame);
            }
        }

        pub(crate) fn set_link(&self, state: LinkState) {
            self.link.send_replace(state);
        }
    }

    #[async_trait]
    impl OtrTransport for MemoryTransport {
        async fn send(&self, frame: Vec<u8>) -> Result<(), OtrError> {
            if self.link_state() == LinkState::Closed {
                return Err(OtrError::Closed);
            }
            self.sent.lock().push(frame.clone());
            let tx = self.tx.lock().clone().ok_or(OtrError::Closed)?;
            tx.send(frame).map_err(|_| OtrError::Closed)
        }

        async fn recv(&self) -> Option<Vec<u8>> {
            self.rx.lock().await.recv().await
        }

        fn link_state(&self) -> LinkState {
            *self.link.borrow()
        }

        fn link_changes(&self) -> BoxStream<'static, LinkState> {
            watch_links(self.link.subscribe(), |state| *state)
        }

        async fn close(&self) {
            self.tx.lock().take();
            self.link.send_replace(LinkState::Closed);
        }
    }
}
