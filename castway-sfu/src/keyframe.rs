//! Keyframe request queue between viewers and a stream's publisher

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::layer::LayerHandle;

/// A viewer's request for a fresh keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeRequest {
    /// Layer the viewer is receiving, or `None` when it has not been pinned yet
    pub layer: Option<LayerHandle>,
}

/// Bounded, lossy queue of keyframe requests
///
/// Producers never wait: once the queue is full further requests are
/// discarded, since a pending request already covers them.
pub struct KeyframeRequests {
    tx: mpsc::Sender<KeyframeRequest>,
    rx: Mutex<Option<mpsc::Receiver<KeyframeRequest>>>,
}

impl KeyframeRequests {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueue a request, returning `false` if it was discarded
    pub fn request(&self, request: KeyframeRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Keyframe request queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Take the receiving end (can only be taken once)
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<KeyframeRequest>> {
        self.rx.lock().take()
    }
}
