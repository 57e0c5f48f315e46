//! A published stream and the viewers attached to it

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::config::SfuConfig;
use crate::keyframe::{KeyframeRequest, KeyframeRequests};
use crate::layer::{LayerHandle, LayerTable};
use crate::playback::PlaybackSession;
use crate::types::{LayerId, SessionId, StreamKey};

struct StreamInner {
    sessions: HashMap<SessionId, Arc<PlaybackSession>>,
    layers: LayerTable,
}

/// Shared state of one stream key
///
/// Owns the audio track every viewer receives, the table of simulcast
/// layers the publisher has sent, the attached viewer sessions, and the
/// queue through which viewers ask the publisher for keyframes.
pub struct Stream {
    key: StreamKey,
    audio_track: Arc<TrackLocalStaticRTP>,
    keyframes: KeyframeRequests,
    publishing: AtomicBool,
    inner: RwLock<StreamInner>,
}

impl Stream {
    #[must_use]
    pub fn new(key: StreamKey, config: &SfuConfig) -> Self {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            key.to_string(),
        ));

        Self {
            key,
            audio_track,
            keyframes: KeyframeRequests::new(config.keyframe_queue_capacity),
            publishing: AtomicBool::new(false),
            inner: RwLock::new(StreamInner {
                sessions: HashMap::new(),
                layers: LayerTable::default(),
            }),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Audio track shared by every viewer of this stream
    #[must_use]
    pub fn audio_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.audio_track)
    }

    pub fn add_session(&self, session: Arc<PlaybackSession>) {
        let mut inner = self.inner.write();
        inner.sessions.insert(session.id().clone(), session);
        debug!(stream_key = %self.key, sessions = inner.sessions.len(), "Viewer attached");
    }

    pub fn remove_session(&self, id: &SessionId) -> Option<Arc<PlaybackSession>> {
        let mut inner = self.inner.write();
        let removed = inner.sessions.remove(id);
        if removed.is_some() {
            debug!(stream_key = %self.key, session_id = %id, sessions = inner.sessions.len(), "Viewer detached");
        }
        removed
    }

    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<Arc<PlaybackSession>> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Snapshot of the attached viewers
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<PlaybackSession>> {
        self.inner.read().sessions.values().cloned().collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Register a layer the publisher is sending and return its handle.
    ///
    /// Viewers that asked for this layer before it arrived are switched to
    /// it, with one keyframe request on their behalf.
    pub fn observe_layer(&self, id: &LayerId) -> LayerHandle {
        let (handle, resolved) = {
            let mut inner = self.inner.write();
            let (handle, first_seen) = inner.layers.observe(id);
            if !first_seen {
                return handle;
            }
            let resolved = inner
                .sessions
                .values()
                .filter(|session| session.resolve_pending(id, handle))
                .count();
            (handle, resolved)
        };

        info!(stream_key = %self.key, layer = %id, waiting_viewers = resolved, "New video layer");
        if resolved > 0 {
            self.request_keyframe(Some(handle));
        }
        handle
    }

    /// Layers the publisher has sent, in first-seen order
    #[must_use]
    pub fn video_layers(&self) -> Vec<LayerId> {
        self.inner.read().layers.observed()
    }

    #[must_use]
    pub fn layer_name(&self, handle: LayerHandle) -> Option<LayerId> {
        self.inner.read().layers.name(handle).cloned()
    }

    /// Point a viewer at `layer` and ask the publisher for a keyframe on it.
    ///
    /// The layer does not have to exist yet; the viewer receives nothing
    /// until the publisher sends it. Returns `false` if the session is not
    /// attached here.
    pub fn switch_layer(&self, id: &SessionId, layer: &LayerId) -> bool {
        let handle = {
            let inner = self.inner.write();
            let Some(session) = inner.sessions.get(id) else {
                return false;
            };
            let handle = inner.layers.lookup(layer);
            match handle {
                Some(handle) => session.select_layer(handle),
                None => session.await_layer(layer.clone()),
            }
            handle
        };

        debug!(stream_key = %self.key, session_id = %id, layer = %layer, "Layer switched");
        self.request_keyframe(handle);
        true
    }

    /// Ask the publisher for a keyframe, discarding the request if the queue is full
    pub fn request_keyframe(&self, layer: Option<LayerHandle>) -> bool {
        self.keyframes.request(KeyframeRequest { layer })
    }

    /// Take the receiving end of the keyframe queue (only once per stream)
    pub fn take_keyframe_receiver(&self) -> Option<mpsc::Receiver<KeyframeRequest>> {
        self.keyframes.take_receiver()
    }

    /// Claim the publisher slot; fails if another publisher holds it
    pub fn claim_publisher(&self) -> bool {
        self.publishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_publisher(&self) {
        self.publishing.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn has_publisher(&self) -> bool {
        self.publishing.load(Ordering::Acquire)
    }

    /// No publisher and no viewers
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.has_publisher() && self.session_count() == 0
    }
}
