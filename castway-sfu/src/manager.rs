//! SFU Manager - entry point for publishers, viewers and status queries
//!
//! Owns the stream registry and the two WebRTC APIs (publish side and
//! playback side). Every transport it creates is tracked by a supervisor
//! so [`SfuManager::shutdown`] can close them all and wait for them.

use std::sync::Arc;

use tracing::info;

use crate::config::SfuConfig;
use crate::error::Result;
use crate::ingest;
use crate::playback;
use crate::registry::StreamRegistry;
use crate::transport::{Supervisor, Transports};
use crate::types::{LayerId, SessionId, StreamKey};

/// Answer to a viewer's offer
#[derive(Debug, Clone)]
pub struct PlaybackAnswer {
    pub sdp: String,
    pub session_id: SessionId,
}

pub struct SfuManager {
    config: Arc<SfuConfig>,
    registry: Arc<StreamRegistry>,
    transports: Transports,
    supervisor: Supervisor,
}

impl SfuManager {
    /// Create a new SFU manager, binding any configured UDP mux ports
    pub async fn new(config: SfuConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let transports = Transports::new(&config).await?;

        info!(
            max_streams = config.max_streams,
            keyframe_queue_capacity = config.keyframe_queue_capacity,
            nat_1to1_ips = ?config.nat_1to1_ips,
            "SFU Manager initialized"
        );

        Ok(Arc::new(Self {
            registry: Arc::new(StreamRegistry::new(Arc::clone(&config))),
            config,
            transports,
            supervisor: Supervisor::default(),
        }))
    }

    /// Accept a publisher's offer for `key` and return the answer SDP
    pub async fn ingest(&self, offer: String, key: &StreamKey) -> Result<String> {
        ingest::start(
            &self.transports.whip,
            &self.registry,
            key,
            offer,
            LayerId::new(self.config.default_layer.clone()),
            &self.supervisor,
        )
        .await
    }

    /// Accept a viewer's offer for `key`, returning the answer and the new session id
    pub async fn playback(&self, offer: String, key: &StreamKey) -> Result<PlaybackAnswer> {
        let (sdp, session_id) = playback::start(
            &self.transports.whep,
            &self.registry,
            key,
            offer,
            self.config.initial_timestamp,
            &self.supervisor,
        )
        .await?;
        Ok(PlaybackAnswer { sdp, session_id })
    }

    /// Layers available to a viewer; empty when the session is unknown
    #[must_use]
    pub fn list_layers(&self, session_id: &SessionId) -> Vec<LayerId> {
        self.registry
            .find_session(session_id)
            .map(|(stream, _)| stream.video_layers())
            .unwrap_or_default()
    }

    /// Switch a viewer to `layer`; returns `false` when the session is unknown
    pub fn switch_layer(&self, session_id: &SessionId, layer: &LayerId) -> bool {
        self.registry
            .find_session(session_id)
            .is_some_and(|(stream, _)| stream.switch_layer(session_id, layer))
    }

    #[must_use]
    pub fn list_stream_keys(&self) -> Vec<StreamKey> {
        self.registry.stream_keys()
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Peer connections that have not finished closing
    #[must_use]
    pub fn open_transports(&self) -> usize {
        self.supervisor.open_transports()
    }

    /// Close every publisher and viewer transport and wait until they are closed
    pub async fn shutdown(&self) {
        info!(
            streams = self.registry.len(),
            transports = self.open_transports(),
            "Closing all transports"
        );
        self.supervisor.shutdown().await;
        info!("All transports closed");
    }
}
