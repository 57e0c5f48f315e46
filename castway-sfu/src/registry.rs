//! Stream registry - maps stream keys to live streams

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::playback::PlaybackSession;
use crate::stream::Stream;
use crate::types::{SessionId, StreamKey};

/// Owns every live [`Stream`], keyed by stream key
pub struct StreamRegistry {
    config: Arc<SfuConfig>,

    /// Structural mutation (insert/delete) happens under this lock only
    streams: Mutex<HashMap<StreamKey, Arc<Stream>>>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new(config: Arc<SfuConfig>) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Get the stream for `key`, creating it if absent.
    ///
    /// Check and insert happen under one lock, so concurrent callers with
    /// the same key always receive the same instance.
    pub fn get_or_create(&self, key: &StreamKey) -> Result<Arc<Stream>> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(key) {
            return Ok(Arc::clone(stream));
        }

        // Enforce stream limit (0 = unlimited)
        if self.config.max_streams > 0 && streams.len() >= self.config.max_streams {
            warn!(
                current_streams = streams.len(),
                max_streams = self.config.max_streams,
                "Stream limit reached"
            );
            return Err(SfuError::StreamLimitReached);
        }

        let stream = Arc::new(Stream::new(key.clone(), &self.config));
        streams.insert(key.clone(), Arc::clone(&stream));
        info!(stream_key = %key, total_streams = streams.len(), "Created stream");
        Ok(stream)
    }

    #[must_use]
    pub fn get(&self, key: &StreamKey) -> Option<Arc<Stream>> {
        self.streams.lock().get(key).cloned()
    }

    /// Remove the entry for `key`; a no-op when absent
    pub fn delete(&self, key: &StreamKey) -> Option<Arc<Stream>> {
        let removed = self.streams.lock().remove(key);
        if removed.is_some() {
            info!(stream_key = %key, "Deleted stream");
        }
        removed
    }

    /// Remove `stream` only if it is still the instance registered under its key
    pub fn remove_instance(&self, stream: &Arc<Stream>) -> bool {
        let mut streams = self.streams.lock();
        match streams.get(stream.key()) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                streams.remove(stream.key());
                info!(stream_key = %stream.key(), "Deleted stream");
                true
            }
            _ => false,
        }
    }

    /// Remove `stream` if it is registered and has neither publisher nor viewers
    pub fn remove_if_idle(&self, stream: &Arc<Stream>) -> bool {
        let mut streams = self.streams.lock();
        match streams.get(stream.key()) {
            Some(current) if Arc::ptr_eq(current, stream) && stream.is_idle() => {
                streams.remove(stream.key());
                debug!(stream_key = %stream.key(), "Deleted idle stream");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the registered keys
    #[must_use]
    pub fn stream_keys(&self) -> Vec<StreamKey> {
        self.streams.lock().keys().cloned().collect()
    }

    /// Snapshot of the registered streams
    #[must_use]
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.lock().values().cloned().collect()
    }

    /// Find the stream a viewer session is attached to.
    ///
    /// The registry lock is released before any stream lock is taken.
    #[must_use]
    pub fn find_session(&self, id: &SessionId) -> Option<(Arc<Stream>, Arc<PlaybackSession>)> {
        self.streams()
            .into_iter()
            .find_map(|stream| stream.session(id).map(|session| (stream, session)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::tests::{session_with_sink, RecordingSink};

    fn registry() -> StreamRegistry {
        StreamRegistry::new(Arc::new(SfuConfig::default()))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = registry();
        let key = StreamKey::from("live");

        let a = registry.get_or_create(&key).unwrap();
        let b = registry.get_or_create(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stream_limit() {
        let registry = StreamRegistry::new(Arc::new(SfuConfig {
            max_streams: 2,
            ..Default::default()
        }));

        registry.get_or_create(&StreamKey::from("a")).unwrap();
        registry.get_or_create(&StreamKey::from("b")).unwrap();
        assert!(matches!(
            registry.get_or_create(&StreamKey::from("c")),
            Err(SfuError::StreamLimitReached)
        ));
        // Existing keys are still served at the limit
        assert!(registry.get_or_create(&StreamKey::from("a")).is_ok());
    }

    #[test]
    fn test_delete_absent_key_is_noop() {
        let registry = registry();
        assert!(registry.delete(&StreamKey::from("missing")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_instance_ignores_replacement() {
        let registry = registry();
        let key = StreamKey::from("live");

        let old = registry.get_or_create(&key).unwrap();
        registry.delete(&key);
        let new = registry.get_or_create(&key).unwrap();

        assert!(!registry.remove_instance(&old));
        assert_eq!(registry.stream_keys(), vec![key.clone()]);
        assert!(registry.remove_instance(&new));
        assert!(registry.stream_keys().is_empty());
    }

    #[test]
    fn test_remove_if_idle_keeps_watched_stream() {
        let registry = registry();
        let stream = registry.get_or_create(&StreamKey::from("live")).unwrap();
        let session = session_with_sink(Arc::new(RecordingSink::default()));
        let id = session.id().clone();
        stream.add_session(session);

        assert!(!registry.remove_if_idle(&stream));
        stream.remove_session(&id);
        assert!(registry.remove_if_idle(&stream));
    }

    #[test]
    fn test_find_session() {
        let registry = registry();
        registry.get_or_create(&StreamKey::from("other")).unwrap();
        let stream = registry.get_or_create(&StreamKey::from("live")).unwrap();
        let session = session_with_sink(Arc::new(RecordingSink::default()));
        let id = session.id().clone();
        stream.add_session(session);

        let (found, _) = registry.find_session(&id).unwrap();
        assert!(Arc::ptr_eq(&found, &stream));
        assert!(registry.find_session(&SessionId::from("missing")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create() {
        let registry = Arc::new(registry());
        let key = StreamKey::from("race");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                tokio::spawn(async move { registry.get_or_create(&key).unwrap() })
            })
            .collect();

        let mut streams = Vec::new();
        for handle in handles {
            streams.push(handle.await.unwrap());
        }
        assert!(streams.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.len(), 1);
    }
}
