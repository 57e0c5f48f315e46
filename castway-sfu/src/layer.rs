//! Simulcast layer selection and per-viewer RTP rewriting
//!
//! Layer names are interned per stream into small integer handles so the
//! forwarding hot path compares integers instead of strings. A viewer's
//! selected layer lives in an atomic, and its rewrite clock packs the
//! sequence number and timestamp into one atomic word, so accepting a packet
//! never takes a lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::types::LayerId;

const UNSET: u32 = 0;
/// Selector value while a viewer waits for a layer the publisher has not sent
const PENDING: u32 = u32::MAX;

/// Interned reference to a layer name within one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerHandle(u32);

impl LayerHandle {
    fn from_index(index: usize) -> Self {
        Self(u32::try_from(index + 1).unwrap_or(PENDING).min(PENDING - 1))
    }

    const fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

/// Per-stream table of layer names
///
/// Only publisher-driven code adds names, so the table is bounded by the
/// number of layers the publisher sends. Observed layers are advertised to
/// viewers in first-seen order.
#[derive(Debug, Default)]
pub struct LayerTable {
    names: Vec<LayerId>,
    observed: Vec<LayerHandle>,
}

impl LayerTable {
    #[must_use]
    pub fn lookup(&self, id: &LayerId) -> Option<LayerHandle> {
        self.names
            .iter()
            .position(|name| name == id)
            .map(LayerHandle::from_index)
    }

    /// Return the handle for `id`, adding it to the table if needed
    pub fn intern(&mut self, id: &LayerId) -> LayerHandle {
        if let Some(handle) = self.lookup(id) {
            return handle;
        }
        self.names.push(id.clone());
        LayerHandle::from_index(self.names.len() - 1)
    }

    /// Record that the publisher is sending `id`.
    ///
    /// Returns the handle and whether this is the first time it was observed.
    pub fn observe(&mut self, id: &LayerId) -> (LayerHandle, bool) {
        let handle = self.intern(id);
        if self.observed.contains(&handle) {
            (handle, false)
        } else {
            self.observed.push(handle);
            (handle, true)
        }
    }

    #[must_use]
    pub fn name(&self, handle: LayerHandle) -> Option<&LayerId> {
        self.names.get(handle.index())
    }

    /// Layers the publisher has sent, in first-seen order
    #[must_use]
    pub fn observed(&self) -> Vec<LayerId> {
        self.observed
            .iter()
            .filter_map(|handle| self.name(*handle).cloned())
            .collect()
    }
}

/// The layer a viewer is currently receiving
#[derive(Debug, Default)]
pub struct LayerSelector {
    current: AtomicU32,
}

impl LayerSelector {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(UNSET),
        }
    }

    /// Selected layer; `None` while unset or waiting for an unsent layer
    #[must_use]
    pub fn current(&self) -> Option<LayerHandle> {
        match self.current.load(Ordering::Acquire) {
            UNSET | PENDING => None,
            raw => Some(LayerHandle(raw)),
        }
    }

    pub fn select(&self, layer: LayerHandle) {
        self.current.store(layer.0, Ordering::Release);
    }

    /// Admit nothing until [`select`](Self::select) is called again
    pub fn hold(&self) {
        self.current.store(PENDING, Ordering::Release);
    }

    /// Decide whether a packet from `source` goes to this viewer.
    ///
    /// An unset selector pins itself to the first layer offered.
    pub fn admit(&self, source: LayerHandle) -> bool {
        match self
            .current
            .compare_exchange(UNSET, source.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == source.0,
        }
    }
}

/// Rewritten RTP header fields for one forwarded packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewritePosition {
    pub sequence_number: u16,
    pub timestamp: u32,
}

/// Synthetic sequence/timestamp counters owned by one viewer
///
/// Layout of the packed word: timestamp in bits 16..48, sequence number
/// in bits 0..16.
#[derive(Debug)]
pub struct RewriteClock {
    state: AtomicU64,
}

const fn pack(position: RewritePosition) -> u64 {
    ((position.timestamp as u64) << 16) | position.sequence_number as u64
}

const fn unpack(word: u64) -> RewritePosition {
    RewritePosition {
        sequence_number: (word & 0xFFFF) as u16,
        timestamp: (word >> 16) as u32,
    }
}

const fn step(word: u64, timestamp_delta: u32) -> u64 {
    let current = unpack(word);
    pack(RewritePosition {
        sequence_number: current.sequence_number.wrapping_add(1),
        timestamp: current.timestamp.wrapping_add(timestamp_delta),
    })
}

impl RewriteClock {
    #[must_use]
    pub const fn new(initial_timestamp: u32) -> Self {
        Self {
            state: AtomicU64::new(pack(RewritePosition {
                sequence_number: 0,
                timestamp: initial_timestamp,
            })),
        }
    }

    /// Advance by one packet and `timestamp_delta` ticks, returning the new position
    pub fn advance(&self, timestamp_delta: u32) -> RewritePosition {
        let previous = match self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            Some(step(word, timestamp_delta))
        }) {
            Ok(word) | Err(word) => word,
        };
        unpack(step(previous, timestamp_delta))
    }

    #[must_use]
    pub fn position(&self) -> RewritePosition {
        unpack(self.state.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut table = LayerTable::default();
        let a = table.intern(&LayerId::from("h"));
        let b = table.intern(&LayerId::from("h"));
        let c = table.intern(&LayerId::from("l"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.name(c), Some(&LayerId::from("l")));
    }

    #[test]
    fn test_observed_keeps_first_seen_order() {
        let mut table = LayerTable::default();
        // Requested by a viewer before the publisher sent it
        table.intern(&LayerId::from("l"));

        assert!(table.observe(&LayerId::from("h")).1);
        assert!(table.observe(&LayerId::from("l")).1);
        assert!(!table.observe(&LayerId::from("h")).1);

        assert_eq!(
            table.observed(),
            vec![LayerId::from("h"), LayerId::from("l")]
        );
    }

    #[test]
    fn test_held_selector_admits_nothing() {
        let mut table = LayerTable::default();
        let low = table.intern(&LayerId::from("low"));
        let high = table.intern(&LayerId::from("high"));

        let selector = LayerSelector::new();
        selector.hold();
        assert_eq!(selector.current(), None);
        assert!(!selector.admit(low));
        assert!(!selector.admit(high));

        selector.select(high);
        assert!(selector.admit(high));
    }

    #[test]
    fn test_interned_but_unobserved_layer_is_not_advertised() {
        let mut table = LayerTable::default();
        table.intern(&LayerId::from("ghost"));
        assert!(table.observed().is_empty());
    }

    #[test]
    fn test_selector_pins_first_layer() {
        let mut table = LayerTable::default();
        let low = table.intern(&LayerId::from("low"));
        let high = table.intern(&LayerId::from("high"));

        let selector = LayerSelector::new();
        assert_eq!(selector.current(), None);
        assert!(selector.admit(low));
        assert!(!selector.admit(high));
        assert!(selector.admit(low));
        assert_eq!(selector.current(), Some(low));

        selector.select(high);
        assert!(!selector.admit(low));
        assert!(selector.admit(high));
    }

    #[test]
    fn test_clock_sequence_is_contiguous() {
        let clock = RewriteClock::new(50_000);
        let first = clock.advance(0);
        assert_eq!(first.sequence_number, 1);
        assert_eq!(first.timestamp, 50_000);

        let second = clock.advance(3000);
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.timestamp, 53_000);
        assert_eq!(clock.position(), second);
    }

    #[test]
    fn test_clock_wraps_both_fields() {
        let clock = RewriteClock::new(u32::MAX - 10);
        for _ in 0..u16::MAX {
            clock.advance(0);
        }
        let position = clock.advance(20);
        assert_eq!(position.sequence_number, 0);
        assert_eq!(position.timestamp, 9);
    }
}
