//! Castway SFU (Selective Forwarding Unit)
//!
//! Routes one publisher's WHIP stream to any number of WHEP viewers.
//! Viewers can pick among the publisher's simulcast layers and switch
//! between them mid-stream without breaking their decoder.
//!
//! ## Architecture
//!
//! - **`StreamRegistry`**: stream key to live `Stream`
//! - **`Stream`**: shared audio track, observed video layers, attached
//!   viewers and the keyframe request queue
//! - **`VideoForwarder`**: fans one upstream video layer out to every viewer
//! - **`PlaybackSession`**: per-viewer layer selection and RTP rewriting
//! - **`SfuManager`**: negotiates publisher and viewer transports
//!
//! ## Usage
//!
//! ```rust,ignore
//! use castway_sfu::{SfuConfig, SfuManager, StreamKey};
//!
//! let manager = SfuManager::new(SfuConfig::default()).await?;
//! let answer = manager.ingest(offer_sdp, &StreamKey::from("my-stream")).await?;
//! let playback = manager.playback(viewer_offer_sdp, &StreamKey::from("my-stream")).await?;
//! let layers = manager.list_layers(&playback.session_id);
//! ```

mod codec;
mod config;
mod error;
mod ingest;
mod keyframe;
mod layer;
mod manager;
mod playback;
mod registry;
mod stream;
mod track;
mod transport;
mod types;

pub use codec::{register_codecs, CodecKind, MIME_TYPE_AV1};
pub use config::SfuConfig;
pub use error::{Result, SfuError};
pub use ingest::VideoForwarder;
pub use keyframe::{KeyframeRequest, KeyframeRequests};
pub use layer::{LayerHandle, LayerSelector, LayerTable, RewriteClock, RewritePosition};
pub use manager::{PlaybackAnswer, SfuManager};
pub use playback::{Delivery, PlaybackSession};
pub use registry::StreamRegistry;
pub use stream::Stream;
pub use track::{is_closed_error, MultiCodecTrack, TrackKind, VideoSink};
pub use transport::{SessionLifecycle, SessionState};
pub use types::{LayerId, SessionId, StreamKey};
