use thiserror::Error;

use crate::types::StreamKey;

pub type Result<T> = std::result::Result<T, SfuError>;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid SDP offer: {0}")]
    InvalidOffer(String),

    #[error("Local description unavailable after ICE gathering")]
    MissingLocalDescription,

    #[error("Stream {0} already has an active publisher")]
    StreamAlreadyPublishing(StreamKey),

    #[error("Maximum number of streams reached")]
    StreamLimitReached,

    #[error("Keyframe request queue already claimed for stream {0}")]
    KeyframeQueueClaimed(StreamKey),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
