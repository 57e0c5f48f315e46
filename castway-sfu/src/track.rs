//! Outbound media tracks for viewers
//!
//! A viewer's video track must carry whichever codec the publisher sends,
//! so it binds every negotiated H.264 and AV1 payload type up front and
//! stamps the right one on each packet.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::{TrackLocal, TrackLocalContext, TrackLocalWriter};

use crate::codec::CodecKind;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

/// Destination for a viewer's rewritten video packets
#[async_trait]
pub trait VideoSink: Send + Sync {
    /// Write a packet whose payload is encoded with `codec`.
    ///
    /// The sink sets the payload type and SSRC; sequence number and
    /// timestamp are written as given.
    async fn write_rtp(&self, packet: &Packet, codec: CodecKind) -> Result<usize, webrtc::Error>;
}

/// Whether a write error means the viewer's transport is gone for good
#[must_use]
pub fn is_closed_error(err: &webrtc::Error) -> bool {
    matches!(
        err,
        webrtc::Error::ErrClosedPipe
            | webrtc::Error::ErrConnectionClosed
            | webrtc::Error::Util(webrtc::util::Error::ErrBufferClosed)
    )
}

struct Binding {
    id: String,
    ssrc: u32,
    h264_payload_type: Option<u8>,
    av1_payload_type: Option<u8>,
    write_stream: Arc<dyn TrackLocalWriter + Send + Sync>,
}

impl Binding {
    const fn payload_type(&self, codec: CodecKind) -> Option<u8> {
        match codec {
            CodecKind::H264 => self.h264_payload_type,
            CodecKind::Av1 => self.av1_payload_type,
            CodecKind::Opus | CodecKind::Other => None,
        }
    }
}

/// Outbound video track able to carry H.264 or AV1 on the same transceiver
pub struct MultiCodecTrack {
    id: String,
    stream_id: String,
    bindings: Mutex<Vec<Arc<Binding>>>,
}

impl MultiCodecTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            bindings: Mutex::new(Vec::new()),
        }
    }
}

fn first_codec(codecs: &[RTCRtpCodecParameters], kind: CodecKind) -> Option<&RTCRtpCodecParameters> {
    codecs
        .iter()
        .find(|codec| CodecKind::from_mime_type(&codec.capability.mime_type) == kind)
}

#[async_trait]
impl TrackLocal for MultiCodecTrack {
    async fn bind(&self, t: &TrackLocalContext) -> webrtc::error::Result<RTCRtpCodecParameters> {
        let codecs = t.codec_parameters();
        let h264 = first_codec(codecs, CodecKind::H264);
        let av1 = first_codec(codecs, CodecKind::Av1);

        let Some(negotiated) = h264.or(av1).cloned() else {
            return Err(webrtc::Error::ErrUnsupportedCodec);
        };
        let Some(write_stream) = t.write_stream() else {
            return Err(webrtc::Error::new("track bound without a write stream".to_string()));
        };

        debug!(
            track_id = %self.id,
            ssrc = t.ssrc(),
            h264 = ?h264.map(|c| c.payload_type),
            av1 = ?av1.map(|c| c.payload_type),
            "Bound outbound video track"
        );

        self.bindings.lock().push(Arc::new(Binding {
            id: t.id(),
            ssrc: t.ssrc(),
            h264_payload_type: h264.map(|c| c.payload_type),
            av1_payload_type: av1.map(|c| c.payload_type),
            write_stream,
        }));

        Ok(negotiated)
    }

    async fn unbind(&self, t: &TrackLocalContext) -> webrtc::error::Result<()> {
        let id = t.id();
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|binding| binding.id != id);
        if bindings.len() == before {
            return Err(webrtc::Error::ErrUnbindFailed);
        }
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn kind(&self) -> RTPCodecType {
        RTPCodecType::Video
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl VideoSink for MultiCodecTrack {
    async fn write_rtp(&self, packet: &Packet, codec: CodecKind) -> Result<usize, webrtc::Error> {
        let bindings = self.bindings.lock().clone();

        let mut written = 0;
        let mut last_error = None;
        for binding in bindings {
            let Some(payload_type) = binding.payload_type(codec) else {
                continue;
            };
            let mut outgoing = packet.clone();
            outgoing.header.ssrc = binding.ssrc;
            outgoing.header.payload_type = payload_type;
            match binding.write_stream.write_rtp(&outgoing).await {
                Ok(n) => written += n,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if written == 0 => Err(e),
            _ => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_from_codec_type() {
        assert_eq!(TrackKind::from_codec_type(RTPCodecType::Audio), Some(TrackKind::Audio));
        assert_eq!(TrackKind::from_codec_type(RTPCodecType::Video), Some(TrackKind::Video));
        assert_eq!(TrackKind::from_codec_type(RTPCodecType::Unspecified), None);
    }

    #[test]
    fn test_closed_errors() {
        assert!(is_closed_error(&webrtc::Error::ErrClosedPipe));
        assert!(is_closed_error(&webrtc::Error::ErrConnectionClosed));
        assert!(!is_closed_error(&webrtc::Error::ErrUnsupportedCodec));
    }

    #[tokio::test]
    async fn test_unbound_track_writes_nothing() {
        let track = MultiCodecTrack::new("video", "castway");
        let written = VideoSink::write_rtp(&track, &Packet::default(), CodecKind::H264)
            .await
            .unwrap();
        assert_eq!(written, 0);
    }
}
