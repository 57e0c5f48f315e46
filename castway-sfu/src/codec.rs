//! Codec identification and media engine setup

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

pub const MIME_TYPE_AV1: &str = "video/AV1";
const MIME_TYPE_RTX: &str = "video/rtx";

/// Header extensions needed to demultiplex simulcast layers by RID
const VIDEO_HEADER_EXTENSIONS: [&str; 3] = [
    "urn:ietf:params:rtp-hdrext:sdes:mid",
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
];

/// Codec family of a media track, resolved once when the track is set up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264,
    Av1,
    Opus,
    Other,
}

impl CodecKind {
    /// Resolve from a negotiated MIME type such as `video/H264`
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Self {
        if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            Self::H264
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_AV1) {
            Self::Av1
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
            Self::Opus
        } else {
            Self::Other
        }
    }

    /// Whether a viewer's outbound video track can carry this codec
    #[must_use]
    pub const fn is_forwardable_video(&self) -> bool {
        matches!(self, Self::H264 | Self::Av1)
    }
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn video_codec(mime_type: &str, fmtp: &str, payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_string(),
            rtcp_feedback: video_feedback(),
        },
        payload_type,
        ..Default::default()
    }
}

fn rtx_codec(apt: u8, payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_RTX.to_string(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: format!("apt={apt}"),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    }
}

/// Register the codecs and header extensions this server negotiates
///
/// Audio is Opus only. Video offers several H.264 profiles and AV1,
/// each with an RTX companion.
pub fn register_codecs(media_engine: &mut MediaEngine) -> Result<(), webrtc::Error> {
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let video_codecs = [
        (MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f", 102, 121),
        (MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f", 127, 120),
        (MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f", 125, 107),
        (MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f", 108, 109),
        (MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032", 123, 118),
        (MIME_TYPE_AV1, "", 45, 46),
    ];

    for (mime_type, fmtp, payload_type, rtx_payload_type) in video_codecs {
        media_engine.register_codec(video_codec(mime_type, fmtp, payload_type), RTPCodecType::Video)?;
        media_engine.register_codec(rtx_codec(payload_type, rtx_payload_type), RTPCodecType::Video)?;
    }

    for uri in VIDEO_HEADER_EXTENSIONS {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: uri.to_string(),
            },
            RTPCodecType::Video,
            None,
        )?;
    }

    Ok(())
}
