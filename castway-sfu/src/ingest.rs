//! Publisher (WHIP) sessions
//!
//! Audio is written straight to the stream's shared audio track. Each video
//! layer gets its own read loop that offers every packet to every viewer of
//! the stream. A relay task turns queued keyframe requests into PLIs sent
//! back to the publisher.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::CodecKind;
use crate::error::{Result, SfuError};
use crate::keyframe::KeyframeRequest;
use crate::layer::LayerHandle;
use crate::playback::Delivery;
use crate::registry::StreamRegistry;
use crate::stream::Stream;
use crate::track::{is_closed_error, TrackKind};
use crate::transport::{self, SessionLifecycle, SessionState, Supervisor};
use crate::types::{LayerId, StreamKey};

/// Fans one upstream video layer out to a stream's viewers
pub struct VideoForwarder {
    stream: Arc<Stream>,
    layer: LayerHandle,
    codec: CodecKind,
    last_timestamp: Option<u32>,
}

impl VideoForwarder {
    #[must_use]
    pub const fn new(stream: Arc<Stream>, layer: LayerHandle, codec: CodecKind) -> Self {
        Self {
            stream,
            layer,
            codec,
            last_timestamp: None,
        }
    }

    /// Ticks since the previous packet of this layer.
    ///
    /// Zero for the first packet. A packet older than the last one seen
    /// also yields zero and leaves the reference point where it was.
    pub fn timestamp_delta(&mut self, timestamp: u32) -> u32 {
        let Some(last) = self.last_timestamp else {
            self.last_timestamp = Some(timestamp);
            return 0;
        };

        let delta = timestamp.wrapping_sub(last);
        if delta > i32::MAX as u32 {
            return 0;
        }
        self.last_timestamp = Some(timestamp);
        delta
    }

    /// Offer `packet` to every viewer, returning how many it was forwarded to
    pub async fn forward(&mut self, packet: &Packet) -> usize {
        let delta = self.timestamp_delta(packet.header.timestamp);

        let mut forwarded = 0;
        for session in self.stream.sessions() {
            if let Delivery::Forwarded(_) = session.accept(packet, self.layer, delta, self.codec).await {
                forwarded += 1;
            }
        }
        forwarded
    }
}

/// SSRCs of the publisher's video layers, used to address PLIs
#[derive(Debug, Default)]
pub(crate) struct UpstreamSources {
    ssrcs: Mutex<Vec<(LayerHandle, u32)>>,
}

impl UpstreamSources {
    pub fn insert(&self, layer: LayerHandle, ssrc: u32) {
        let mut ssrcs = self.ssrcs.lock();
        ssrcs.retain(|(known, _)| *known != layer);
        ssrcs.push((layer, ssrc));
    }

    /// SSRCs to ask for a keyframe: the requested layer's, or every layer's
    /// when the layer is unset or not being sent
    pub fn targets(&self, layer: Option<LayerHandle>) -> Vec<u32> {
        let ssrcs = self.ssrcs.lock();
        if let Some(layer) = layer {
            if let Some((_, ssrc)) = ssrcs.iter().find(|(known, _)| *known == layer) {
                return vec![*ssrc];
            }
        }
        ssrcs.iter().map(|(_, ssrc)| *ssrc).collect()
    }
}

/// Malformed packets are skipped; any other read error ends the track
fn is_recoverable_read_error(err: &webrtc::Error) -> bool {
    matches!(err, webrtc::Error::Rtp(_))
}

/// Negotiate a publisher transport for `key` and start forwarding its media
pub(crate) async fn start(
    api: &API,
    registry: &Arc<StreamRegistry>,
    key: &StreamKey,
    offer: String,
    default_layer: LayerId,
    supervisor: &Supervisor,
) -> Result<String> {
    let stream = registry.get_or_create(key)?;
    if !stream.claim_publisher() {
        return Err(SfuError::StreamAlreadyPublishing(key.clone()));
    }

    let token = supervisor.session_token();
    let lifecycle = Arc::new(SessionLifecycle::new());

    let result = async {
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
        supervisor.supervise(Arc::clone(&pc), token.clone());
        let sources = Arc::new(UpstreamSources::default());

        {
            let stream = Arc::clone(&stream);
            let sources = Arc::clone(&sources);
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                    on_track(&stream, &sources, &default_layer, track);
                    Box::pin(async {})
                },
            ));
        }

        {
            let lifecycle = Arc::clone(&lifecycle);
            let registry = Arc::clone(registry);
            let stream = Arc::clone(&stream);
            let token = token.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                if let Some(next) = SessionState::from_peer_state(state) {
                    if lifecycle.transition(next) {
                        if next.is_terminal() {
                            info!(stream_key = %stream.key(), state = ?next, "Publisher disconnected");
                            on_publisher_terminal(&registry, &stream, &token);
                        } else {
                            info!(stream_key = %stream.key(), "Publisher connected");
                        }
                    }
                }
                Box::pin(async {})
            }));
        }

        let answer = transport::negotiate(&pc, offer).await?;
        let requests = stream
            .take_keyframe_receiver()
            .ok_or_else(|| SfuError::KeyframeQueueClaimed(key.clone()))?;
        tokio::spawn(relay_keyframes(requests, pc, sources, token.clone()));
        Ok::<_, SfuError>(answer)
    }
    .await;

    match result {
        Ok(answer) => {
            info!(stream_key = %key, "Publisher negotiated");
            Ok(answer)
        }
        Err(e) => {
            if lifecycle.transition(SessionState::Closed) {
                on_negotiation_failed(registry, &stream, &token);
            }
            Err(e)
        }
    }
}

/// Drop the stream a lost publisher was feeding. Its viewers stay attached
/// to the removed instance until their own transports go away.
pub(crate) fn on_publisher_terminal(registry: &StreamRegistry, stream: &Arc<Stream>, token: &CancellationToken) {
    registry.remove_instance(stream);
    stream.release_publisher();
    token.cancel();
}

/// Give the publisher slot back; the stream only goes if nobody else uses it
fn on_negotiation_failed(registry: &StreamRegistry, stream: &Arc<Stream>, token: &CancellationToken) {
    token.cancel();
    stream.release_publisher();
    registry.remove_if_idle(stream);
}

fn on_track(stream: &Arc<Stream>, sources: &Arc<UpstreamSources>, default_layer: &LayerId, track: Arc<TrackRemote>) {
    let mime_type = track.codec().capability.mime_type;
    match TrackKind::from_codec_type(track.kind()) {
        Some(TrackKind::Audio) => {
            debug!(stream_key = %stream.key(), codec = %mime_type, "Publisher audio track");
            tokio::spawn(forward_audio(track, stream.audio_track()));
        }
        Some(TrackKind::Video) => {
            let codec = CodecKind::from_mime_type(&mime_type);
            if !codec.is_forwardable_video() {
                warn!(stream_key = %stream.key(), codec = %mime_type, "Ignoring video track with unsupported codec");
                return;
            }

            let layer = match track.rid() {
                "" => default_layer.clone(),
                rid => LayerId::from(rid),
            };
            let handle = stream.observe_layer(&layer);
            sources.insert(handle, track.ssrc());
            debug!(stream_key = %stream.key(), layer = %layer, ssrc = track.ssrc(), codec = %mime_type, "Publisher video track");

            let forwarder = VideoForwarder::new(Arc::clone(stream), handle, codec);
            tokio::spawn(forward_video(track, forwarder));
        }
        None => {}
    }
}

async fn forward_audio(track: Arc<TrackRemote>, sink: Arc<TrackLocalStaticRTP>) {
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) if is_recoverable_read_error(&e) => {
                warn!(error = %e, "Dropping malformed audio packet");
                continue;
            }
            Err(e) => {
                debug!(error = %e, "Audio track ended");
                break;
            }
        };

        if let Err(e) = sink.write_rtp(&packet).await {
            if !is_closed_error(&e) {
                debug!(error = %e, "Failed to write audio packet");
            }
        }
    }
}

async fn forward_video(track: Arc<TrackRemote>, mut forwarder: VideoForwarder) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                forwarder.forward(&packet).await;
            }
            Err(e) if is_recoverable_read_error(&e) => {
                warn!(ssrc = track.ssrc(), error = %e, "Dropping malformed video packet");
            }
            Err(e) => {
                debug!(ssrc = track.ssrc(), error = %e, "Video track ended");
                break;
            }
        }
    }
}

/// Destination for RTCP sent back to the publisher
#[async_trait]
pub(crate) trait RtcpWriter: Send + Sync {
    async fn write_rtcp(
        &self,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> std::result::Result<usize, webrtc::Error>;
}

#[async_trait]
impl RtcpWriter for RTCPeerConnection {
    async fn write_rtcp(
        &self,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> std::result::Result<usize, webrtc::Error> {
        Self::write_rtcp(self, packets).await
    }
}

/// Send one RTCP write of PLIs upstream per queued keyframe request
async fn relay_keyframes(
    mut requests: mpsc::Receiver<KeyframeRequest>,
    writer: Arc<dyn RtcpWriter>,
    sources: Arc<UpstreamSources>,
    token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            () = token.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = sources
            .targets(request.layer)
            .into_iter()
            .map(|media_ssrc| {
                Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                }) as Box<dyn rtcp::packet::Packet + Send + Sync>
            })
            .collect();
        if packets.is_empty() {
            continue;
        }

        if let Err(e) = writer.write_rtcp(&packets).await {
            debug!(error = %e, "Keyframe relay stopped");
            break;
        }
    }
}
