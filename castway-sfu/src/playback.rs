//! Viewer (WHEP) sessions
//!
//! A [`PlaybackSession`] sits between the ingest fan-out and one viewer's
//! outbound video track. It only forwards packets from the layer the viewer
//! has selected, and rewrites sequence numbers and timestamps from its own
//! clock so the viewer sees one continuous stream across layer switches.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::codec::CodecKind;
use crate::error::{Result, SfuError};
use crate::layer::{LayerHandle, LayerSelector, RewriteClock, RewritePosition};
use crate::registry::StreamRegistry;
use crate::stream::Stream;
use crate::track::{is_closed_error, MultiCodecTrack, VideoSink};
use crate::transport::{self, SessionLifecycle, SessionState, Supervisor};
use crate::types::{LayerId, SessionId, StreamKey};

/// Outcome of offering a packet to a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Rewritten and written to the viewer's track
    Forwarded(RewritePosition),
    /// From a layer the viewer is not receiving
    Skipped,
    /// Accepted but the write failed
    Dropped,
}

/// One viewer's forwarding state
pub struct PlaybackSession {
    id: SessionId,
    sink: Arc<dyn VideoSink>,
    selector: LayerSelector,
    clock: RewriteClock,
    /// Requested layer the publisher has not sent yet
    pending_layer: Mutex<Option<LayerId>>,
}

impl PlaybackSession {
    pub fn new(id: SessionId, sink: Arc<dyn VideoSink>, initial_timestamp: u32) -> Self {
        Self {
            id,
            sink,
            selector: LayerSelector::new(),
            clock: RewriteClock::new(initial_timestamp),
            pending_layer: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Layer currently forwarded, `None` until the first video packet or switch
    #[must_use]
    pub fn current_layer(&self) -> Option<LayerHandle> {
        self.selector.current()
    }

    pub fn select_layer(&self, layer: LayerHandle) {
        *self.pending_layer.lock() = None;
        self.selector.select(layer);
    }

    /// Stop forwarding until the publisher starts sending `layer`
    pub fn await_layer(&self, layer: LayerId) {
        *self.pending_layer.lock() = Some(layer);
        self.selector.hold();
    }

    #[must_use]
    pub fn pending_layer(&self) -> Option<LayerId> {
        self.pending_layer.lock().clone()
    }

    /// Select `handle` if this viewer is waiting for `layer`
    pub fn resolve_pending(&self, layer: &LayerId, handle: LayerHandle) -> bool {
        let mut pending = self.pending_layer.lock();
        if pending.as_ref() != Some(layer) {
            return false;
        }
        *pending = None;
        self.selector.select(handle);
        true
    }

    /// Offer one video packet from `source` to this viewer.
    ///
    /// Never blocks on a lock: the layer check is a single atomic
    /// compare and the clock advance is a single atomic update.
    pub async fn accept(
        &self,
        packet: &Packet,
        source: LayerHandle,
        timestamp_delta: u32,
        codec: CodecKind,
    ) -> Delivery {
        if !self.selector.admit(source) {
            return Delivery::Skipped;
        }

        let position = self.clock.advance(timestamp_delta);
        let mut outgoing = packet.clone();
        outgoing.header.sequence_number = position.sequence_number;
        outgoing.header.timestamp = position.timestamp;

        match self.sink.write_rtp(&outgoing, codec).await {
            Ok(_) => Delivery::Forwarded(position),
            Err(e) if is_closed_error(&e) => Delivery::Dropped,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to write video packet");
                Delivery::Dropped
            }
        }
    }
}

/// Negotiate a viewer transport and attach a new session to the stream for `key`
pub(crate) async fn start(
    api: &API,
    registry: &Arc<StreamRegistry>,
    key: &StreamKey,
    offer: String,
    initial_timestamp: u32,
    supervisor: &Supervisor,
) -> Result<(String, SessionId)> {
    let stream = registry.get_or_create(key)?;
    let token = supervisor.session_token();
    let lifecycle = Arc::new(SessionLifecycle::new());

    let id = SessionId::generate();
    let video_track = Arc::new(MultiCodecTrack::new("video", key.to_string()));
    let session = Arc::new(PlaybackSession::new(
        id.clone(),
        Arc::clone(&video_track) as Arc<dyn VideoSink>,
        initial_timestamp,
    ));

    let result = async {
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
        supervisor.supervise(Arc::clone(&pc), token.clone());

        let audio_sender = pc
            .add_track(stream.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let video_sender = pc
            .add_track(video_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        {
            let lifecycle = Arc::clone(&lifecycle);
            let registry = Arc::clone(registry);
            let stream = Arc::clone(&stream);
            let id = id.clone();
            let token = token.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                if let Some(next) = SessionState::from_peer_state(state) {
                    if lifecycle.transition(next) && next.is_terminal() {
                        info!(stream_key = %stream.key(), session_id = %id, state = ?next, "Viewer disconnected");
                        on_viewer_terminal(&registry, &stream, &id, &token);
                    }
                }
                Box::pin(async {})
            }));
        }

        let answer = transport::negotiate(&pc, offer).await?;
        tokio::spawn(drain_rtcp(audio_sender, token.clone()));
        tokio::spawn(forward_viewer_feedback(
            video_sender,
            Arc::clone(&stream),
            Arc::clone(&session),
            token.clone(),
        ));
        Ok::<_, SfuError>(answer)
    }
    .await;

    match result {
        Ok(answer) => {
            stream.add_session(session);
            // The transport may already have failed while we were gathering
            if lifecycle.state().is_terminal() {
                on_viewer_terminal(registry, &stream, &id, &token);
            } else {
                info!(stream_key = %key, session_id = %id, "Viewer negotiated");
            }
            Ok((answer, id))
        }
        Err(e) => {
            lifecycle.transition(SessionState::Closed);
            on_viewer_terminal(registry, &stream, &id, &token);
            Err(e)
        }
    }
}

/// Detach a viewer whose transport is gone, dropping the stream if nothing else uses it
pub(crate) fn on_viewer_terminal(
    registry: &StreamRegistry,
    stream: &Arc<Stream>,
    id: &SessionId,
    token: &CancellationToken,
) {
    stream.remove_session(id);
    registry.remove_if_idle(stream);
    token.cancel();
}

/// Whether an RTCP packet from a viewer asks for a keyframe
pub(crate) fn is_keyframe_request(packet: &(dyn rtcp::packet::Packet + Send + Sync)) -> bool {
    let packet = packet.as_any();
    packet.is::<PictureLossIndication>() || packet.is::<FullIntraRequest>()
}

/// Queue one keyframe request per PLI or FIR, returning how many were queued
pub(crate) fn on_viewer_feedback(
    stream: &Stream,
    session: &PlaybackSession,
    packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
) -> usize {
    let mut queued = 0;
    for packet in packets {
        if is_keyframe_request(packet.as_ref()) && stream.request_keyframe(session.current_layer()) {
            queued += 1;
        }
    }
    queued
}

/// Turn keyframe feedback from a viewer into a request to the publisher
async fn forward_viewer_feedback(
    sender: Arc<RTCRtpSender>,
    stream: Arc<Stream>,
    session: Arc<PlaybackSession>,
    token: CancellationToken,
) {
    loop {
        let packets = tokio::select! {
            () = token.cancelled() => break,
            result = sender.read_rtcp() => match result {
                Ok((packets, _)) => packets,
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "Viewer RTCP reader stopped");
                    break;
                }
            },
        };

        on_viewer_feedback(&stream, &session, &packets);
    }
}

/// Read and discard RTCP so the sender's interceptors keep running
async fn drain_rtcp(sender: Arc<RTCRtpSender>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            result = sender.read_rtcp() => if result.is_err() {
                break;
            },
        }
    }
}
