//! End-to-end routing behavior through the public engine API, with
//! recording sinks standing in for viewer transports.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use castway_sfu::{
    CodecKind, LayerId, PlaybackSession, SessionId, SfuConfig, SfuManager, Stream, StreamKey,
    VideoForwarder, VideoSink,
};
use parking_lot::Mutex;
use webrtc::rtp::packet::Packet;

#[derive(Default)]
struct RecordingSink {
    packets: Mutex<Vec<Packet>>,
}

impl RecordingSink {
    fn sequence_numbers(&self) -> Vec<u16> {
        self.packets.lock().iter().map(|p| p.header.sequence_number).collect()
    }

    fn timestamps(&self) -> Vec<u32> {
        self.packets.lock().iter().map(|p| p.header.timestamp).collect()
    }

    fn payloads(&self) -> Vec<Bytes> {
        self.packets.lock().iter().map(|p| p.payload.clone()).collect()
    }
}

#[async_trait]
impl VideoSink for RecordingSink {
    async fn write_rtp(&self, packet: &Packet, _codec: CodecKind) -> Result<usize, webrtc::Error> {
        self.packets.lock().push(packet.clone());
        Ok(packet.payload.len())
    }
}

fn packet(sequence_number: u16, timestamp: u32, payload: &'static str) -> Packet {
    let mut packet = Packet::default();
    packet.header.sequence_number = sequence_number;
    packet.header.timestamp = timestamp;
    packet.payload = Bytes::from_static(payload.as_bytes());
    packet
}

fn attach_viewer(stream: &Stream) -> (Arc<PlaybackSession>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let session = Arc::new(PlaybackSession::new(
        SessionId::generate(),
        Arc::clone(&sink) as Arc<dyn VideoSink>,
        50_000,
    ));
    stream.add_session(Arc::clone(&session));
    (session, sink)
}

fn new_stream(key: &str) -> Arc<Stream> {
    Arc::new(Stream::new(StreamKey::from(key), &SfuConfig::default()))
}

#[tokio::test]
async fn test_sequence_numbers_are_contiguous_on_one_layer() {
    let stream = new_stream("live");
    let layer = stream.observe_layer(&LayerId::from("default"));
    let mut forwarder = VideoForwarder::new(Arc::clone(&stream), layer, CodecKind::H264);
    let (_, sink) = attach_viewer(&stream);

    // Upstream numbering has gaps; the viewer must not see them
    for (seq, ts) in [(100, 9000), (101, 9000), (105, 12_000), (200, 15_000)] {
        forwarder.forward(&packet(seq, ts, "x")).await;
    }

    assert_eq!(sink.sequence_numbers(), vec![1, 2, 3, 4]);
    assert_eq!(sink.timestamps(), vec![50_000, 50_000, 53_000, 56_000]);
}

#[tokio::test]
async fn test_packets_from_other_layer_never_reach_viewer() {
    let stream = new_stream("live");
    let low = stream.observe_layer(&LayerId::from("low"));
    let high = stream.observe_layer(&LayerId::from("high"));
    let mut low_forwarder = VideoForwarder::new(Arc::clone(&stream), low, CodecKind::H264);
    let mut high_forwarder = VideoForwarder::new(Arc::clone(&stream), high, CodecKind::H264);
    let (session, sink) = attach_viewer(&stream);

    low_forwarder.forward(&packet(1, 1000, "low")).await;
    high_forwarder.forward(&packet(1, 7000, "high")).await;
    low_forwarder.forward(&packet(2, 4000, "low")).await;
    high_forwarder.forward(&packet(2, 10_000, "high")).await;

    assert_eq!(session.current_layer(), Some(low));
    assert!(sink.payloads().iter().all(|payload| payload == "low"));
    assert_eq!(sink.sequence_numbers(), vec![1, 2]);
}

#[tokio::test]
async fn test_switch_keeps_clock_continuous_and_requests_one_keyframe() {
    let stream = new_stream("live");
    let mut keyframes = stream.take_keyframe_receiver().unwrap();
    let low = stream.observe_layer(&LayerId::from("low"));
    let high = stream.observe_layer(&LayerId::from("high"));
    let mut low_forwarder = VideoForwarder::new(Arc::clone(&stream), low, CodecKind::H264);
    let mut high_forwarder = VideoForwarder::new(Arc::clone(&stream), high, CodecKind::H264);
    let (session, sink) = attach_viewer(&stream);

    // The two layers use unrelated timestamp bases
    low_forwarder.forward(&packet(10, 1_000, "low")).await;
    high_forwarder.forward(&packet(500, 4_000_000, "high")).await;
    low_forwarder.forward(&packet(11, 4_000, "low")).await;

    assert!(stream.switch_layer(session.id(), &LayerId::from("high")));
    let request = keyframes.try_recv().unwrap();
    assert_eq!(request.layer, Some(high));
    assert!(keyframes.try_recv().is_err());

    low_forwarder.forward(&packet(12, 7_000, "low")).await;
    high_forwarder.forward(&packet(501, 4_003_000, "high")).await;
    low_forwarder.forward(&packet(13, 10_000, "low")).await;
    high_forwarder.forward(&packet(502, 4_006_000, "high")).await;

    let payloads = sink.payloads();
    assert_eq!(payloads, vec!["low", "low", "high", "high"]);
    assert_eq!(sink.sequence_numbers(), vec![1, 2, 3, 4]);
    // First high packet advances by the high layer's own frame interval
    assert_eq!(sink.timestamps(), vec![50_000, 53_000, 56_000, 59_000]);
    assert!(sink.timestamps().windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn test_single_layer_publisher_advertises_default_layer() {
    let manager = SfuManager::new(SfuConfig::default()).await.unwrap();
    let stream = manager
        .registry()
        .get_or_create(&StreamKey::from("live"))
        .unwrap();
    let layer = stream.observe_layer(&LayerId::new(manager.config().default_layer.clone()));
    let mut forwarder = VideoForwarder::new(Arc::clone(&stream), layer, CodecKind::H264);
    let (session, _sink) = attach_viewer(&stream);

    forwarder.forward(&packet(1, 0, "x")).await;

    assert_eq!(
        manager.list_layers(session.id()),
        vec![LayerId::from("default")]
    );
}

#[tokio::test]
async fn test_keyframe_queue_is_bounded() {
    let config = SfuConfig {
        keyframe_queue_capacity: 4,
        ..Default::default()
    };
    let stream = Stream::new(StreamKey::from("live"), &config);

    let accepted = (0..10).filter(|_| stream.request_keyframe(None)).count();
    assert_eq!(accepted, 4);

    let mut keyframes = stream.take_keyframe_receiver().unwrap();
    let mut observed = 0;
    while keyframes.try_recv().is_ok() {
        observed += 1;
    }
    assert_eq!(observed, 4);
}

#[tokio::test]
async fn test_fan_out_to_many_viewers_is_independent() {
    let stream = new_stream("live");
    let layer = stream.observe_layer(&LayerId::from("default"));
    let mut forwarder = VideoForwarder::new(Arc::clone(&stream), layer, CodecKind::H264);

    let (_, early) = attach_viewer(&stream);
    assert_eq!(forwarder.forward(&packet(1, 0, "a")).await, 1);
    let (_, late) = attach_viewer(&stream);
    assert_eq!(forwarder.forward(&packet(2, 3000, "b")).await, 2);

    assert_eq!(early.sequence_numbers(), vec![1, 2]);
    assert_eq!(late.sequence_numbers(), vec![1]);
    assert_eq!(late.timestamps(), vec![53_000]);
}
