//! WebRTC transport construction, SDP negotiation and session lifecycle

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::codec::register_codecs;
use crate::config::SfuConfig;
use crate::error::{Result, SfuError};

/// The publish-side and playback-side WebRTC APIs
pub(crate) struct Transports {
    pub whip: API,
    pub whep: API,
}

impl Transports {
    /// Build both APIs, binding any configured UDP mux sockets.
    ///
    /// Publish and playback share one mux when they are configured with
    /// the same port.
    pub async fn new(config: &SfuConfig) -> Result<Self> {
        let mut muxes: HashMap<u16, Arc<UDPMuxDefault>> = HashMap::new();

        let whip_mux = match config.whip_mux_port() {
            Some(port) => Some(udp_mux(&mut muxes, port).await?),
            None => None,
        };
        let whep_mux = match config.whep_mux_port() {
            Some(port) => Some(udp_mux(&mut muxes, port).await?),
            None => None,
        };

        Ok(Self {
            whip: build_api(config, whip_mux)?,
            whep: build_api(config, whep_mux)?,
        })
    }
}

async fn udp_mux(
    muxes: &mut HashMap<u16, Arc<UDPMuxDefault>>,
    port: u16,
) -> Result<Arc<UDPMuxDefault>> {
    if let Some(mux) = muxes.get(&port) {
        return Ok(Arc::clone(mux));
    }
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!(port, "Listening for ICE on UDP mux");
    let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
    muxes.insert(port, Arc::clone(&mux));
    Ok(mux)
}

fn build_api(config: &SfuConfig, mux: Option<Arc<UDPMuxDefault>>) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if !config.nat_1to1_ips.is_empty() {
        setting_engine.set_nat_1to1_ips(config.nat_1to1_ips.clone(), RTCIceCandidateType::Host);
    }
    if let Some(interface) = config.interface_filter.clone() {
        setting_engine.set_interface_filter(Box::new(move |name: &str| name == interface));
    }
    if let Some(mux) = mux {
        setting_engine.set_udp_network(UDPNetwork::Muxed(mux));
    } else if let (Some(min), Some(max)) = (config.udp_port_min, config.udp_port_max) {
        let ephemeral = EphemeralUDP::new(min, max).map_err(webrtc::Error::from)?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Answer `offer` and return the local SDP once ICE gathering has finished
pub(crate) async fn negotiate(pc: &RTCPeerConnection, offer: String) -> Result<String> {
    let offer = RTCSessionDescription::offer(offer)
        .map_err(|e| SfuError::InvalidOffer(e.to_string()))?;
    pc.set_remote_description(offer)
        .await
        .map_err(|e| SfuError::InvalidOffer(e.to_string()))?;

    let answer = pc.create_answer(None).await?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    pc.local_description()
        .await
        .map(|description| description.sdp)
        .ok_or(SfuError::MissingLocalDescription)
}

/// Owns the lifetime of every peer connection the manager creates
#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Supervisor {
    /// Token for one transport; cancelled by its own cleanup or by [`shutdown`](Self::shutdown)
    pub fn session_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Close `pc` once `token` is cancelled.
    ///
    /// The spawned task holds the only long-lived strong reference to the
    /// peer connection.
    pub fn supervise(&self, pc: Arc<RTCPeerConnection>, token: CancellationToken) {
        self.tasks.spawn(async move {
            token.cancelled().await;
            if let Err(e) = pc.close().await {
                debug!(error = %e, "Error closing peer connection");
            }
        });
    }

    /// Number of peer connections not yet closed
    pub fn open_transports(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every transport and wait until all of them are closed
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Lifecycle of a publisher or viewer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Negotiating = 0,
    Connected = 1,
    Failed = 2,
    Closed = 3,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Map a peer connection state; `None` for states that change nothing
    #[must_use]
    pub const fn from_peer_state(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::Connected => Some(Self::Connected),
            RTCPeerConnectionState::Failed => Some(Self::Failed),
            RTCPeerConnectionState::Closed => Some(Self::Closed),
            _ => None,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Negotiating,
            1 => Self::Connected,
            2 => Self::Failed,
            _ => Self::Closed,
        }
    }
}

/// Atomic [`SessionState`] with absorbing terminal states
#[derive(Debug)]
pub struct SessionLifecycle {
    state: AtomicU8,
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifecycle {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Negotiating as u8),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`, returning `true` only if the state actually changed.
    ///
    /// Terminal states never change again, so whoever gets `true` for a
    /// terminal transition is the one that runs cleanup.
    pub fn transition(&self, next: SessionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = SessionState::from_raw(raw);
                if current.is_terminal() || current == next || next == SessionState::Negotiating {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    #[test]
    fn test_lifecycle_terminal_is_absorbing() {
        let lifecycle = SessionLifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Negotiating);

        assert!(lifecycle.transition(SessionState::Connected));
        assert!(!lifecycle.transition(SessionState::Connected));
        assert!(lifecycle.transition(SessionState::Failed));
        assert!(!lifecycle.transition(SessionState::Closed));
        assert!(!lifecycle.transition(SessionState::Connected));
        assert_eq!(lifecycle.state(), SessionState::Failed);
    }

    #[test]
    fn test_lifecycle_never_returns_to_negotiating() {
        let lifecycle = SessionLifecycle::new();
        assert!(lifecycle.transition(SessionState::Connected));
        assert!(!lifecycle.transition(SessionState::Negotiating));
        assert_eq!(lifecycle.state(), SessionState::Connected);
    }

    #[test]
    fn test_peer_state_mapping() {
        assert_eq!(
            SessionState::from_peer_state(RTCPeerConnectionState::Failed),
            Some(SessionState::Failed)
        );
        assert_eq!(
            SessionState::from_peer_state(RTCPeerConnectionState::Disconnected),
            None
        );
        assert_eq!(SessionState::from_peer_state(RTCPeerConnectionState::Connecting), None);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_garbage_offer() {
        let transports = Transports::new(&SfuConfig::default()).await.unwrap();
        let pc = transports
            .whip
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();

        let result = negotiate(&pc, "not an sdp".to_string()).await;
        assert!(matches!(result, Err(SfuError::InvalidOffer(_))));
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_supervisor_shutdown_closes_and_waits() {
        let transports = Transports::new(&SfuConfig::default()).await.unwrap();
        let supervisor = Supervisor::default();
        let token = supervisor.session_token();
        let pc = Arc::new(
            transports
                .whip
                .new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        supervisor.supervise(Arc::clone(&pc), token.clone());
        assert_eq!(supervisor.open_transports(), 1);

        supervisor.shutdown().await;
        assert!(token.is_cancelled());
        assert_eq!(supervisor.open_transports(), 0);
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_session_token_cancels_one_transport() {
        let supervisor = Supervisor::default();
        let first = supervisor.session_token();
        let second = supervisor.session_token();

        first.cancel();
        assert!(!second.is_cancelled());
        supervisor.shutdown().await;
        assert!(second.is_cancelled());
    }
}
