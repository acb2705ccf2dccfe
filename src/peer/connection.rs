use crate::error::BackendError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::types::{
    IceCandidate, MediaKind, MediaTrack, RemoteTrackInfo, SdpType, ServerConfig,
    SessionDescription, TransportState,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "parley";

/// Asynchronous notifications from the negotiation object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    LocalCandidate(IceCandidate),
    TransportState(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

/// The offer/answer/ICE capability set of a native peer connection.
#[async_trait]
pub trait NegotiationBackend: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, BackendError>;
    async fn create_answer(&self) -> Result<SessionDescription, BackendError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), BackendError>;
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), BackendError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), BackendError>;
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), BackendError>;
    async fn close(&self) -> Result<(), BackendError>;
}

/// Builds one negotiation object per session. Events are delivered on
/// `events` until the object is closed.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Arc<dyn NegotiationBackend>, BackendError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcBackendFactory;

#[async_trait]
impl BackendFactory for WebRtcBackendFactory {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Arc<dyn NegotiationBackend>, BackendError> {
        let backend = WebRtcBackend::new(ice_servers, events).await?;
        Ok(Arc::new(backend))
    }
}

/// `NegotiationBackend` on top of webrtc-rs.
pub struct WebRtcBackend {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcBackend {
    pub async fn new(
        ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Self, BackendError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(cand) = cand else {
                    debug!("ICE candidate gathering completed");
                    return;
                };
                dump_candidate("LOCAL", &cand).await;
                match cand.to_json() {
                    Ok(init) => {
                        let _ = tx.send(BackendEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(error = %err, "could not serialise local candidate"),
                }
            })
        }));

        let tx = events.clone();
        let weak: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(state = ?st, "peer connection state changed");
            let mapped = match st {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                    Some(TransportState::Connecting)
                }
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                RTCPeerConnectionState::Unspecified => None,
            };
            if let Some(state) = mapped {
                let _ = tx.send(BackendEvent::TransportState(state));
            }
            let pc = weak.clone();
            Box::pin(async move {
                if st == RTCPeerConnectionState::Failed {
                    if let Some(pc) = pc.upgrade() {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    }
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            match kind {
                Some(kind) => {
                    info!(id = %track.id(), ?kind, "remote track received");
                    let _ = tx.send(BackendEvent::RemoteTrack(RemoteTrackInfo {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                }
                None => debug!(id = %track.id(), "ignoring remote track of unknown kind"),
            }
            Box::pin(async {})
        }));

        Ok(Self { pc })
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, BackendError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, BackendError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(BackendError::Rejected {
            operation: "describe session",
            reason: format!("unsupported description type {other}"),
        }),
    }
}

#[async_trait]
impl NegotiationBackend for WebRtcBackend {
    async fn create_offer(&self) -> Result<SessionDescription, BackendError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, BackendError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), BackendError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), BackendError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), BackendError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), BackendError> {
        let mime_type = match track.kind() {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        debug!(track = track.label(), kind = ?track.kind(), "local track added");
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Relay descriptors as the negotiation object expects them.
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
