//! WebRTC-backed peer link
//!
//! Production [`PeerLink`] implementation on top of the `webrtc` crate.
//! Compiled only with the `webrtc-link` feature (on by default).

use crate::link::{LinkConfig, LinkError, PeerLink, PeerLinkFactory};
use crate::media::LocalMedia;
use crate::types::{IceCandidate, MediaType, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Factory producing [`RtcPeerLink`]s
#[derive(Debug, Default)]
pub struct RtcLinkFactory;

#[async_trait]
impl PeerLinkFactory for RtcLinkFactory {
    async fn open(&self, config: &LinkConfig) -> Result<Arc<dyn PeerLink>, LinkError> {
        let link = RtcPeerLink::connect(config).await?;
        Ok(Arc::new(link))
    }
}

/// Peer link backed by an `RTCPeerConnection`
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    candidates: parking_lot::Mutex<Option<mpsc::Receiver<IceCandidate>>>,
}

impl RtcPeerLink {
    /// Open a peer connection with default codecs and interceptors
    async fn connect(config: &LinkConfig) -> Result<Self, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| LinkError::Negotiation(e.to_string()))?,
        );

        // Gathered candidates flow out through a bounded channel; the session
        // pumps them to the signaling relay.
        let (tx, rx) = mpsc::channel::<IceCandidate>(64);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            })
                            .await;
                    }
                    Err(e) => warn!("failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        Ok(Self {
            pc,
            candidates: parking_lot::Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_media(&self, media: &LocalMedia) -> Result<(), LinkError> {
        for track in media.tracks() {
            let capability = match track.kind {
                MediaType::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                MediaType::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id.clone(),
                "telecare".to_owned(),
            ));
            self.pc
                .add_track(local)
                .await
                .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| LinkError::Negotiation(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| LinkError::Candidate(e.to_string()))
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<IceCandidate>> {
        self.candidates.lock().take()
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.pc
            .close()
            .await
            .map_err(|e| LinkError::Negotiation(e.to_string()))
    }
}
