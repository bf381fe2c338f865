use crate::config::IceServerConfig;
use crate::error::{Error, Result};
use crate::logger::dump_selected_pair;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::state::ConnectionState;
use crate::peer::transport::{
    Connector, PeerTransport, SenderId, SenderInfo, Subscription, TransportEvent,
};
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
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
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Creates webrtc-rs peer connections with a fixed ICE server list.
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(RtcTransport::new(&self.ice_servers).await?))
    }
}

/// Peer connection configuration: the given servers, max-bundle, mandatory RTCP mux.
fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers_from_config(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers_from_config(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// [`PeerTransport`] backed by an `RTCPeerConnection`.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api.new_peer_connection(rtc_config(ice_servers)).await?;
        debug!(servers = ice_servers.len(), "peer connection created");
        Ok(Self { pc: Arc::new(pc) })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(Error::InvalidDescription(
                "rollback is applied from the pending local offer".into(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::InvalidDescription("unspecified sdp type".into()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn subscribe(&self, tx: mpsc::UnboundedSender<TransportEvent>) -> Subscription {
        let (subscription, sink) = Subscription::new(tx);

        let negotiation = sink.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            negotiation.emit(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let candidates = sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => {
                        candidates.emit(TransportEvent::LocalCandidate(Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })));
                    }
                    Some(Err(e)) => warn!(error = %e, "could not serialize local candidate"),
                    // end of gathering
                    None => {
                        candidates.emit(TransportEvent::LocalCandidate(None));
                    }
                }
                Box::pin(async {})
            }));

        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let tracks = sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(kind) = TrackKind::from_codec_type(track.kind()) {
                    let stream_id = track.stream_id().to_string();
                    tracks.emit(TransportEvent::RemoteTrack {
                        track: RemoteTrack {
                            id: track.id().to_string(),
                            kind,
                            stream_id: stream_id.clone(),
                            remote: Some(Arc::clone(&track)),
                        },
                        streams: vec![stream_id],
                    });
                }
                Box::pin(async {})
            },
        ));

        // Weak so the handler does not keep the connection alive.
        let weak_pc = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                info!(state = %st, "peer connection state changed");
                if matches!(
                    st,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
                ) {
                    if let Some(pc) = weak_pc.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "before-fail").await;
                        });
                    }
                }
                if let Some(state) = connection_state(st) {
                    sink.emit(TransportEvent::ConnectionState(state));
                }
                Box::pin(async {})
            }));

        subscription
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        Ok(self.pc.set_local_description(to_rtc(desc)?).await?)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(to_rtc(desc)?).await?)
    }

    /// webrtc-rs refuses a rollback with an empty body, so the pending offer
    /// is replayed with the rollback type.
    async fn rollback(&self) -> Result<()> {
        let Some(mut pending) = self.pc.pending_local_description().await else {
            return Err(Error::Transport("no pending local offer to roll back".into()));
        };
        pending.sdp_type = RTCSdpType::Rollback;
        Ok(self.pc.set_local_description(pending).await?)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|d| from_rtc(d).ok())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc
            .remote_description()
            .await
            .and_then(|d| from_rtc(d).ok())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        Ok(self.pc.add_ice_candidate(init).await?)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let sender = self.pc.add_track(track.rtc_track()).await?;

        // RTCP has to be read for interceptors (NACK, reports) to run.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let senders = self.pc.get_senders().await;
        senders
            .iter()
            .position(|s| Arc::ptr_eq(s, &sender))
            .map(SenderId)
            .ok_or_else(|| Error::Transport("added sender not found".into()))
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        let mut infos = Vec::new();
        for (i, sender) in self.pc.get_senders().await.into_iter().enumerate() {
            let track = match sender.track().await {
                Some(t) => TrackKind::from_codec_type(t.kind()).map(|kind| (t.id().to_string(), kind)),
                None => None,
            };
            infos.push(SenderInfo {
                id: SenderId(i),
                track,
            });
        }
        infos
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<()> {
        let senders = self.pc.get_senders().await;
        let rtp_sender = senders
            .get(sender.0)
            .ok_or_else(|| Error::Transport(format!("no sender {}", sender.0)))?;
        Ok(rtp_sender.replace_track(track.map(LocalTrack::rtc_track)).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.pc.close().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_ice_servers, IceServerKind};
    use crate::media::{MediaSource, SyntheticMediaSource};

    #[test]
    fn turn_credentials_are_passed_through() {
        let servers = vec![IceServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: Some("secret".into()),
        }];
        let rtc = ice_servers_from_config(&servers);
        assert_eq!(rtc[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc[0].username, "user");
        assert_eq!(rtc[0].credential, "secret");
    }

    #[test]
    fn config_uses_max_bundle() {
        let config = rtc_config(&default_ice_servers());
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn offer_lists_attached_video() {
        let transport = RtcTransport::new(&[]).await.unwrap();
        let camera = SyntheticMediaSource::new().open_camera().await.unwrap();
        let video = camera.first_video().unwrap();

        let id = transport.add_track(video).await.unwrap();
        assert_eq!(id, SenderId(0));

        let senders = transport.senders().await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].kind(), Some(TrackKind::Video));
        assert_eq!(senders[0].track_id(), Some(video.id()));

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn glare_loser_rolls_back_and_answers() {
        let local = RtcTransport::new(&[]).await.unwrap();
        let remote = RtcTransport::new(&[]).await.unwrap();
        let camera = SyntheticMediaSource::new().open_camera().await.unwrap();
        for track in camera.tracks() {
            local.add_track(track).await.unwrap();
        }
        let other = SyntheticMediaSource::new().open_camera().await.unwrap();
        for track in other.tracks() {
            remote.add_track(track).await.unwrap();
        }

        let ours = local.create_offer().await.unwrap();
        local.set_local_description(ours).await.unwrap();
        let theirs = remote.create_offer().await.unwrap();
        remote.set_local_description(theirs.clone()).await.unwrap();

        // A remote offer cannot be applied on top of our own pending offer.
        assert!(local.set_remote_description(theirs.clone()).await.is_err());

        local.rollback().await.unwrap();
        assert!(local.pc.pending_local_description().await.is_none());
        local.set_remote_description(theirs).await.unwrap();
        let answer = local.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        local.set_local_description(answer).await.unwrap();

        local.close().await.unwrap();
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_without_pending_offer_is_an_error() {
        let transport = RtcTransport::new(&[]).await.unwrap();
        assert!(matches!(
            transport.rollback().await,
            Err(Error::Transport(_))
        ));
        transport.close().await.unwrap();
    }
}
