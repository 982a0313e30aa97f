//! Thin wrapper around the peer connection: codec setup, outgoing track
//! attachment, transport observers funneled into one event stream, and
//! stats collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{SessionConfig, VideoFormat};
use crate::error::SessionError;
use crate::join::JoinPayload;
use crate::session::media::LocalMedia;
use crate::stats::{EncoderTelemetry, StatsSnapshot};

/// Transport-level happenings the session driver reacts to.
pub enum PeerEvent {
    LocalCandidate(RTCIceCandidateInit),
    Track { track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver> },
    ConnectionState(RTCPeerConnectionState),
    SignalingState(RTCSignalingState),
    IceConnectionState(RTCIceConnectionState),
    IceGatheringState(RTCIceGathererState),
    NegotiationNeeded,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(init) => {
                f.debug_tuple("LocalCandidate").field(&init.candidate).finish()
            }
            PeerEvent::Track { track, .. } => {
                f.debug_struct("Track").field("id", &track.id()).finish_non_exhaustive()
            }
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PeerEvent::SignalingState(state) => {
                f.debug_tuple("SignalingState").field(state).finish()
            }
            PeerEvent::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
            PeerEvent::IceGatheringState(state) => {
                f.debug_tuple("IceGatheringState").field(state).finish()
            }
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
        }
    }
}

/// PLI/FIR arrivals counted off the video sender's RTCP stream.
#[derive(Debug, Default)]
struct FeedbackCounters {
    pli: AtomicU64,
    fir: AtomicU64,
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    feedback: Arc<FeedbackCounters>,
}

impl RtcPeer {
    /// Build the transport: media engine (honoring the codec preference
    /// when one was joined with), default interceptors, both outgoing
    /// tracks attached, every observer wired to `events`.
    pub async fn new(
        config: &SessionConfig,
        join: &JoinPayload,
        local: &LocalMedia,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<RtcPeer, SessionError> {
        let mut media_engine = MediaEngine::default();
        let preferred = join
            .video_format
            .as_deref()
            .and_then(VideoFormat::from_name)
            .filter(|_| config.capabilities.codec_preference);
        match preferred {
            Some(format) => register_preferred_codecs(&mut media_engine, format)?,
            None => media_engine.register_default_codecs()?,
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(config.rtc.to_rtc_configuration()).await?);

        let audio_sender = pc.add_track(local.audio.clone()).await?;
        let video_sender = pc.add_track(local.video.clone()).await?;

        // The interceptors only see RTCP we actually read.
        drain_rtcp(audio_sender);
        let feedback = Arc::new(FeedbackCounters::default());
        count_video_feedback(video_sender, feedback.clone());

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(init));
                    }
                    Err(err) => warn!("local candidate serialization failed: {err}"),
                }
            }
            Box::pin(async {})
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track, receiver, _transceiver| {
            let _ = track_tx.send(PeerEvent::Track { track, receiver });
            Box::pin(async {})
        }));

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(PeerEvent::ConnectionState(state));
            Box::pin(async {})
        }));

        let signaling_tx = events.clone();
        pc.on_signaling_state_change(Box::new(move |state| {
            let _ = signaling_tx.send(PeerEvent::SignalingState(state));
            Box::pin(async {})
        }));

        let ice_tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = ice_tx.send(PeerEvent::IceConnectionState(state));
            Box::pin(async {})
        }));

        let gathering_tx = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let _ = gathering_tx.send(PeerEvent::IceGatheringState(state));
            Box::pin(async {})
        }));

        pc.on_negotiation_needed(Box::new(move || {
            let _ = events.send(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        Ok(RtcPeer { pc, feedback })
    }

    pub async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), SessionError> {
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription, SessionError> {
        Ok(self.pc.create_answer(None).await?)
    }

    pub async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), SessionError> {
        self.pc.set_local_description(description).await?;
        Ok(())
    }

    pub async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), SessionError> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!("peer connection close: {err}");
        }
    }

    /// One point-in-time reading: transport byte counters from the stats
    /// reports, encoder counters from the telemetry feed, feedback counts
    /// from the RTCP reader.
    pub async fn snapshot(&self, telemetry: &EncoderTelemetry) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            captured_at: Utc::now(),
            pli_count: Some(self.feedback.pli.load(Ordering::Relaxed)),
            fir_count: Some(self.feedback.fir.load(Ordering::Relaxed)),
            encoded_width: telemetry.encoded_width,
            encoded_height: telemetry.encoded_height,
            frames_per_second: telemetry.frames_per_second,
            key_frames_encoded: telemetry.key_frames_encoded,
            key_frames_decoded: telemetry.key_frames_decoded,
            ..Default::default()
        };

        let stats = self.pc.get_stats().await;
        for (_, report) in stats.reports {
            match report {
                StatsReportType::OutboundRTP(outbound) => match outbound.kind.as_str() {
                    "audio" => snapshot.audio_bytes_sent += outbound.bytes_sent,
                    "video" => snapshot.video_bytes_sent += outbound.bytes_sent,
                    _ => {}
                },
                StatsReportType::InboundRTP(inbound) => match inbound.kind.as_str() {
                    "audio" => snapshot.audio_bytes_received += inbound.bytes_received,
                    "video" => snapshot.video_bytes_received += inbound.bytes_received,
                    _ => {}
                },
                _ => {}
            }
        }

        snapshot
    }

    /// Identifier of the nominated candidate pair, if one is selected.
    pub async fn selected_candidate_pair(&self) -> Option<String> {
        let stats = self.pc.get_stats().await;
        for (_, report) in stats.reports {
            if let StatsReportType::CandidatePair(pair) = report {
                if pair.nominated {
                    return Some(format!(
                        "{}:{}",
                        pair.local_candidate_id, pair.remote_candidate_id
                    ));
                }
            }
        }
        None
    }
}

/// Opus plus one video codec, fixed payload types, instead of the full
/// default table. The server transcodes, so offering alternatives only
/// invites a codec the pipeline was not configured for.
fn register_preferred_codecs(
    media_engine: &mut MediaEngine,
    format: VideoFormat,
) -> Result<(), webrtc::Error> {
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let (mime_type, payload_type, sdp_fmtp_line) = match format {
        VideoFormat::Vp8 => (MIME_TYPE_VP8, 96, String::new()),
        VideoFormat::H264 => (
            MIME_TYPE_H264,
            102,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f".to_owned(),
        ),
    };
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line,
                rtcp_feedback: vec![],
            },
            payload_type,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    Ok(())
}

fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
}

fn count_video_feedback(sender: Arc<RTCRtpSender>, feedback: Arc<FeedbackCounters>) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for packet in packets {
                if packet.as_any().downcast_ref::<PictureLossIndication>().is_some() {
                    feedback.pli.fetch_add(1, Ordering::Relaxed);
                } else if packet.as_any().downcast_ref::<FullIntraRequest>().is_some() {
                    feedback.fir.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });
}
