//! Local media acquisition behind a trait, so sessions can run against
//! real capture devices, file readers, or silent test sources alike.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{MediaConstraints, VideoFormat};
use crate::error::MediaError;
use crate::utils::random_id;

/// The pair of outgoing tracks a session publishes. The embedding
/// application writes samples into them; the session only attaches them
/// to the transport.
#[derive(Clone)]
pub struct LocalMedia {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

/// Source of local tracks, resolved once per session before negotiation.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Builds sample-based tracks matching the resolved constraints. Tracks
/// share one stream id so the server groups them into a single stream.
pub struct SampleTrackSource;

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        let stream_id = random_id();

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: constraints.audio.channel_count,
                ..Default::default()
            },
            format!("audio-{}", random_id()),
            stream_id.clone(),
        ));

        let video_mime = match constraints.video.format {
            VideoFormat::Vp8 => MIME_TYPE_VP8,
            VideoFormat::H264 => MIME_TYPE_H264,
        };
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: video_mime.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", random_id()),
            stream_id,
        ));

        Ok(LocalMedia { audio, video })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::track::track_local::TrackLocal;

    #[tokio::test]
    async fn tracks_share_one_stream_and_follow_constraints() {
        let mut constraints = MediaConstraints::default();
        constraints.video.format = VideoFormat::H264;

        let media = SampleTrackSource.acquire(&constraints).await.unwrap();
        assert_eq!(media.audio.stream_id(), media.video.stream_id());
        assert_ne!(media.audio.id(), media.video.id());
        assert_eq!(media.video.codec().mime_type, MIME_TYPE_H264);
        assert_eq!(media.audio.codec().channels, 1);
    }
}
