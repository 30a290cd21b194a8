//! Derived video track carrying region-cropped frames
//!
//! One derived track per viewer session. The cropper's producer writes
//! samples here; when a region changes dimensions the session swaps a fresh
//! track onto its existing sender via `replace_track`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};

/// Stream id shared by every derived track
const STREAM_ID: &str = "wallcast-stream";

pub struct CroppedVideoTrack {
    track: Arc<TrackLocalStaticSample>,
    frame_duration: Duration,
}

impl CroppedVideoTrack {
    pub fn new(track_id: &str, fps: u32) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            track_id.to_owned(),
            STREAM_ID.to_owned(),
        ));
        Self {
            track,
            frame_duration: Duration::from_secs(1) / fps.max(1),
        }
    }

    /// Write one cropped frame as a media sample. A no-op while the track is
    /// not yet bound to a sender.
    pub async fn write_frame(&self, data: Bytes) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data,
                duration: self.frame_duration,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::Cropper(format!("Failed to write sample: {}", e)))
    }

    /// The underlying track, for `add_track` / `replace_track`.
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }
}
