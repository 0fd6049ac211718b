//! Audio/video multiplexing of two ISO-BMFF elementary files into a single
//! progressive MP4 without touching sample data or timestamps.

pub(crate) mod boxes;
pub mod demux;
pub mod writer;

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::fsutil::remove_quietly;

pub use demux::{Mp4Source, Sample, Track, TrackFormat};
pub use writer::{Mp4Muxer, SampleInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxOutcome {
    Muxed {
        video_samples: usize,
        audio_samples: usize,
        media_bytes: u64,
    },
    /// The video file was copied as-is because the pair could not be muxed.
    VideoOnly { reason: String },
}

impl MuxOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, MuxOutcome::VideoOnly { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MuxEngine;

impl MuxEngine {
    pub fn new() -> Self {
        Self
    }

    /// Combines the first video track of `video` with the first audio track
    /// of `audio` into `output`. Any mux failure degrades to a copy of the
    /// video file; only a failed copy is returned as an error.
    pub fn merge(&self, video: &Path, audio: &Path, output: &Path) -> CoreResult<MuxOutcome> {
        match self.mux_tracks(video, audio, output) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(
                    video = %video.display(),
                    error = %err,
                    "mux failed, keeping the video stream only"
                );
                remove_quietly(output);
                fs::copy(video, output)
                    .map_err(|copy_err| CoreError::Mux(format!("{} (video-only copy failed: {})", err, copy_err)))?;
                Ok(MuxOutcome::VideoOnly {
                    reason: err.to_string(),
                })
            }
        }
    }

    fn mux_tracks(&self, video: &Path, audio: &Path, output: &Path) -> CoreResult<MuxOutcome> {
        let mut video_source = Mp4Source::open(video)?;
        let mut audio_source = Mp4Source::open(audio)?;
        let video_track = video_source
            .track_with_mime_prefix("video/")
            .cloned()
            .ok_or_else(|| CoreError::Mux(format!("no video track in {}", video.display())))?;
        let audio_track = audio_source
            .track_with_mime_prefix("audio/")
            .cloned()
            .ok_or_else(|| CoreError::Mux(format!("no audio track in {}", audio.display())))?;
        if video_track.samples.is_empty() {
            return Err(CoreError::Mux("video track has no samples".to_string()));
        }

        let mut muxer = Mp4Muxer::create(output)?;
        let video_index = muxer.add_track(&video_track.format)?;
        let audio_index = muxer.add_track(&audio_track.format)?;
        muxer.start()?;

        let (vs, vscale) = (&video_track.samples, video_track.format.timescale as u128);
        let (aus, ascale) = (&audio_track.samples, audio_track.format.timescale as u128);
        let mut buf = Vec::new();
        let (mut vi, mut ai) = (0usize, 0usize);
        while vi < vs.len() || ai < aus.len() {
            let take_video = match (vs.get(vi), aus.get(ai)) {
                (Some(v), Some(a)) => v.dts as u128 * ascale <= a.dts as u128 * vscale,
                (Some(_), None) => true,
                _ => false,
            };
            if take_video {
                let sample = &vs[vi];
                video_source.read_sample(sample, &mut buf)?;
                muxer.write_sample(video_index, &buf, sample_info(sample))?;
                vi += 1;
            } else {
                let sample = &aus[ai];
                audio_source.read_sample(sample, &mut buf)?;
                muxer.write_sample(audio_index, &buf, sample_info(sample))?;
                ai += 1;
            }
        }
        let media_bytes = muxer.finish()?;

        info!(
            output = %output.display(),
            video_samples = vs.len(),
            audio_samples = aus.len(),
            media_bytes,
            "muxed audio and video"
        );
        Ok(MuxOutcome::Muxed {
            video_samples: vs.len(),
            audio_samples: aus.len(),
            media_bytes,
        })
    }
}

fn sample_info(sample: &Sample) -> SampleInfo {
    SampleInfo {
        dts: sample.dts,
        duration: sample.duration,
        cts_offset: sample.cts_offset,
        is_sync: sample.is_sync,
    }
}
