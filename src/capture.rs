//! Frame sampling: decodes a bounded, evenly spaced set of frames from a
//! video container into in-memory JPEGs for OCR.

use std::path::Path;
use std::sync::Once;

use ffmpeg::util::frame::video::Video;
use ffmpeg::{format, media, rescale, Rational, Rescale};
use ffmpeg_next::{self as ffmpeg};
use image::codecs::jpeg;
use image::ImageBuffer;
use tracing::debug;

use crate::error::TaskError;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        ffmpeg::init().unwrap();
    });
}

/// One decoded frame, encoded as JPEG, with its offset into the video.
/// Frames live only for the sampler → extractor handoff and are never
/// written to disk.
#[derive(Debug)]
pub struct SampledFrame {
    pub jpeg: Vec<u8>,
    pub timestamp_ms: i64,
}

/// Spacing used when the container reports no duration.
const FALLBACK_INTERVAL_MS: i64 = 2_000;

/// Evenly spaced offsets across the duration, always including the first
/// frame and a point near the end. The last target sits at 98% of the
/// duration so it still lands on a decodable frame.
fn sample_offsets_ms(duration_ms: i64, max_frames: usize) -> Vec<i64> {
    let n = max_frames.max(1);
    if n == 1 || duration_ms <= 0 {
        return vec![0];
    }
    let last = duration_ms * 98 / 100;
    let mut offsets: Vec<i64> = (0..n)
        .map(|i| last * i as i64 / (n as i64 - 1))
        .collect();
    offsets.dedup();
    offsets
}

fn fallback_offsets_ms(max_frames: usize) -> Vec<i64> {
    (0..max_frames.max(1))
        .map(|i| i as i64 * FALLBACK_INTERVAL_MS)
        .collect()
}

fn unreadable(err: impl std::fmt::Display) -> TaskError {
    TaskError::UnreadableVideo(err.to_string())
}

/// Decodes the video once, front to back, capturing the first frame at or
/// after each target offset and stopping as soon as every target is filled.
/// The stream is never buffered whole; cost is bounded by `max_frames`
/// regardless of video length.
pub fn sample(input_path: &Path, max_frames: usize) -> Result<Vec<SampledFrame>, TaskError> {
    init();

    let mut input = format::input(&input_path).map_err(unreadable)?;

    let video_stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or_else(|| unreadable(ffmpeg::Error::StreamNotFound))?;
    let video_stream_index = video_stream.index();
    let time_base: f64 = video_stream.time_base().into();
    let stream_duration = video_stream.duration();
    let codec_params = video_stream.parameters();

    let duration_ms = if input.duration() > 0 {
        input
            .duration()
            .rescale(rescale::TIME_BASE, Rational(1, 1000))
    } else if stream_duration > 0 {
        (stream_duration as f64 * time_base * 1000.0) as i64
    } else {
        0
    };

    let targets = if duration_ms > 0 {
        sample_offsets_ms(duration_ms, max_frames)
    } else {
        debug!(path = %input_path.display(), "no duration in container, sampling at fixed intervals");
        fallback_offsets_ms(max_frames)
    };

    let context_decoder =
        ffmpeg::codec::context::Context::from_parameters(codec_params).map_err(unreadable)?;
    let mut decoder = context_decoder.decoder().video().map_err(unreadable)?;

    let mut scaler = ffmpeg::software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .map_err(unreadable)?;

    let mut frames: Vec<SampledFrame> = Vec::with_capacity(targets.len());
    let mut next_target = 0usize;

    let mut process_decoded_frames =
        |decoder: &mut ffmpeg::decoder::Video| -> Result<bool, TaskError> {
            let mut decoded = Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                if next_target >= targets.len() {
                    return Ok(true);
                }
                let Some(pts) = decoded.pts() else {
                    continue;
                };
                let timestamp_ms = (pts as f64 * time_base * 1000.0) as i64;
                if timestamp_ms < targets[next_target] {
                    continue;
                }

                let mut rgb_frame = Video::empty();
                scaler.run(&decoded, &mut rgb_frame).map_err(unreadable)?;
                let image_buffer = ImageBuffer::<image::Rgb<u8>, _>::from_raw(
                    rgb_frame.width(),
                    rgb_frame.height(),
                    rgb_frame.data(0).to_vec(),
                )
                .ok_or_else(|| unreadable("frame buffer does not match frame dimensions"))?;

                let mut jpeg_data = Vec::new();
                let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, 90);
                encoder
                    .encode(
                        &image_buffer,
                        image_buffer.width(),
                        image_buffer.height(),
                        image::ExtendedColorType::Rgb8,
                    )
                    .map_err(unreadable)?;

                frames.push(SampledFrame {
                    jpeg: jpeg_data,
                    timestamp_ms,
                });

                // One frame can satisfy several collided targets.
                while next_target < targets.len() && targets[next_target] <= timestamp_ms {
                    next_target += 1;
                }
                if next_target >= targets.len() {
                    return Ok(true);
                }
            }
            Ok(false)
        };

    let mut done = false;
    for (stream, packet) in input.packets() {
        if stream.index() == video_stream_index {
            decoder.send_packet(&packet).map_err(unreadable)?;
            if process_decoded_frames(&mut decoder)? {
                done = true;
                break;
            }
        }
    }
    if !done {
        decoder.send_eof().map_err(unreadable)?;
        process_decoded_frames(&mut decoder)?;
    }
    drop(process_decoded_frames);

    if frames.is_empty() {
        return Err(unreadable("no readable frames"));
    }
    debug!(
        path = %input_path.display(),
        frames = frames.len(),
        duration_ms,
        "sampled frames"
    );
    Ok(frames)
}

/// ffmpeg-backed sampler wired into the pipeline.
pub struct VideoSampler;

impl crate::pipeline::FrameSampler for VideoSampler {
    fn sample(&self, path: &Path, max_frames: usize) -> Result<Vec<SampledFrame>, TaskError> {
        sample(path, max_frames)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn offsets_include_first_and_near_last() {
        let offsets = sample_offsets_ms(60_000, 5);
        assert_eq!(offsets.first(), Some(&0));
        assert_eq!(offsets.last(), Some(&58_800));
        assert_eq!(offsets.len(), 5);
    }

    #[test]
    fn offsets_are_evenly_spaced() {
        let offsets = sample_offsets_ms(100_000, 5);
        assert_eq!(offsets, vec![0, 24_500, 49_000, 73_500, 98_000]);
    }

    #[test]
    fn single_frame_samples_the_start() {
        assert_eq!(sample_offsets_ms(60_000, 1), vec![0]);
    }

    #[test]
    fn short_videos_collapse_duplicate_offsets() {
        let offsets = sample_offsets_ms(3, 5);
        assert!(offsets.len() <= 5);
        assert_eq!(offsets.first(), Some(&0));
        let mut sorted = offsets.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, offsets);
    }

    #[test]
    fn fallback_offsets_are_fixed_interval() {
        assert_eq!(fallback_offsets_ms(3), vec![0, 2_000, 4_000]);
    }

    #[test]
    fn zero_max_frames_still_samples_one() {
        assert_eq!(sample_offsets_ms(60_000, 0), vec![0]);
        assert_eq!(fallback_offsets_ms(0), vec![0]);
    }

    #[test]
    fn unreadable_path_is_a_task_error() {
        let err = sample(Path::new("/nonexistent/clip.mp4"), 3).unwrap_err();
        assert!(matches!(err, TaskError::UnreadableVideo(_)));
    }
}
