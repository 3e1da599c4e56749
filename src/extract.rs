use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, bail};
use ffmpeg_next::Rational;
use ffmpeg_next::codec::context::Context as CodecContext;
use ffmpeg_next::format::{self, Pixel};
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::media::Type;
use ffmpeg_next::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg_next::threading;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

static DECODE_THREADS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = if n > 8 { 8 } else { n };
    debug!(num, "Sizing decoder thread pool");
    num
});

/// Classified extraction failures. The Display strings are the client-facing
/// error messages; underlying causes ride along as sources for the logs.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Could not open video")]
    OpenVideo(#[source] ffmpeg_next::Error),
    #[error("Video has no frames")]
    EmptyVideo,
    #[error("Could not read last frame")]
    FrameRead,
    #[error("Could not encode frame as JPEG")]
    EncodeImage(#[source] image::ImageError),
    #[error("Failed to stage upload")]
    StageUpload(#[source] std::io::Error),
}

struct StreamInfo {
    stream_index: usize,
    time_base: Rational,
    fps: f64,
    frame_count: i64,
}

/// Decode the last readable frame of the video at `path` and return it as
/// JPEG bytes.
///
/// The nominal last frame is `frame_count - 1`. When that index fails to
/// decode and the video has more than one frame, exactly one fallback attempt
/// is made at `frame_count - 2`; reported frame counts routinely overstate
/// what is decodable at the stream tail. No further retries.
///
/// Blocking; on an async runtime call this through
/// `tokio::task::spawn_blocking`.
pub fn last_frame_jpeg(path: &Path, jpeg_quality: u8) -> Result<Vec<u8>, ExtractError> {
    // Idempotent, so cheap to call per extraction.
    ffmpeg_next::init().map_err(ExtractError::OpenVideo)?;

    let mut ictx = format::input(path).map_err(ExtractError::OpenVideo)?;
    let info = probe_video_stream(&ictx)?;

    if info.frame_count <= 0 {
        return Err(ExtractError::EmptyVideo);
    }

    let last_index = info.frame_count - 1;
    let frame = match decode_frame_at(&mut ictx, &info, last_index) {
        Ok(frame) => frame,
        Err(error) if info.frame_count > 1 => {
            warn!(
                target_index = last_index,
                %error,
                "Last frame failed to decode, retrying one frame back"
            );
            decode_frame_at(&mut ictx, &info, last_index - 1).map_err(|error| {
                warn!(target_index = last_index - 1, %error, "Fallback frame failed to decode");
                ExtractError::FrameRead
            })?
        }
        Err(error) => {
            warn!(target_index = last_index, %error, "Single frame failed to decode");
            return Err(ExtractError::FrameRead);
        }
    };

    encode_jpeg(&frame, jpeg_quality)
}

/// Locate the best video stream and report its timing and frame count.
///
/// A container that opens but carries no video stream reports zero frames.
fn probe_video_stream(ictx: &format::context::Input) -> Result<StreamInfo, ExtractError> {
    let Some(stream) = ictx.streams().best(Type::Video) else {
        return Err(ExtractError::EmptyVideo);
    };

    let stream_index = stream.index();
    let time_base = stream.time_base();
    let fps = video_frame_rate(&stream);

    // Opening the decoder here surfaces unsupported codecs as open failures,
    // before any frame index is chosen.
    let decoder = CodecContext::from_parameters(stream.parameters())
        .and_then(|context| context.decoder().video())
        .map_err(ExtractError::OpenVideo)?;

    // Container-reported count when present, duration-based estimate
    // otherwise. Either source may overstate the decodable tail.
    let nominal = stream.frames();
    let frame_count = if nominal > 0 {
        nominal
    } else {
        let duration_us = ictx.duration();
        let duration = if duration_us > 0 {
            Duration::from_micros(duration_us as u64)
        } else {
            Duration::ZERO
        };
        if fps > 0.0 {
            estimate_frame_count(duration, fps)
        } else {
            0
        }
    };

    debug!(
        stream_index,
        width = decoder.width(),
        height = decoder.height(),
        fps,
        frame_count,
        "Probed video stream"
    );

    Ok(StreamInfo {
        stream_index,
        time_base,
        fps,
        frame_count,
    })
}

// Both numerator and denominator must be positive for a usable rate.
fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

/// Frame rate from the stream, preferring `avg_frame_rate` and falling back
/// to `r_frame_rate`. Returns 0.0 when neither is usable.
fn video_frame_rate(stream: &ffmpeg_next::Stream) -> f64 {
    let avg_fps = stream.avg_frame_rate();
    if is_rational_valid(avg_fps) {
        return avg_fps.numerator() as f64 / avg_fps.denominator() as f64;
    }

    let r_fps = stream.rate();
    if is_rational_valid(r_fps) {
        return r_fps.numerator() as f64 / r_fps.denominator() as f64;
    }

    0.0
}

/// Seek to `target` and decode forward until a frame at or past that index
/// comes out of the decoder.
///
/// The seek lands on the keyframe at or before the target timestamp, so an
/// attempt only overshoots when the reported count understates the stream —
/// in which case the frame actually at the tail is the right answer.
#[allow(clippy::field_reassign_with_default)]
fn decode_frame_at(
    ictx: &mut format::context::Input,
    info: &StreamInfo,
    target: i64,
) -> anyhow::Result<DynamicImage> {
    let stream = ictx
        .stream(info.stream_index)
        .ok_or_else(|| anyhow!("video stream {} disappeared", info.stream_index))?;

    let mut decoder_context = CodecContext::from_parameters(stream.parameters())?;

    let mut threading_config = threading::Config::default();
    threading_config.count = *DECODE_THREADS;
    threading_config.kind = threading::Type::Frame;
    decoder_context.set_threading(threading_config);

    let mut decoder = decoder_context.decoder().video()?;

    let mut scaler = ScalingContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ScalingFlags::BILINEAR,
    )?;

    let target_timestamp = stream_timestamp_for_frame(target, info.fps, info.time_base);
    ictx.seek(target_timestamp, ..target_timestamp)?;

    let mut decoded = VideoFrame::empty();
    let mut rgb = VideoFrame::empty();

    for (stream, packet) in ictx.packets() {
        if stream.index() != info.stream_index {
            continue;
        }

        decoder.send_packet(&packet)?;

        while decoder.receive_frame(&mut decoded).is_ok() {
            let index = frame_index_for_pts(decoded.pts().unwrap_or(0), info.time_base, info.fps);
            if index >= target {
                scaler.run(&decoded, &mut rgb)?;
                return rgb_frame_to_image(&rgb, decoder.width(), decoder.height());
            }
        }
    }

    // Drain the decoder; with B-frame reordering the tail frames only come
    // out after EOF.
    decoder.send_eof()?;
    while decoder.receive_frame(&mut decoded).is_ok() {
        let index = frame_index_for_pts(decoded.pts().unwrap_or(0), info.time_base, info.fps);
        if index >= target {
            scaler.run(&decoded, &mut rgb)?;
            return rgb_frame_to_image(&rgb, decoder.width(), decoder.height());
        }
    }

    bail!("no decodable frame at or after index {target}")
}

/// Timestamp of a frame index in the stream time base. Truncates, which can
/// only land at or before the frame — safe for seeking.
fn stream_timestamp_for_frame(index: i64, fps: f64, time_base: Rational) -> i64 {
    let seconds = index as f64 / fps;
    (seconds * time_base.denominator() as f64 / time_base.numerator() as f64) as i64
}

/// Frame index of a PTS value. Rounds to nearest; truncation here would
/// misplace exact frame boundaries that land a hair under the integer.
fn frame_index_for_pts(pts: i64, time_base: Rational, fps: f64) -> i64 {
    let seconds = pts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64;
    (seconds * fps).round() as i64
}

/// Frame-count estimate from the container duration, for streams that do not
/// report `nb_frames`. Rounds to nearest; containers carry millisecond-rounded
/// durations whose product with the rate can land a hair under the true total.
fn estimate_frame_count(duration: Duration, fps: f64) -> i64 {
    (duration.as_secs_f64() * fps + 0.5) as i64
}

fn rgb_frame_to_image(
    rgb_frame: &VideoFrame,
    width: u32,
    height: u32,
) -> anyhow::Result<DynamicImage> {
    let buffer = packed_rgb_buffer(rgb_frame, width, height);
    let image = RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| anyhow!("decoded frame data does not fill a {width}x{height} RGB image"))?;
    Ok(DynamicImage::ImageRgb8(image))
}

/// Copy frame pixel data into a tightly-packed RGB buffer, stripping any
/// per-row alignment padding the decoder left in the stride.
fn packed_rgb_buffer(frame: &VideoFrame, width: u32, height: u32) -> Vec<u8> {
    let stride = frame.stride(0);
    let row_len = width as usize * 3;
    let data = frame.data(0);

    if stride == row_len {
        data[..row_len * height as usize].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(row_len * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            buffer.extend_from_slice(&data[start..start + row_len]);
        }
        buffer
    }
}

fn encode_jpeg(frame: &DynamicImage, quality: u8) -> Result<Vec<u8>, ExtractError> {
    let mut output = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality);
    encoder
        .encode_image(frame)
        .map_err(ExtractError::EncodeImage)?;
    Ok(output.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, ImageBuffer, Rgb};

    #[test]
    fn garbage_bytes_fail_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_video.mp4");
        std::fs::write(&path, b"This is not a video file").unwrap();

        let error = last_frame_jpeg(&path, 85).unwrap_err();
        assert!(matches!(error, ExtractError::OpenVideo(_)), "got {error:?}");
    }

    #[test]
    fn empty_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mp4");
        std::fs::write(&path, b"").unwrap();

        let error = last_frame_jpeg(&path, 85).unwrap_err();
        assert!(matches!(error, ExtractError::OpenVideo(_)), "got {error:?}");
    }

    #[test]
    fn missing_path_fails_to_open() {
        let error = last_frame_jpeg(Path::new("/nonexistent/video.mp4"), 85).unwrap_err();
        assert!(matches!(error, ExtractError::OpenVideo(_)), "got {error:?}");
    }

    #[test]
    fn jpeg_encoding_preserves_dimensions() {
        let img =
            DynamicImage::ImageRgb8(ImageBuffer::from_fn(64, 48, |_, _| Rgb([12, 200, 34])));

        let jpeg = encode_jpeg(&img, 85).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn frame_index_rounds_to_nearest() {
        // Frame 9 at 10 fps sits at 0.9 s; 11520/12800 = 0.9 exactly, but the
        // multiplication can come out a hair under 9.0.
        let time_base = Rational::new(1, 12800);
        assert_eq!(frame_index_for_pts(11520, time_base, 10.0), 9);
        assert_eq!(frame_index_for_pts(0, time_base, 10.0), 0);
    }

    #[test]
    fn frame_timestamp_lands_at_or_before_frame() {
        let time_base = Rational::new(1, 12800);
        let ts = stream_timestamp_for_frame(9, 10.0, time_base);
        assert!(ts <= 11520, "timestamp {ts} is past frame 9");
        assert!(ts >= 11519, "timestamp {ts} is too far before frame 9");
    }

    #[test]
    fn duration_estimate_rounds_to_nearest() {
        // A 10-frame clip at 10 fps whose duration got rounded down to
        // 999 ms still counts 10 frames.
        assert_eq!(estimate_frame_count(Duration::from_millis(999), 10.0), 10);
        assert_eq!(estimate_frame_count(Duration::from_millis(940), 10.0), 9);
        assert_eq!(estimate_frame_count(Duration::ZERO, 10.0), 0);
    }

    #[test]
    fn rational_validity() {
        assert!(is_rational_valid(Rational::new(30, 1)));
        assert!(!is_rational_valid(Rational::new(0, 1)));
        assert!(!is_rational_valid(Rational::new(30, 0)));
        assert!(!is_rational_valid(Rational::new(-30, 1)));
    }

    #[test]
    fn packed_buffer_strips_stride_padding() {
        ffmpeg_next::init().unwrap();

        // 10 px wide RGB rows are 30 bytes; ffmpeg pads strides to an
        // alignment boundary, so the stride is wider.
        let mut frame = VideoFrame::new(Pixel::RGB24, 10, 4);
        let stride = frame.stride(0);
        assert!(stride >= 30);

        let data = frame.data_mut(0);
        for row in 0..4 {
            for col in 0..30 {
                data[row * stride + col] = row as u8 + 1;
            }
        }

        let buffer = packed_rgb_buffer(&frame, 10, 4);
        assert_eq!(buffer.len(), 120);
        for row in 0..4 {
            assert!(
                buffer[row * 30..(row + 1) * 30]
                    .iter()
                    .all(|&b| b == row as u8 + 1)
            );
        }
    }
}
