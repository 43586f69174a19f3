use super::VideoReader;
use crate::pipeline::types::{SourceInfo, TimedFrame};
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use ffmpeg_next::Rational;
use opencv::{core, prelude::*};
use std::path::Path;

/// Video reader backed by FFmpeg via ffmpeg-next.
/// Decodes on the CPU and converts every frame to BGR24.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    info: SourceInfo,
    time_base: Rational,
    /// Stream start in stream time base, subtracted so the first frame sits near zero.
    start_pts: i64,
    frames_decoded: usize,
    last_timestamp_us: Option<i64>,
    /// Persistent packet object to avoid allocations.
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    /// Whether we've sent EOF to the decoder.
    eof_sent: bool,
}

impl FfmpegReader {
    pub fn new(source: &Path) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        if !source.exists() {
            return Err(anyhow!("Video file not found: {}", source.display()));
        }

        let input_ctx = ffmpeg_next::format::input(&source)
            .with_context(|| format!("Failed to open video file {}", source.display()))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", source.display()))?;

        let video_stream_index = video_stream.index();
        let time_base = video_stream.time_base();
        let start_pts = match video_stream.start_time() {
            ffi::AV_NOPTS_VALUE => 0,
            start => start,
        };

        let rational_fps = video_stream.avg_frame_rate();
        let source_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64;
        let frame_count = if stream_frames == 0 {
            (duration_secs * source_fps).round() as usize
        } else {
            stream_frames
        };

        let audio_channels = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Audio)
            .map(|stream| unsafe { (*stream.parameters().as_ptr()).ch_layout.nb_channels })
            .unwrap_or(0)
            .max(0) as u32;

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let info = SourceInfo {
            width: decoder.width(),
            height: decoder.height(),
            audio_channels,
            frame_count,
            fps: source_fps,
        };

        tracing::info!(
            "FfmpegReader: opened {}, {}x{}, duration={:.2}s, fps={:.2}, stream_frames={}, estimated_total={}, audio_channels={}",
            source.display(),
            info.width,
            info.height,
            duration_secs,
            source_fps,
            stream_frames,
            frame_count,
            audio_channels
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            info,
            time_base,
            start_pts,
            frames_decoded: 0,
            last_timestamp_us: None,
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pulls the next decoded frame into `target`. Returns false at end of stream.
    fn decode_loop(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            // 1. Try to receive a decoded frame
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // 2. Feed packets until we find a video packet OR reach EOF
            let mut found_packet = false;
            loop {
                match self.reuse_packet.read(&mut self.input_ctx) {
                    Ok(()) => {
                        if self.reuse_packet.stream() == self.video_stream_index {
                            self.decoder
                                .send_packet(&self.reuse_packet)
                                .context("Failed to send packet to decoder")?;
                            found_packet = true;
                            break;
                        }
                    }
                    Err(ffmpeg_next::Error::Eof) => break,
                    Err(e) => return Err(anyhow!("Demuxer error: {}", e)),
                }
            }

            if !found_packet {
                // Flush the decoder, then drain what it still holds
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn get_or_create_scaler(
        &mut self,
        src_format: ffmpeg_next::format::Pixel,
    ) -> Result<&mut ffmpeg_next::software::scaling::Context> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                src_format,
                self.info.width,
                self.info.height,
                ffmpeg_next::format::Pixel::BGR24,
                self.info.width,
                self.info.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }
        self.scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler unavailable"))
    }

    /// Source timestamp of `frame` in microseconds, forced strictly increasing.
    fn timestamp_us(&mut self, frame: &ffmpeg_next::util::frame::Video) -> i64 {
        let frame_us = (1_000_000.0 / self.info.fps.max(1.0)).round() as i64;
        let raw = frame
            .timestamp()
            .or_else(|| frame.pts())
            .map(|pts| pts_to_us(pts - self.start_pts, self.time_base));

        let ts = match (raw, self.last_timestamp_us) {
            (Some(ts), Some(last)) if ts <= last => {
                tracing::debug!(
                    "FfmpegReader: timestamp {}us not after {}us, advancing by one frame",
                    ts,
                    last
                );
                last + frame_us
            }
            (Some(ts), _) => ts,
            (None, Some(last)) => last + frame_us,
            (None, None) => 0,
        };
        self.last_timestamp_us = Some(ts);
        ts
    }
}

/// Converts a stream-time-base value to microseconds.
pub fn pts_to_us(pts: i64, time_base: Rational) -> i64 {
    let den = time_base.denominator() as i128;
    if den == 0 {
        return 0;
    }
    (pts as i128 * time_base.numerator() as i128 * 1_000_000 / den) as i64
}

/// Convert a BGR24 ffmpeg frame to an OpenCV Mat.
/// The Mat owns a copy of the pixels, so it outlives the ffmpeg frame.
fn bgr_frame_to_mat(frame: &ffmpeg_next::util::frame::Video) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;

    for y in 0..height as usize {
        let src_offset = y * stride;
        let src_row = &data[src_offset..src_offset + row_bytes];
        let dst_ptr = mat.ptr_mut(y as i32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src_row.as_ptr(), dst_ptr, row_bytes);
        }
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    type Frame = core::Mat;

    fn info(&self) -> SourceInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<TimedFrame<core::Mat>>> {
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_loop(&mut raw)? {
            return Ok(None);
        }

        let timestamp_us = self.timestamp_us(&raw);
        let scaler = self.get_or_create_scaler(raw.format())?;
        let mut bgr = ffmpeg_next::util::frame::Video::empty();
        scaler.run(&raw, &mut bgr).context("Scaler failed")?;
        let image = bgr_frame_to_mat(&bgr)?;

        let index = self.frames_decoded;
        self.frames_decoded += 1;

        Ok(Some(TimedFrame {
            index,
            timestamp_us,
            image,
        }))
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        tracing::debug!(
            "FfmpegReader: closed after {} decoded frames",
            self.frames_decoded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_to_us() {
        assert_eq!(pts_to_us(0, Rational::new(1, 30)), 0);
        assert_eq!(pts_to_us(1, Rational::new(1, 30)), 33_333);
        assert_eq!(pts_to_us(3003, Rational::new(1, 90_000)), 33_366);
        assert_eq!(pts_to_us(1000, Rational::new(1, 1000)), 1_000_000);
        assert_eq!(pts_to_us(5, Rational::new(1, 0)), 0);
    }

    #[test]
    fn test_missing_file_is_rejected_before_demux() {
        let err = FfmpegReader::new(Path::new("/nonexistent/clip.mkv"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }
}
