use super::{TimestampGuard, VideoWriter};
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{codec, encoder, Rational};
use opencv::core::Mat;
use opencv::prelude::*;
use std::path::Path;

/// Encoder clock: milliseconds, which every Matroska-capable codec accepts.
const ENCODER_TIME_BASE: Rational = Rational(1, 1000);

/// Geometry and container of the output video.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
    pub width: u32,
    pub height: u32,
    /// Recorded for the output descriptor; no audio stream is muxed.
    pub audio_channels: u32,
    pub frame_rate: f64,
    /// FFmpeg muxer name, e.g. "matroska"
    pub container: String,
}

/// Encodes BGR frames into a container file, using the caller's timestamps.
pub struct FfmpegWriter {
    output_ctx: ffmpeg_next::format::context::Output,
    encoder: encoder::Video,
    scaler: ScalingContext,
    stream_index: usize,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    guard: TimestampGuard,
    last_pts: Option<i64>,
    frames_written: usize,
    closed: bool,
}

impl FfmpegWriter {
    pub fn create(path: &Path, settings: &SinkSettings) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let mut output_ctx = ffmpeg_next::format::output_as(&path, &settings.container)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;

        let codec = encoder::find(codec::Id::H264)
            .or_else(|| encoder::find(codec::Id::MPEG4))
            .context("No H.264 or MPEG-4 encoder available")?;
        let global_header = output_ctx
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

        let mut stream = output_ctx.add_stream(codec)?;
        let stream_index = stream.index();

        let mut video = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        video.set_width(settings.width);
        video.set_height(settings.height);
        video.set_format(Pixel::YUV420P);
        video.set_frame_rate(Some(Rational::from(settings.frame_rate)));
        video.set_time_base(ENCODER_TIME_BASE);
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = video
            .open_as(codec)
            .with_context(|| format!("Failed to open encoder {}", codec.name()))?;
        stream.set_parameters(&encoder);
        stream.set_time_base(ENCODER_TIME_BASE);

        output_ctx
            .write_header()
            .context("Failed to write container header")?;
        // The muxer may pick its own time base while writing the header.
        let stream_time_base = output_ctx
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("Output stream {} vanished", stream_index))?;

        let scaler = ScalingContext::get(
            Pixel::BGR24,
            settings.width,
            settings.height,
            Pixel::YUV420P,
            settings.width,
            settings.height,
            Flags::BILINEAR,
        )?;

        tracing::info!(
            "FfmpegWriter: {} opened ({}, {}, {}x{} @ {:.1} fps, audio_channels={})",
            path.display(),
            settings.container,
            codec.name(),
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.audio_channels
        );

        Ok(Self {
            output_ctx,
            encoder,
            scaler,
            stream_index,
            stream_time_base,
            width: settings.width,
            height: settings.height,
            guard: TimestampGuard::default(),
            last_pts: None,
            frames_written: 0,
            closed: false,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg_next::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(ENCODER_TIME_BASE, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output_ctx)
                .context("Failed to write packet")?;
        }
        Ok(())
    }

    fn mat_to_bgr_frame(&self, mat: &Mat) -> Result<Video> {
        if mat.cols() as u32 != self.width || mat.rows() as u32 != self.height {
            return Err(anyhow!(
                "Frame is {}x{}, sink expects {}x{}",
                mat.cols(),
                mat.rows(),
                self.width,
                self.height
            ));
        }
        if mat.channels() != 3 {
            return Err(anyhow!("Expected a 3-channel BGR frame, got {}", mat.channels()));
        }

        let owned;
        let mat = if mat.is_continuous() {
            mat
        } else {
            owned = mat.try_clone()?;
            &owned
        };

        let src = mat.data_bytes()?;
        let row_bytes = self.width as usize * 3;
        let mut frame = Video::new(Pixel::BGR24, self.width, self.height);
        let stride = frame.stride(0);
        let dst = frame.data_mut(0);
        for y in 0..self.height as usize {
            dst[y * stride..y * stride + row_bytes]
                .copy_from_slice(&src[y * row_bytes..(y + 1) * row_bytes]);
        }
        Ok(frame)
    }
}

impl VideoWriter<Mat> for FfmpegWriter {
    fn write_frame(&mut self, frame: &Mat, timestamp_us: i64) -> Result<()> {
        if self.closed {
            return Err(anyhow!("Writer already closed"));
        }
        self.guard.accept(timestamp_us)?;

        let bgr = self.mat_to_bgr_frame(frame)?;
        let mut yuv = Video::empty();
        self.scaler.run(&bgr, &mut yuv).context("Scaler failed")?;

        // Sub-millisecond gaps collapse in the encoder clock; keep pts strictly increasing.
        let mut pts = timestamp_us.div_euclid(1000);
        if let Some(last) = self.last_pts {
            pts = pts.max(last + 1);
        }
        self.last_pts = Some(pts);
        yuv.set_pts(Some(pts));

        self.encoder
            .send_frame(&yuv)
            .context("Failed to send frame to encoder")?;
        self.drain_packets()?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.encoder.send_eof().context("Failed to flush encoder")?;
        self.drain_packets()?;
        self.output_ctx
            .write_trailer()
            .context("Failed to write container trailer")?;

        tracing::info!(
            "FfmpegWriter: closed after {} frames (last timestamp {:?}us)",
            self.frames_written,
            self.guard.last()
        );
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!("FfmpegWriter: best-effort close failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::ffmpeg_reader::FfmpegReader;
    use crate::video::VideoReader;
    use opencv::core::{Scalar, CV_8UC3};

    fn settings(width: u32, height: u32) -> SinkSettings {
        SinkSettings {
            width,
            height,
            audio_channels: 0,
            frame_rate: 30.0,
            container: "matroska".to_string(),
        }
    }

    fn solid(width: i32, height: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(value)).unwrap()
    }

    #[test]
    fn test_missing_directory_fails_to_open() {
        let result = FfmpegWriter::create(
            Path::new("/nonexistent/dir/out.mkv"),
            &settings(64, 48),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_wrong_size_and_stale_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FfmpegWriter::create(&dir.path().join("out.mkv"), &settings(64, 48)).unwrap();

        assert!(writer.write_frame(&solid(32, 32, 0.0), 0).is_err());
        writer.write_frame(&solid(64, 48, 10.0), 0).unwrap();
        writer.write_frame(&solid(64, 48, 20.0), 40_000).unwrap();
        assert!(writer.write_frame(&solid(64, 48, 30.0), 40_000).is_err());
        writer.close().unwrap();

        assert_eq!(writer.frames_written, 2);
        assert!(writer.write_frame(&solid(64, 48, 40.0), 80_000).is_err());
    }

    #[test]
    fn test_source_timestamps_survive_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv");
        let timestamps = [0_i64, 40_000, 80_000, 120_000, 160_000];

        {
            let mut writer = FfmpegWriter::create(&path, &settings(64, 48)).unwrap();
            for (i, ts) in timestamps.iter().enumerate() {
                writer
                    .write_frame(&solid(64, 48, (i * 40) as f64), *ts)
                    .unwrap();
            }
            writer.close().unwrap();
        }

        let mut reader = FfmpegReader::new(&path).unwrap();
        assert_eq!(reader.info().width, 64);
        assert_eq!(reader.info().height, 48);

        let mut read_back = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            read_back.push(frame.timestamp_us);
        }
        assert_eq!(read_back, timestamps.to_vec());
    }

    #[test]
    fn test_drop_without_close_finalizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.mkv");
        {
            let mut writer = FfmpegWriter::create(&path, &settings(64, 48)).unwrap();
            writer.write_frame(&solid(64, 48, 0.0), 0).unwrap();
        }
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
