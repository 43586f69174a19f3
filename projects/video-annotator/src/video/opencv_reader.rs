use super::VideoReader;
use crate::pipeline::types::{SourceInfo, TimedFrame};
use anyhow::{anyhow, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH, CAP_PROP_POS_MSEC,
    },
};
use std::path::Path;

/// Video reader backed by OpenCV's `VideoCapture`. Carries no audio information.
pub struct OpencvReader {
    capture: VideoCapture,
    info: SourceInfo,
    frames_read: usize,
    last_timestamp_us: Option<i64>,
}

impl OpencvReader {
    pub fn new(source: &Path) -> Result<Self> {
        let path = source
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 video path: {:?}", source))?;
        let capture = VideoCapture::from_file(path, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path));
        }

        let mut fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!("OpencvReader: Failed to get FPS from metadata, falling back to 30.0");
            fps = 30.0;
        }
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;

        let info = SourceInfo {
            width: capture.get(CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32,
            height: capture.get(CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32,
            audio_channels: 0,
            frame_count: raw_count,
            fps,
        };

        tracing::info!(
            "OpencvReader: opened {}, {}x{}, duration={:.2}s, fps={:.2}, stream_frames={}",
            path,
            info.width,
            info.height,
            raw_count as f64 / fps,
            fps,
            raw_count
        );

        Ok(Self {
            capture,
            info,
            frames_read: 0,
            last_timestamp_us: None,
        })
    }
}

impl VideoReader for OpencvReader {
    type Frame = Mat;

    fn info(&self) -> SourceInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<TimedFrame<Mat>>> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }

        let reported = (self.capture.get(CAP_PROP_POS_MSEC)? * 1000.0).round() as i64;
        let frame_us = (1_000_000.0 / self.info.fps).round() as i64;
        let timestamp_us = match self.last_timestamp_us {
            Some(last) if reported <= last => last + frame_us,
            _ => reported,
        };
        self.last_timestamp_us = Some(timestamp_us);

        let index = self.frames_read;
        self.frames_read += 1;

        Ok(Some(TimedFrame {
            index,
            timestamp_us,
            image: frame,
        }))
    }
}

impl Drop for OpencvReader {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("OpencvReader: release failed: {}", e);
        }
    }
}
