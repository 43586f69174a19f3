pub mod ffmpeg_reader;
pub mod ffmpeg_writer;
pub mod opencv_reader;

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::{SourceInfo, TimedFrame};
use anyhow::Result;
use opencv::core::Mat;
use std::path::Path;

/// Sequential frame source. Dropping the reader closes it.
pub trait VideoReader {
    type Frame;

    fn info(&self) -> SourceInfo;
    /// `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<TimedFrame<Self::Frame>>>;
}

impl<R: VideoReader + ?Sized> VideoReader for Box<R> {
    type Frame = R::Frame;

    fn info(&self) -> SourceInfo {
        (**self).info()
    }

    fn next_frame(&mut self) -> Result<Option<TimedFrame<Self::Frame>>> {
        (**self).next_frame()
    }
}

/// Ordered frame sink. `close` flushes; dropping an unclosed writer closes it best-effort.
pub trait VideoWriter<F> {
    fn write_frame(&mut self, frame: &F, timestamp_us: i64) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Ffmpeg,
    Opencv,
}

pub fn open_reader(path: &Path, backend: Backend) -> PipelineResult<Box<dyn VideoReader<Frame = Mat>>> {
    let reader: Box<dyn VideoReader<Frame = Mat>> = match backend {
        Backend::Ffmpeg => Box::new(
            ffmpeg_reader::FfmpegReader::new(path).map_err(PipelineError::source_unreadable)?,
        ),
        Backend::Opencv => Box::new(
            opencv_reader::OpencvReader::new(path).map_err(PipelineError::source_unreadable)?,
        ),
    };
    Ok(reader)
}

/// Rejects any timestamp that does not strictly follow the previous one.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampGuard {
    last_us: Option<i64>,
}

impl TimestampGuard {
    pub fn accept(&mut self, timestamp_us: i64) -> Result<()> {
        if let Some(last) = self.last_us {
            if timestamp_us <= last {
                anyhow::bail!(
                    "Non-increasing timestamp: {}us after {}us",
                    timestamp_us,
                    last
                );
            }
        }
        self.last_us = Some(timestamp_us);
        Ok(())
    }

    pub fn last(&self) -> Option<i64> {
        self.last_us
    }
}
