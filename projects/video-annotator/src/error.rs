//! Typed failures of one annotation run.
//!
//! Every variant is fatal to the run that produced it. Nothing is retried.

use serde::Serialize;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Sink unwritable: {0}")]
    SinkUnwritable(String),

    #[error("Output resolution failed: {0}")]
    OutputResolution(String),

    #[error("Worker aborted: {0}")]
    Internal(String),

    #[error("{stage} failed at frame {frame}: {message}")]
    Stage {
        stage: Stage,
        frame: usize,
        message: String,
    },
}

/// Loop stage in which a per-frame failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Read,
    Detect,
    Render,
    Write,
    Close,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::Detect => "detect",
            Stage::Render => "render",
            Stage::Write => "write",
            Stage::Close => "close",
        };
        f.write_str(name)
    }
}

/// Stable machine-readable tag for each error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnreadable,
    ModelLoad,
    SinkUnwritable,
    OutputResolution,
    Internal,
    Stage,
}

impl PipelineError {
    pub fn source_unreadable(err: impl std::fmt::Display) -> Self {
        Self::SourceUnreadable(format!("{:#}", err))
    }

    pub fn model_load(err: impl std::fmt::Display) -> Self {
        Self::ModelLoad(format!("{:#}", err))
    }

    pub fn sink_unwritable(err: impl std::fmt::Display) -> Self {
        Self::SinkUnwritable(format!("{:#}", err))
    }

    pub fn output_resolution(err: impl std::fmt::Display) -> Self {
        Self::OutputResolution(format!("{:#}", err))
    }

    pub fn stage(stage: Stage, frame: usize, err: impl std::fmt::Display) -> Self {
        Self::Stage {
            stage,
            frame,
            message: format!("{:#}", err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnreadable(_) => ErrorKind::SourceUnreadable,
            Self::ModelLoad(_) => ErrorKind::ModelLoad,
            Self::SinkUnwritable(_) => ErrorKind::SinkUnwritable,
            Self::OutputResolution(_) => ErrorKind::OutputResolution,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Stage { .. } => ErrorKind::Stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            PipelineError::model_load("missing prototxt").kind(),
            ErrorKind::ModelLoad
        );
        assert_eq!(
            PipelineError::stage(Stage::Write, 4, "encoder closed").kind(),
            ErrorKind::Stage
        );
    }

    #[test]
    fn test_stage_message_names_frame() {
        let err = PipelineError::stage(Stage::Detect, 6, "forward pass failed");
        assert_eq!(
            err.to_string(),
            "detect failed at frame 6: forward pass failed"
        );
    }

    #[test]
    fn test_anyhow_context_is_kept() {
        let inner = anyhow::anyhow!("permission denied").context("Failed to create output file");
        let err = PipelineError::sink_unwritable(inner);
        assert_eq!(
            err.to_string(),
            "Sink unwritable: Failed to create output file: permission denied"
        );
    }
}
