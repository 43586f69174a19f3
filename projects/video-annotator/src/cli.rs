use crate::pipeline::orchestrator::PipelineConfig;
use crate::video::Backend;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding MobileNetSSD_deploy.prototxt and MobileNetSSD_deploy.caffemodel
    #[arg(long, global = true, env = "VIDEO_ANNOTATOR_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    /// Media root; annotated videos land in <output-root>/Movies/Folder
    #[arg(long, global = true, env = "VIDEO_ANNOTATOR_OUTPUT_ROOT", default_value = ".")]
    pub output_root: PathBuf,

    /// Decoder used for the source video
    #[arg(long, global = true, value_enum, default_value_t = Backend::Ffmpeg)]
    pub backend: Backend,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Annotate one video and exit
    Process {
        /// Source video
        #[arg(long)]
        input: PathBuf,
    },
    /// Serve the HTTP control surface
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Port to bind to
        #[arg(long, default_value_t = 12206)]
        port: u16,

        /// Root directory for source videos
        #[arg(long, env = "VIDEO_ANNOTATOR_VIDEO_ROOT")]
        video_root: PathBuf,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.model_dir.clone(), self.output_root.clone());
        config.backend = self.backend;
        config
    }
}
