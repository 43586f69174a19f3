use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Context, Result};
use opencv::core::{Mat, Scalar, Size, CV_32F};
use opencv::dnn::{self, Net};
use opencv::prelude::*;
use std::path::{Path, PathBuf};

pub const PROTOTXT_FILE: &str = "MobileNetSSD_deploy.prototxt";
pub const WEIGHTS_FILE: &str = "MobileNetSSD_deploy.caffemodel";

/// Values per row of an SSD `detection_out` blob:
/// image id, class id, confidence, left, top, right, bottom.
const SSD_ROW_LEN: usize = 7;

/// Anything that turns a frame into a set of detections.
pub trait Detector<F> {
    fn detect(&mut self, frame: &F) -> Result<Vec<Detection>>;
}

/// Preprocessing and filtering constants of the MobileNet-SSD network.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DetectorConfig {
    /// Network input width; height follows the frame's aspect ratio
    pub input_width: f64,
    pub scale_factor: f64,
    /// Subtracted from every channel before scaling
    pub mean: f64,
    /// Detections at or below this confidence are dropped
    pub confidence_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: 240.0,
            scale_factor: 0.007843,
            mean: 127.5,
            confidence_threshold: 0.5,
        }
    }
}

impl DetectorConfig {
    /// Network input size for a frame of `cols` x `rows`, preserving aspect ratio.
    pub fn input_size(&self, cols: i32, rows: i32) -> Size {
        let aspect = cols as f64 / rows.max(1) as f64;
        let height = if aspect > 0.0 {
            self.input_width / aspect
        } else {
            self.input_width
        };
        Size::new(self.input_width as i32, (height as i32).max(1))
    }
}

/// Paths of the two files making up the Caffe model.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub prototxt: PathBuf,
    pub weights: PathBuf,
}

impl ModelAssets {
    /// Locates both model files in `model_dir`. Missing files are a model load failure.
    pub fn locate(model_dir: &Path) -> PipelineResult<Self> {
        let prototxt = model_dir.join(PROTOTXT_FILE);
        let weights = model_dir.join(WEIGHTS_FILE);

        for path in [&prototxt, &weights] {
            if !path.is_file() {
                return Err(PipelineError::model_load(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
        }

        Ok(Self { prototxt, weights })
    }
}

/// MobileNet-SSD detector running on OpenCV's DNN module.
pub struct SsdDetector {
    net: Net,
    config: DetectorConfig,
}

impl SsdDetector {
    pub fn load(assets: &ModelAssets, config: DetectorConfig) -> PipelineResult<Self> {
        let net = Self::read_net(assets).map_err(PipelineError::model_load)?;
        tracing::info!(
            "SsdDetector: loaded {} with {}",
            assets.weights.display(),
            assets.prototxt.display()
        );
        Ok(Self { net, config })
    }

    fn read_net(assets: &ModelAssets) -> Result<Net> {
        let prototxt = assets
            .prototxt
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 model path: {:?}", assets.prototxt))?;
        let weights = assets
            .weights
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 model path: {:?}", assets.weights))?;

        let net = dnn::read_net_from_caffe(prototxt, weights)
            .with_context(|| format!("Failed to parse Caffe model {}", weights))?;
        if net.empty()? {
            return Err(anyhow!("Caffe model {} has no layers", weights));
        }
        Ok(net)
    }
}

impl Detector<Mat> for SsdDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let cols = frame.cols();
        let rows = frame.rows();

        let bgr;
        let input = if frame.channels() == 4 {
            let mut converted = Mat::default();
            opencv::imgproc::cvt_color_def(frame, &mut converted, opencv::imgproc::COLOR_BGRA2BGR)?;
            bgr = converted;
            &bgr
        } else {
            frame
        };

        let blob = dnn::blob_from_image(
            input,
            self.config.scale_factor,
            self.config.input_size(cols, rows),
            Scalar::all(self.config.mean),
            false,
            false,
            CV_32F,
        )?;

        self.net.set_input(&blob, "", 1.0, Scalar::default())?;
        let output = self.net.forward_single("")?;
        if !output.is_continuous() {
            return Err(anyhow!("Detection output is not continuous"));
        }

        let data = output.data_typed::<f32>()?;
        Ok(decode_ssd_output(
            data,
            cols as f32,
            rows as f32,
            self.config.confidence_threshold,
        ))
    }
}

/// Decodes SSD output rows into pixel-space boxes for a `cols` x `rows` frame.
pub fn decode_ssd_output(data: &[f32], cols: f32, rows: f32, threshold: f32) -> Vec<Detection> {
    data.chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[2] > threshold)
        .map(|row| Detection {
            class_id: row[1] as i32,
            confidence: row[2],
            bbox: BBox {
                left: row[3] * cols,
                top: row[4] * rows,
                right: row[5] * cols,
                bottom: row[6] * rows,
            },
        })
        .collect()
}
