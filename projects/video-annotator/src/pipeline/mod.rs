// Annotation pipeline: detector, overlay, frame loop and run bookkeeping

pub mod detection;
pub mod orchestrator;
pub mod overlay;
pub mod types;
