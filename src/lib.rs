//! Quality-aware screening of retinal fundus photographs.
//!
//! [`pipeline::ScreeningPipeline`] ties the stages together: fundus
//! validation, preprocessing, ONNX classification (or the seeded fallback),
//! confidence calibration and optional Grad-CAM attribution.

pub mod attribution;
pub mod cache_common;
pub mod calibration;
pub mod clahe;
pub mod class_registry;
pub mod classifier;
pub mod color_utils;
pub mod config;
pub mod edge_density;
pub mod error;
pub mod explain_processing;
pub mod fallback;
pub mod fundus_validation;
pub mod heatmap_render;
pub mod image_input;
pub mod model_access;
pub mod model_processing;
pub mod narrative;
pub mod onnx_session;
pub mod output_manager;
pub mod pipeline;
pub mod preprocessing;
pub mod progress;
pub mod quality_assessment;
pub mod screen_processing;
pub mod shared_metadata;
pub mod sink;
pub mod thresholds;
pub mod validate_processing;

pub use calibration::{Verdict, VerdictStatus};
pub use error::{PipelineError, Rejection};
pub use pipeline::{Screening, ScreeningPipeline};
