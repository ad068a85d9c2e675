//! Gradient-weighted class activation maps.
//!
//! ONNX Runtime has no autograd, so the last convolutional feature map and
//! the gradient of the class score with respect to it are produced by a
//! [`GradientSource`]. The served companion graph takes the image batch and a
//! one-hot class selector and returns both tensors as `(1, h, w, c)`. All of
//! the map arithmetic below is plain `ndarray`.

use crate::error::AttributionError;
use crate::preprocessing::Tensor;
use ndarray::{Array1, Array2, Array3, Axis};
use ort::{session::Session, value::Value};
use serde::Serialize;
use std::sync::Mutex;

/// Share of the map, by value, treated as the attention region
const TOP_PERCENTILE: f32 = 0.8;

/// Feature map and matching gradients, both `(h, w, c)`.
#[derive(Clone, Debug)]
pub struct FeatureGradients {
    pub features: Array3<f32>,
    pub gradients: Array3<f32>,
}

pub trait GradientSource: Send + Sync {
    fn feature_gradients(
        &self,
        tensor: &Tensor,
        class_index: usize,
    ) -> Result<FeatureGradients, AttributionError>;
}

/// Gradient source backed by the explainer ONNX graph.
///
/// Inputs by position: image `(1, H, W, 3)`, one-hot class selector `(1, N)`.
/// Outputs by position: feature map, gradients.
pub struct OnnxGradientSource {
    session: Mutex<Session>,
    num_classes: usize,
}

impl OnnxGradientSource {
    pub fn new(session: Session, num_classes: usize) -> Self {
        Self {
            session: Mutex::new(session),
            num_classes,
        }
    }
}

fn source_err(context: &str, e: impl std::fmt::Display) -> AttributionError {
    AttributionError::GradientSource(format!("{context}: {e}"))
}

fn squeeze_batch(view: ndarray::ArrayViewD<'_, f32>) -> Result<Array3<f32>, AttributionError> {
    let shape = view.shape().to_vec();
    if shape.len() != 4 || shape[0] != 1 {
        return Err(AttributionError::GradientSource(format!(
            "expected a (1, h, w, c) tensor, got {shape:?}"
        )));
    }
    view.to_owned()
        .into_shape_with_order((shape[1], shape[2], shape[3]))
        .map_err(|e| source_err("reshape", e))
}

impl GradientSource for OnnxGradientSource {
    fn feature_gradients(
        &self,
        tensor: &Tensor,
        class_index: usize,
    ) -> Result<FeatureGradients, AttributionError> {
        if class_index >= self.num_classes {
            return Err(AttributionError::ClassIndex {
                index: class_index,
                classes: self.num_classes,
            });
        }
        let mut session = self
            .session
            .lock()
            .map_err(|_| AttributionError::GradientSource("session lock poisoned".to_string()))?;
        if session.inputs.len() < 2 || session.outputs.len() < 2 {
            return Err(AttributionError::GradientSource(
                "explainer graph needs two inputs and two outputs".to_string(),
            ));
        }

        let image_name = session.inputs[0].name.clone();
        let selector_name = session.inputs[1].name.clone();
        let features_name = session.outputs[0].name.clone();
        let gradients_name = session.outputs[1].name.clone();

        let mut one_hot = ndarray::Array2::<f32>::zeros((1, self.num_classes));
        one_hot[[0, class_index]] = 1.0;

        let image = Value::from_array(tensor.to_batched()).map_err(|e| source_err("image input", e))?;
        let selector = Value::from_array(one_hot).map_err(|e| source_err("class selector", e))?;
        let outputs = session
            .run(ort::inputs![
                image_name.as_str() => &image,
                selector_name.as_str() => &selector
            ])
            .map_err(|e| source_err("inference", e))?;

        let features = outputs[features_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| source_err("feature map", e))?;
        let gradients = outputs[gradients_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| source_err("gradients", e))?;

        Ok(FeatureGradients {
            features: squeeze_batch(features)?,
            gradients: squeeze_batch(gradients)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quadrant {
    UpperLeft,
    UpperRight,
    LowerLeft,
    LowerRight,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::UpperLeft,
        Quadrant::UpperRight,
        Quadrant::LowerLeft,
        Quadrant::LowerRight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quadrant::UpperLeft => "upper_left",
            Quadrant::UpperRight => "upper_right",
            Quadrant::LowerLeft => "lower_left",
            Quadrant::LowerRight => "lower_right",
        }
    }
}

impl std::fmt::Display for Quadrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attention map for one class, at input resolution.
#[derive(Clone, Debug, Serialize)]
pub struct AttributionMap {
    pub class_index: usize,
    /// `(height, width)` grid in [0, 1]
    #[serde(skip)]
    pub heatmap: Array2<f32>,
    /// Normalized `(x, y)` center of mass of the top 20% region
    pub center_of_attention: (f32, f32),
    /// Standard deviation of the heatmap
    pub concentration: f32,
    pub dominant_quadrant: Quadrant,
    /// Mean heatmap value per quadrant, in [`Quadrant::ALL`] order
    pub quadrant_means: [f32; 4],
    /// Percentage of pixels above the 80th percentile
    pub coverage_percentage: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub narrative: Vec<String>,
}

pub struct AttributionExplainer {
    source: Box<dyn GradientSource>,
    num_classes: usize,
}

impl AttributionExplainer {
    pub fn new(source: Box<dyn GradientSource>, num_classes: usize) -> Self {
        Self {
            source,
            num_classes,
        }
    }

    pub fn explain(&self, tensor: &Tensor, class_index: usize) -> Result<AttributionMap, AttributionError> {
        if class_index >= self.num_classes {
            return Err(AttributionError::ClassIndex {
                index: class_index,
                classes: self.num_classes,
            });
        }
        let fg = self.source.feature_gradients(tensor, class_index)?;
        let cam = grad_cam(&fg.features, &fg.gradients)?;
        let heatmap = upsample_bilinear(&cam, tensor.height(), tensor.width());
        let map = summarize(heatmap, class_index);
        log::debug!(
            "Attribution for class {class_index}: dominant {} coverage {:.1}% center ({:.2}, {:.2})",
            map.dominant_quadrant,
            map.coverage_percentage,
            map.center_of_attention.0,
            map.center_of_attention.1
        );
        Ok(map)
    }
}

/// Channel weights from pooled gradients, weighted sum, ReLU, scaled to [0, 1].
pub fn grad_cam(features: &Array3<f32>, gradients: &Array3<f32>) -> Result<Array2<f32>, AttributionError> {
    if features.dim() != gradients.dim() {
        return Err(AttributionError::ShapeMismatch {
            features: features.dim(),
            gradients: gradients.dim(),
        });
    }
    let (h, w, c) = features.dim();
    if h == 0 || w == 0 || c == 0 {
        return Err(AttributionError::EmptyFeatureMap);
    }

    let weights: Array1<f32> = gradients
        .mean_axis(Axis(0))
        .and_then(|m| m.mean_axis(Axis(0)))
        .ok_or(AttributionError::EmptyFeatureMap)?;

    let mut cam = features.dot_channels(&weights);
    cam.mapv_inplace(|v| v.max(0.0));
    let max = cam.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        cam.mapv_inplace(|v| v / max);
    }
    Ok(cam)
}

trait DotChannels {
    fn dot_channels(&self, weights: &Array1<f32>) -> Array2<f32>;
}

impl DotChannels for Array3<f32> {
    fn dot_channels(&self, weights: &Array1<f32>) -> Array2<f32> {
        let (h, w, _) = self.dim();
        Array2::from_shape_fn((h, w), |(i, j)| {
            self.slice(ndarray::s![i, j, ..]).dot(weights)
        })
    }
}

/// Half-pixel-center bilinear resize.
pub fn upsample_bilinear(src: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (h, w) = src.dim();
    let sample = |pos: usize, out: usize, len: usize| -> (usize, usize, f32) {
        let g = ((pos as f32 + 0.5) * len as f32 / out as f32 - 0.5).max(0.0);
        let lo = (g.floor() as usize).min(len - 1);
        let hi = (lo + 1).min(len - 1);
        (lo, hi, g - lo as f32)
    };
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = sample(y, out_h, h);
        let (x0, x1, fx) = sample(x, out_w, w);
        let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
        let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
        (top * (1.0 - fy) + bottom * fy).clamp(0.0, 1.0)
    })
}

/// Linear-interpolated percentile of unsorted values.
fn percentile(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32)
}

pub fn summarize(heatmap: Array2<f32>, class_index: usize) -> AttributionMap {
    let (h, w) = heatmap.dim();
    let values: Vec<f32> = heatmap.iter().copied().collect();
    let n = values.len().max(1) as f32;
    let threshold = percentile(&values, TOP_PERCENTILE);

    let mut mass = 0.0f64;
    let (mut cx, mut cy) = (0.0f64, 0.0f64);
    let mut above = 0usize;
    let mut quadrant_sums = [0.0f64; 4];
    let mut quadrant_counts = [0usize; 4];
    for ((y, x), &v) in heatmap.indexed_iter() {
        if v >= threshold {
            mass += v as f64;
            cx += v as f64 * (x as f64 + 0.5);
            cy += v as f64 * (y as f64 + 0.5);
        }
        if v > threshold {
            above += 1;
        }
        let q = usize::from(y >= h / 2) * 2 + usize::from(x >= w / 2);
        quadrant_sums[q] += v as f64;
        quadrant_counts[q] += 1;
    }

    let center_of_attention = if mass > 0.0 {
        ((cx / mass / w as f64) as f32, (cy / mass / h as f64) as f32)
    } else {
        (0.5, 0.5)
    };

    let mean = values.iter().sum::<f32>() / n;
    let concentration = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();

    let mut quadrant_means = [0.0f32; 4];
    for q in 0..4 {
        if quadrant_counts[q] > 0 {
            quadrant_means[q] = (quadrant_sums[q] / quadrant_counts[q] as f64) as f32;
        }
    }
    let mut dominant = 0;
    for q in 1..4 {
        if quadrant_means[q] > quadrant_means[dominant] {
            dominant = q;
        }
    }

    AttributionMap {
        class_index,
        heatmap,
        center_of_attention,
        concentration,
        dominant_quadrant: Quadrant::ALL[dominant],
        quadrant_means,
        coverage_percentage: 100.0 * above as f32 / n,
        narrative: Vec::new(),
    }
}
