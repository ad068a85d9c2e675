//! Synthetic predictions used when no classifier is available.
//!
//! The class is drawn from the registry's fallback weights, so the
//! historically dominant class is the most likely outcome. Results are
//! always flagged [`PredictionMode::Fallback`] and must never be read as a
//! diagnosis.

use crate::class_registry::{ClassRegistry, TaskKind};
use crate::classifier::{ClassProbabilities, Prediction, PredictionMode, Predictor};
use crate::error::ClassifierError;
use crate::preprocessing::Tensor;
use crate::thresholds::CalibrationThresholds;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Range of the synthetic confidence given to the drawn class
const CONFIDENCE_RANGE: (f32, f32) = (0.55, 0.85);

pub struct FallbackPredictor {
    registry: ClassRegistry,
    calibration: CalibrationThresholds,
    rng: Mutex<StdRng>,
    seed: Option<u64>,
}

impl FallbackPredictor {
    /// `seed = None` draws from OS entropy.
    pub fn new(registry: ClassRegistry, calibration: CalibrationThresholds, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            registry,
            calibration,
            rng: Mutex::new(rng),
            seed,
        }
    }

    /// Infallible draw.
    pub fn draw(&self) -> Prediction {
        // A poisoned lock only means another thread panicked mid-draw
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let index = match WeightedIndex::new(&self.registry.fallback_weights) {
            Ok(dist) => dist.sample(&mut *rng),
            Err(_) => self.dominant_index(),
        };
        let confidence = rng.gen_range(CONFIDENCE_RANGE.0..=CONFIDENCE_RANGE.1);

        if self.registry.task == TaskKind::Refraction {
            let cut = self.calibration.myopia_diopters;
            let se = if index == 0 {
                rng.gen_range(-6.0..=cut)
            } else {
                rng.gen_range((cut + 0.25)..=2.0)
            };
            return Prediction::from_refraction(se, &self.registry, &self.calibration, PredictionMode::Fallback);
        }

        let probabilities = self.spread(index, confidence);
        match ClassProbabilities::new(&self.registry.class_names, probabilities) {
            Ok(probs) => Prediction::from_probabilities(probs, PredictionMode::Fallback),
            // lengths come from the same registry
            Err(_) => Prediction {
                predicted_class: self.registry.class_names[index].clone(),
                class_index: index,
                confidence,
                probabilities: None,
                spherical_equivalent: None,
                mode: PredictionMode::Fallback,
            },
        }
    }

    /// `confidence` on the drawn class, the rest split by prior weight.
    fn spread(&self, index: usize, confidence: f32) -> Vec<f32> {
        let n = self.registry.len();
        if n == 1 {
            return vec![1.0];
        }
        let others: f32 = self
            .registry
            .fallback_weights
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, w)| w)
            .sum();
        self.registry
            .fallback_weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                if i == index {
                    confidence
                } else if others > 0.0 {
                    (1.0 - confidence) * w / others
                } else {
                    (1.0 - confidence) / (n - 1) as f32
                }
            })
            .collect()
    }

    fn dominant_index(&self) -> usize {
        self.registry
            .index_of(self.registry.dominant_class())
            .unwrap_or(0)
    }
}

impl Predictor for FallbackPredictor {
    fn predict(&self, _tensor: &Tensor) -> Result<Prediction, ClassifierError> {
        Ok(self.draw())
    }

    fn describe(&self) -> String {
        match self.seed {
            Some(seed) => format!("fallback {} (seed {seed})", self.registry.task),
            None => format!("fallback {}", self.registry.task),
        }
    }
}
