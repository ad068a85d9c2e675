//! Canned explanation sentences for attention maps.
//!
//! Templates are plain strings with `{class}`, `{confidence}`, `{quadrant}` and
//! `{coverage}` placeholders. The English defaults can be replaced, fully or
//! partially, from a TOML file.

use crate::attribution::{AttributionMap, Quadrant};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub trait NarrativeGenerator: Send + Sync {
    fn narrate(&self, map: &AttributionMap, predicted_class: &str, confidence: f32) -> Vec<String>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeTemplates {
    /// Human name per quadrant, keyed by `upper_left` etc.
    pub quadrant_names: BTreeMap<String, String>,
    /// First sentence, names where the model looked
    pub region: String,
    /// Per-class finding sentence, keyed by class name
    pub class_findings: BTreeMap<String, String>,
    /// Used when a class has no entry in `class_findings`
    pub default_finding: String,
    /// Coverage percentage under which the attention counts as focused (default: 15)
    pub focused_coverage: f32,
    pub focused: String,
    pub diffuse: String,
    /// Confidence at or above which `confidence_high` is used (default: 0.8)
    pub high_confidence: f32,
    /// Confidence at or above which `confidence_moderate` is used (default: 0.5)
    pub moderate_confidence: f32,
    pub confidence_high: String,
    pub confidence_moderate: String,
    pub confidence_low: String,
}

impl Default for NarrativeTemplates {
    fn default() -> Self {
        let quadrant_names = [
            ("upper_left", "upper-left"),
            ("upper_right", "upper-right"),
            ("lower_left", "lower-left"),
            ("lower_right", "lower-right"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let class_findings = [
            ("cataract", "Cataract typically shows as haze or reduced clarity across the fundus image."),
            ("diabetic_retinopathy", "Diabetic retinopathy is suggested by lesions such as microaneurysms, hemorrhages or exudates."),
            ("glaucoma", "Glaucoma assessment relies mostly on the optic disc and the cup-to-disc ratio."),
            ("myopia", "Myopic changes often appear around the optic disc and in the posterior pole."),
            ("normal", "No pattern typical of the screened conditions stood out."),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            quadrant_names,
            region: "The model focused mainly on the {quadrant} region of the image.".to_string(),
            class_findings,
            default_finding: "The highlighted area contributed most to the '{class}' result.".to_string(),
            focused_coverage: 15.0,
            focused: "Attention is concentrated on a small area ({coverage}% of the image).".to_string(),
            diffuse: "Attention is spread over a wide area ({coverage}% of the image).".to_string(),
            high_confidence: 0.8,
            moderate_confidence: 0.5,
            confidence_high: "The model is fairly confident in this result ({confidence}%).".to_string(),
            confidence_moderate: "The model is moderately confident in this result ({confidence}%).".to_string(),
            confidence_low: "The model has low confidence in this result ({confidence}%); a professional examination is advised.".to_string(),
        }
    }
}

impl NarrativeTemplates {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read narrative templates: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid narrative templates: {}", path.display()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct TemplateNarrative {
    templates: NarrativeTemplates,
}

impl TemplateNarrative {
    pub fn new(templates: NarrativeTemplates) -> Self {
        Self { templates }
    }

    /// Custom templates from `path`, or the English defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path.map(NarrativeTemplates::from_toml_file) {
            Some(Ok(templates)) => Self::new(templates),
            Some(Err(e)) => {
                log::warn!("{e:#}; using default narrative templates");
                Self::default()
            }
            None => Self::default(),
        }
    }

    fn quadrant_name(&self, quadrant: Quadrant) -> String {
        self.templates
            .quadrant_names
            .get(quadrant.as_str())
            .cloned()
            .unwrap_or_else(|| quadrant.as_str().replace('_', "-"))
    }
}

fn fill(template: &str, class: &str, confidence: f32, quadrant: &str, coverage: f32) -> String {
    template
        .replace("{class}", class)
        .replace("{confidence}", &format!("{:.0}", confidence * 100.0))
        .replace("{quadrant}", quadrant)
        .replace("{coverage}", &format!("{coverage:.0}"))
}

impl NarrativeGenerator for TemplateNarrative {
    fn narrate(&self, map: &AttributionMap, predicted_class: &str, confidence: f32) -> Vec<String> {
        let t = &self.templates;
        let quadrant = self.quadrant_name(map.dominant_quadrant);
        let finding = t
            .class_findings
            .get(predicted_class)
            .unwrap_or(&t.default_finding);
        let spread = if map.coverage_percentage < t.focused_coverage {
            &t.focused
        } else {
            &t.diffuse
        };
        let certainty = if confidence >= t.high_confidence {
            &t.confidence_high
        } else if confidence >= t.moderate_confidence {
            &t.confidence_moderate
        } else {
            &t.confidence_low
        };

        [&t.region, finding, spread, certainty]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| fill(s, predicted_class, confidence, &quadrant, map.coverage_percentage))
            .collect()
    }
}
