//! Degradation classifiers.
//!
//! The pipeline only sees [`DegradationClassifier`]. Models are trained offline
//! and exported as a JSON artifact, loaded once at startup.

use crate::{Error, Result, record::FeatureVector};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::info;

pub trait DegradationClassifier: Send + Sync {
    /// `Some(true)` when the link looks degraded, `None` when no model is
    /// configured.
    fn predict(&self, features: &FeatureVector) -> Option<bool>;

    fn name(&self) -> &'static str;
}

/// Stand-in used when no model artifact is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl DegradationClassifier for Unconfigured {
    fn predict(&self, _features: &FeatureVector) -> Option<bool> {
        None
    }

    fn name(&self) -> &'static str {
        "unconfigured"
    }
}

fn default_decision_threshold() -> f64 {
    0.5
}

/// A trained model as exported for the monitor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Logistic {
        weights: [f64; FeatureVector::LEN],
        bias: f64,
        #[serde(default = "default_decision_threshold")]
        threshold: f64,
    },
    Forest {
        trees: Vec<DecisionTree>,
    },
    Rules {
        max_latency_ms: f64,
        max_lost_percent: f64,
        min_throughput_mbps: f64,
    },
}

/// Array-encoded binary tree; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    /// Go left when `features[feature] <= threshold`.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Probability that the link is degraded.
    Leaf { value: f64 },
}

impl DecisionTree {
    fn validate(&self, tree_idx: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Classifier(format!("tree {tree_idx} has no nodes")));
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= FeatureVector::LEN {
                        return Err(Error::Classifier(format!(
                            "tree {tree_idx} node {idx}: feature index {feature} out of range"
                        )));
                    }
                    // Children must come after their parent so evaluation terminates
                    for child in [left, right] {
                        if *child <= idx || *child >= self.nodes.len() {
                            return Err(Error::Classifier(format!(
                                "tree {tree_idx} node {idx}: invalid child {child}"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    if !(0.0..=1.0).contains(value) {
                        return Err(Error::Classifier(format!(
                            "tree {tree_idx} node {idx}: leaf value {value} outside [0, 1]"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, features: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if features[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

impl ModelArtifact {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Classifier(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_str(json)?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn validate(&self) -> Result<()> {
        match self {
            ModelArtifact::Logistic {
                weights,
                bias,
                threshold,
            } => {
                if !weights.iter().chain([bias, threshold]).all(|v| v.is_finite()) {
                    return Err(Error::Classifier(
                        "logistic model has non-finite parameters".to_string(),
                    ));
                }
                Ok(())
            }
            ModelArtifact::Forest { trees } => {
                if trees.is_empty() {
                    return Err(Error::Classifier("forest has no trees".to_string()));
                }
                trees
                    .iter()
                    .enumerate()
                    .try_for_each(|(idx, tree)| tree.validate(idx))
            }
            ModelArtifact::Rules { .. } => Ok(()),
        }
    }

    /// Probability-like score in [0, 1] for the rule-free model kinds.
    fn score(&self, features: &[f64]) -> f64 {
        match self {
            ModelArtifact::Logistic { weights, bias, .. } => {
                let z: f64 = weights
                    .iter()
                    .zip(features)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + bias;
                1.0 / (1.0 + (-z).exp())
            }
            ModelArtifact::Forest { trees } => {
                trees.iter().map(|t| t.evaluate(features)).sum::<f64>() / trees.len() as f64
            }
            ModelArtifact::Rules { .. } => 0.0,
        }
    }
}

impl DegradationClassifier for ModelArtifact {
    fn predict(&self, features: &FeatureVector) -> Option<bool> {
        let x = features.as_slice();
        let degraded = match self {
            ModelArtifact::Logistic { threshold, .. } => self.score(x) >= *threshold,
            ModelArtifact::Forest { .. } => self.score(x) >= default_decision_threshold(),
            ModelArtifact::Rules {
                max_latency_ms,
                max_lost_percent,
                min_throughput_mbps,
            } => x[1] > *max_latency_ms || x[3] > *max_lost_percent || x[0] < *min_throughput_mbps,
        };
        Some(degraded)
    }

    fn name(&self) -> &'static str {
        match self {
            ModelArtifact::Logistic { .. } => "logistic",
            ModelArtifact::Forest { .. } => "forest",
            ModelArtifact::Rules { .. } => "rules",
        }
    }
}

/// Load the configured model, or the [`Unconfigured`] stand-in when no path
/// is given.
pub fn load_classifier(path: Option<&Path>) -> Result<Box<dyn DegradationClassifier>> {
    match path {
        Some(path) => {
            let artifact = ModelArtifact::from_path(path)?;
            info!(path = %path.display(), model = artifact.name(), "loaded degradation model");
            Ok(Box::new(artifact))
        }
        None => {
            info!("no degradation model configured; predictions disabled");
            Ok(Box::new(Unconfigured))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // [throughput_mbps, latency_ms, jitter_ms, lost_percent]
    fn features(throughput: f64, latency: f64, jitter: f64, lost: f64) -> FeatureVector {
        FeatureVector([throughput, latency, jitter, lost])
    }

    const FOREST: &str = r#"{
        "kind": "forest",
        "trees": [
            {"nodes": [
                {"type": "split", "feature": 1, "threshold": 50.0, "left": 1, "right": 2},
                {"type": "leaf", "value": 0.0},
                {"type": "leaf", "value": 1.0}
            ]},
            {"nodes": [
                {"type": "split", "feature": 3, "threshold": 5.0, "left": 1, "right": 2},
                {"type": "leaf", "value": 0.1},
                {"type": "leaf", "value": 0.9}
            ]},
            {"nodes": [
                {"type": "split", "feature": 0, "threshold": 20.0, "left": 1, "right": 2},
                {"type": "leaf", "value": 0.8},
                {"type": "leaf", "value": 0.2}
            ]}
        ]
    }"#;

    #[test]
    fn test_unconfigured_predicts_nothing() {
        assert_eq!(Unconfigured.predict(&features(1.0, 900.0, 9.0, 90.0)), None);
    }

    #[test]
    fn test_forest_majority() {
        let model = ModelArtifact::from_json(FOREST).unwrap();
        assert_eq!(model.name(), "forest");

        // (0.0 + 0.1 + 0.2) / 3 = 0.1
        assert_eq!(model.predict(&features(900.0, 2.0, 0.1, 0.0)), Some(false));
        // (1.0 + 0.9 + 0.2) / 3 = 0.7
        assert_eq!(model.predict(&features(900.0, 80.0, 3.0, 12.0)), Some(true));
        // (1.0 + 0.1 + 0.2) / 3 ~= 0.43
        assert_eq!(model.predict(&features(900.0, 80.0, 3.0, 0.0)), Some(false));
    }

    #[test]
    fn test_logistic_threshold() {
        let json = r#"{"kind": "logistic", "weights": [-0.05, 0.1, 0.0, 0.5], "bias": 0.0}"#;
        let model = ModelArtifact::from_json(json).unwrap();

        // z = -5 + 0.2 = -4.8
        assert_eq!(model.predict(&features(100.0, 2.0, 0.0, 0.0)), Some(false));
        // z = -0.5 + 8 + 5 = 12.5
        assert_eq!(model.predict(&features(10.0, 80.0, 0.0, 10.0)), Some(true));
    }

    #[test]
    fn test_rules_model() {
        let json = r#"{"kind": "rules", "max_latency_ms": 50.0, "max_lost_percent": 5.0, "min_throughput_mbps": 20.0}"#;
        let model = ModelArtifact::from_json(json).unwrap();

        assert_eq!(model.predict(&features(100.0, 10.0, 1.0, 0.0)), Some(false));
        assert_eq!(model.predict(&features(100.0, 51.0, 1.0, 0.0)), Some(true));
        assert_eq!(model.predict(&features(100.0, 10.0, 1.0, 5.5)), Some(true));
        assert_eq!(model.predict(&features(19.9, 10.0, 1.0, 0.0)), Some(true));
    }

    #[test]
    fn test_rejects_cyclic_tree() {
        let json = r#"{"kind": "forest", "trees": [{"nodes": [
            {"type": "split", "feature": 0, "threshold": 1.0, "left": 0, "right": 1},
            {"type": "leaf", "value": 1.0}
        ]}]}"#;
        assert!(matches!(
            ModelArtifact::from_json(json),
            Err(Error::Classifier(_))
        ));
    }

    #[test]
    fn test_rejects_bad_feature_index() {
        let json = r#"{"kind": "forest", "trees": [{"nodes": [
            {"type": "split", "feature": 4, "threshold": 1.0, "left": 1, "right": 2},
            {"type": "leaf", "value": 1.0},
            {"type": "leaf", "value": 0.0}
        ]}]}"#;
        assert!(ModelArtifact::from_json(json).is_err());
    }

    #[test]
    fn test_rejects_unknown_kind() {
        assert!(matches!(
            ModelArtifact::from_json(r#"{"kind": "pickle"}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_load_classifier() {
        assert_eq!(load_classifier(None).unwrap().name(), "unconfigured");

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FOREST.as_bytes()).unwrap();
        let classifier = load_classifier(Some(file.path())).unwrap();
        assert_eq!(classifier.name(), "forest");

        assert!(load_classifier(Some(Path::new("/nonexistent/model.json"))).is_err());
    }

    #[test]
    fn test_example_model_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("model.example.json");
        let model = ModelArtifact::from_path(path).unwrap();
        assert_eq!(model.name(), "forest");
        // (0.9 + 0.2) / 2
        assert_eq!(model.predict(&features(5.0, 2.0, 0.0, 0.0)), Some(true));
        // (0.1 + 0.2) / 2
        assert_eq!(model.predict(&features(500.0, 2.0, 0.0, 0.0)), Some(false));
    }
}
