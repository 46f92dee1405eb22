use crate::features::{FEATURE_ORDER, NUM_FEATURES};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of the scoring artifact
// when serialized to a TOML file.

/// Margins are clamped to this magnitude before the sigmoid to prevent overflow in exp().
const MARGIN_CLAMP: f64 = 700.0;

/// A logistic-link linear booster. Rows are optionally standardised as
/// `(x - center) / scale` before the dot product with `coefficients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinearBooster {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Vec<f64>>,
}

/// One node of a regression tree, stored in a flat list.
/// Children of node `i` always have indices strictly greater than `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Node {
    /// Rows with `x[feature] < threshold` go to `left`, all others to `right`.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf { value: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

/// A boosted ensemble of regression trees producing a logit margin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeEnsemble {
    pub base_margin: f64,
    pub trees: Vec<Tree>,
}

/// The scoring function carried by an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Booster {
    Linear(LinearBooster),
    TreeEnsemble(TreeEnsemble),
}

/// The top-level, self-contained scoring artifact.
/// This is the structure that gets saved to and loaded from a file.
/// Unknown keys anywhere in the artifact are rejected as corruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainedModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The column order the artifact was trained with. Must equal `FEATURE_ORDER`.
    pub feature_names: Vec<String>,
    pub booster: Booster,
}

/// Shared, read-only handle to the artifact loaded at startup.
pub type ModelHandle = Arc<TrainedModel>;

/// Custom error type for model loading, saving, and scoring.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The model lists {found} feature names, but {expected} are required.")]
    FeatureCountMismatch { found: usize, expected: usize },
    #[error(
        "Feature {position} of the model is '{found}', but '{expected}' was expected. The artifact was trained with a different column order."
    )]
    FeatureOrderMismatch {
        position: usize,
        expected: &'static str,
        found: String,
    },
    #[error("Invalid linear booster: {0}")]
    InvalidLinear(String),
    #[error("Invalid tree {tree} at node {node}: {reason}")]
    InvalidTree {
        tree: usize,
        node: usize,
        reason: String,
    },
    #[error("Cannot score an empty feature matrix.")]
    EmptyMatrix,
    #[error("Feature matrix has {found} columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("Scoring produced a non-finite probability for row {row}.")]
    NonFiniteOutput { row: usize },
    #[error("Model artifact '{path}' is unavailable: {source}")]
    Unavailable {
        path: String,
        #[source]
        source: Box<ModelError>,
    },
}

impl TrainedModel {
    /// Scores a feature matrix.
    ///
    /// # Arguments
    /// * `features`: A 2D array view with shape `[n_samples, NUM_FEATURES]`, columns in
    ///   `FEATURE_ORDER`.
    ///
    /// # Returns
    /// One probability in `[0, 1]` per row, in row order.
    ///
    /// The booster's structure is re-checked on every call, since the artifact's fields
    /// are public and a handle may have been built without going through `load`.
    pub fn score(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        // --- 1. Validate Inputs ---
        self.check_booster()?;
        if features.nrows() == 0 {
            return Err(ModelError::EmptyMatrix);
        }
        if features.ncols() != NUM_FEATURES {
            return Err(ModelError::MismatchedFeatureCount {
                found: features.ncols(),
                expected: NUM_FEATURES,
            });
        }

        // --- 2. Compute Margins ---
        let eta = match &self.booster {
            Booster::Linear(linear) => linear.margins(features),
            Booster::TreeEnsemble(ensemble) => features
                .rows()
                .into_iter()
                .map(|row| ensemble.margin(row))
                .collect::<Array1<f64>>(),
        };

        // --- 3. Apply Inverse Logit ---
        let probs = eta.mapv(|e| 1.0 / (1.0 + f64::exp(-e.clamp(-MARGIN_CLAMP, MARGIN_CLAMP))));

        if let Some(row) = probs.iter().position(|p| !p.is_finite()) {
            return Err(ModelError::NonFiniteOutput { row });
        }
        Ok(probs)
    }

    /// Checks the artifact against the fixed feature contract and its own structure.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.feature_names.len() != NUM_FEATURES {
            return Err(ModelError::FeatureCountMismatch {
                found: self.feature_names.len(),
                expected: NUM_FEATURES,
            });
        }
        for (position, (found, expected)) in
            self.feature_names.iter().zip(FEATURE_ORDER).enumerate()
        {
            if found != expected {
                return Err(ModelError::FeatureOrderMismatch {
                    position,
                    expected,
                    found: found.clone(),
                });
            }
        }

        self.check_booster()
    }

    fn check_booster(&self) -> Result<(), ModelError> {
        match &self.booster {
            Booster::Linear(linear) => internal::validate_linear(linear),
            Booster::TreeEnsemble(ensemble) => internal::validate_ensemble(ensemble),
        }
    }

    /// One-line summary of the artifact, safe to log.
    pub fn summary(&self) -> String {
        match &self.booster {
            Booster::Linear(linear) => format!(
                "linear booster ({} coefficients, standardised: {})",
                linear.coefficients.len(),
                linear.scale.is_some() || linear.center.is_some()
            ),
            Booster::TreeEnsemble(ensemble) => format!(
                "tree ensemble ({} trees, {} nodes)",
                ensemble.trees.len(),
                ensemble.trees.iter().map(|t| t.nodes.len()).sum::<usize>()
            ),
        }
    }

    /// Parses and validates an artifact held in memory.
    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        let model: Self = toml::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    /// Saves the artifact to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates an artifact from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }
}

/// Loads the artifact once and wraps it for sharing across request handlers.
/// Any failure is reported as `ModelError::Unavailable`.
pub fn load_handle(path: impl AsRef<Path>) -> Result<ModelHandle, ModelError> {
    let path = path.as_ref();
    TrainedModel::load(path)
        .map(Arc::new)
        .map_err(|source| ModelError::Unavailable {
            path: path.display().to_string(),
            source: Box::new(source),
        })
}

impl LinearBooster {
    fn margins(&self, features: ArrayView2<f64>) -> Array1<f64> {
        // Fold the standardisation into the weights: (x - c) / s . w = x . (w / s) - c . (w / s)
        let mut weights = Array1::from(self.coefficients.clone());
        if let Some(scale) = &self.scale {
            weights.iter_mut().zip(scale).for_each(|(w, s)| *w /= s);
        }
        let mut intercept = self.intercept;
        if let Some(center) = &self.center {
            intercept -= weights.iter().zip(center).map(|(w, c)| w * c).sum::<f64>();
        }
        features.dot(&weights) + intercept
    }
}

impl TreeEnsemble {
    fn margin(&self, row: ArrayView1<f64>) -> f64 {
        self.base_margin + self.trees.iter().map(|tree| tree.leaf_value(row)).sum::<f64>()
    }
}

impl Tree {
    /// Walks from the root to a leaf. Only called on trees that passed
    /// `validate_ensemble`, so children always point forward and features are in range.
    fn leaf_value(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// Internal module for artifact validation details.
mod internal {
    use super::*;

    fn check_length(name: &str, values: &[f64]) -> Result<(), ModelError> {
        if values.len() != NUM_FEATURES {
            return Err(ModelError::InvalidLinear(format!(
                "'{name}' has {} entries, expected {NUM_FEATURES}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidLinear(format!(
                "'{name}' contains non-finite values"
            )));
        }
        Ok(())
    }

    pub(super) fn validate_linear(linear: &LinearBooster) -> Result<(), ModelError> {
        if !linear.intercept.is_finite() {
            return Err(ModelError::InvalidLinear(
                "intercept must be finite".to_string(),
            ));
        }
        check_length("coefficients", &linear.coefficients)?;
        if let Some(center) = &linear.center {
            check_length("center", center)?;
        }
        if let Some(scale) = &linear.scale {
            check_length("scale", scale)?;
            if let Some(i) = scale.iter().position(|&s| s == 0.0) {
                return Err(ModelError::InvalidLinear(format!(
                    "scale for '{}' is zero",
                    FEATURE_ORDER[i]
                )));
            }
        }
        Ok(())
    }

    pub(super) fn validate_ensemble(ensemble: &TreeEnsemble) -> Result<(), ModelError> {
        if !ensemble.base_margin.is_finite() {
            return Err(ModelError::InvalidTree {
                tree: 0,
                node: 0,
                reason: "base_margin must be finite".to_string(),
            });
        }
        for (tree_index, tree) in ensemble.trees.iter().enumerate() {
            let invalid = |node: usize, reason: String| ModelError::InvalidTree {
                tree: tree_index,
                node,
                reason,
            };
            if tree.nodes.is_empty() {
                return Err(invalid(0, "tree has no nodes".to_string()));
            }
            let len = tree.nodes.len();
            for (i, node) in tree.nodes.iter().enumerate() {
                match node {
                    Node::Leaf { value } => {
                        if !value.is_finite() {
                            return Err(invalid(i, "leaf value must be finite".to_string()));
                        }
                    }
                    Node::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        if *feature >= NUM_FEATURES {
                            return Err(invalid(
                                i,
                                format!("split feature {feature} is out of range"),
                            ));
                        }
                        if !threshold.is_finite() {
                            return Err(invalid(i, "threshold must be finite".to_string()));
                        }
                        for child in [*left, *right] {
                            if child <= i || child >= len {
                                return Err(invalid(
                                    i,
                                    format!("child index {child} must lie in ({i}, {len})"),
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use tempfile::NamedTempFile;

    fn feature_names() -> Vec<String> {
        FEATURE_ORDER.iter().map(|s| s.to_string()).collect()
    }

    /// A linear model where only `age` and `family_history_diabetes` carry weight.
    fn simple_linear() -> TrainedModel {
        let mut coefficients = vec![0.0; NUM_FEATURES];
        coefficients[0] = 0.02;
        coefficients[15] = 1.0;
        TrainedModel {
            description: Some("test".to_string()),
            feature_names: feature_names(),
            booster: Booster::Linear(LinearBooster {
                intercept: -1.0,
                coefficients,
                center: None,
                scale: None,
            }),
        }
    }

    fn stump_ensemble() -> TrainedModel {
        TrainedModel {
            description: None,
            feature_names: feature_names(),
            booster: Booster::TreeEnsemble(TreeEnsemble {
                base_margin: 0.0,
                trees: vec![Tree {
                    nodes: vec![
                        Node::Split {
                            feature: 6,
                            threshold: 30.0,
                            left: 1,
                            right: 2,
                        },
                        Node::Leaf { value: -1.0 },
                        Node::Leaf { value: 1.0 },
                    ],
                }],
            }),
        }
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    #[test]
    fn test_linear_score_by_hand() {
        let model = simple_linear();
        let mut x = Array2::<f64>::zeros((2, NUM_FEATURES));
        x[[0, 0]] = 50.0;
        x[[1, 0]] = 50.0;
        x[[1, 15]] = 1.0;
        let p = model.score(x.view()).unwrap();
        assert_eq!(p.len(), 2);
        assert_abs_diff_eq!(p[0], sigmoid(0.0), epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], sigmoid(1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_linear_standardisation_folds_correctly() {
        let mut model = simple_linear();
        if let Booster::Linear(linear) = &mut model.booster {
            let mut center = vec![0.0; NUM_FEATURES];
            let mut scale = vec![1.0; NUM_FEATURES];
            center[0] = 40.0;
            scale[0] = 10.0;
            linear.coefficients[0] = 0.5;
            linear.center = Some(center);
            linear.scale = Some(scale);
        }
        let mut x = Array2::<f64>::zeros((1, NUM_FEATURES));
        x[[0, 0]] = 60.0;
        // (60 - 40) / 10 * 0.5 - 1.0 = 0.0
        let p = model.score(x.view()).unwrap();
        assert_abs_diff_eq!(p[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_tree_threshold_is_strict_less_than() {
        let model = stump_ensemble();
        let mut x = Array2::<f64>::zeros((3, NUM_FEATURES));
        x[[0, 6]] = 29.9;
        x[[1, 6]] = 30.0;
        x[[2, 6]] = 35.0;
        let p = model.score(x.view()).unwrap();
        assert_abs_diff_eq!(p[0], sigmoid(-1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], sigmoid(1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(p[2], sigmoid(1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_extreme_margins_stay_in_unit_interval() {
        let mut model = simple_linear();
        if let Booster::Linear(linear) = &mut model.booster {
            linear.coefficients[0] = 1e6;
        }
        let mut x = Array2::<f64>::from_elem((2, NUM_FEATURES), 1e6);
        x.row_mut(1).fill(-1e6);
        let p = model.score(x.view()).unwrap();
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(p[0] > 0.99);
        assert!(p[1] < 0.01);
    }

    #[test]
    fn test_score_rejects_bad_shapes() {
        let model = simple_linear();
        let empty = Array2::<f64>::zeros((0, NUM_FEATURES));
        assert!(matches!(
            model.score(empty.view()),
            Err(ModelError::EmptyMatrix)
        ));
        let narrow = Array2::<f64>::zeros((2, NUM_FEATURES - 1));
        match model.score(narrow.view()) {
            Err(ModelError::MismatchedFeatureCount { found, expected }) => {
                assert_eq!(found, 17);
                assert_eq!(expected, 18);
            }
            other => panic!("Expected MismatchedFeatureCount, got {:?}", other),
        }
    }

    #[test]
    fn test_nan_input_is_a_scoring_error() {
        let model = simple_linear();
        let mut x = Array2::<f64>::zeros((2, NUM_FEATURES));
        x[[1, 0]] = f64::NAN;
        match model.score(x.view()) {
            Err(ModelError::NonFiniteOutput { row }) => assert_eq!(row, 1),
            other => panic!("Expected NonFiniteOutput, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_swapped_feature_order() {
        let mut model = simple_linear();
        model.feature_names.swap(12, 13);
        match model.validate() {
            Err(ModelError::FeatureOrderMismatch {
                position,
                expected,
                found,
            }) => {
                assert_eq!(position, 12);
                assert_eq!(expected, "hdl_cholesterol");
                assert_eq!(found, "ldl_cholesterol");
            }
            other => panic!("Expected FeatureOrderMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_short_coefficients_and_zero_scale() {
        let mut model = simple_linear();
        if let Booster::Linear(linear) = &mut model.booster {
            linear.coefficients.pop();
        }
        assert!(matches!(model.validate(), Err(ModelError::InvalidLinear(_))));

        let mut model = simple_linear();
        if let Booster::Linear(linear) = &mut model.booster {
            linear.scale = Some(vec![0.0; NUM_FEATURES]);
        }
        assert!(matches!(model.validate(), Err(ModelError::InvalidLinear(_))));
    }

    #[test]
    fn test_validate_rejects_backward_child_pointer() {
        let mut model = stump_ensemble();
        if let Booster::TreeEnsemble(ensemble) = &mut model.booster {
            ensemble.trees[0].nodes[0] = Node::Split {
                feature: 6,
                threshold: 30.0,
                left: 0,
                right: 2,
            };
        }
        match model.validate() {
            Err(ModelError::InvalidTree { tree, node, .. }) => {
                assert_eq!(tree, 0);
                assert_eq!(node, 0);
            }
            other => panic!("Expected InvalidTree, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_feature() {
        let mut model = stump_ensemble();
        if let Booster::TreeEnsemble(ensemble) = &mut model.booster {
            ensemble.trees[0].nodes[0] = Node::Split {
                feature: NUM_FEATURES,
                threshold: 1.0,
                left: 1,
                right: 2,
            };
        }
        assert!(matches!(
            model.validate(),
            Err(ModelError::InvalidTree { .. })
        ));
    }

    #[test]
    fn test_save_and_load_preserve_predictions() {
        let file = NamedTempFile::new().unwrap();
        for model in [simple_linear(), stump_ensemble()] {
            model.save(file.path()).unwrap();
            let loaded = TrainedModel::load(file.path()).unwrap();
            let mut x = Array2::<f64>::zeros((2, NUM_FEATURES));
            x[[0, 0]] = 45.0;
            x[[1, 6]] = 31.0;
            let before = model.score(x.view()).unwrap();
            let after = loaded.score(x.view()).unwrap();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_load_handle_reports_unavailable() {
        let missing = std::env::temp_dir().join("diarisk-definitely-missing-model.toml");
        match load_handle(&missing) {
            Err(ModelError::Unavailable { path, source }) => {
                assert!(path.ends_with("diarisk-definitely-missing-model.toml"));
                assert!(matches!(*source, ModelError::IoError(_)));
            }
            other => panic!("Expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_score_rejects_short_coefficients_without_panicking() {
        let mut model = simple_linear();
        if let Booster::Linear(linear) = &mut model.booster {
            linear.coefficients = vec![0.1; NUM_FEATURES - 1];
        }
        let x = Array2::<f64>::zeros((1, NUM_FEATURES));
        assert!(matches!(
            model.score(x.view()),
            Err(ModelError::InvalidLinear(_))
        ));

        let mut model = simple_linear();
        if let Booster::Linear(linear) = &mut model.booster {
            linear.center = Some(vec![0.0; NUM_FEATURES + 1]);
        }
        assert!(matches!(
            model.score(x.view()),
            Err(ModelError::InvalidLinear(_))
        ));
    }

    #[test]
    fn test_score_rejects_backward_child_without_looping() {
        let mut model = stump_ensemble();
        if let Booster::TreeEnsemble(ensemble) = &mut model.booster {
            // A self-loop at the root would never reach a leaf.
            ensemble.trees[0].nodes[0] = Node::Split {
                feature: 6,
                threshold: 30.0,
                left: 0,
                right: 0,
            };
        }
        let x = Array2::<f64>::zeros((2, NUM_FEATURES));
        match model.score(x.view()) {
            Err(ModelError::InvalidTree { tree, node, .. }) => {
                assert_eq!(tree, 0);
                assert_eq!(node, 0);
            }
            other => panic!("Expected InvalidTree, got {:?}", other),
        }
    }

    #[test]
    fn test_score_rejects_out_of_range_feature_without_panicking() {
        let mut model = stump_ensemble();
        if let Booster::TreeEnsemble(ensemble) = &mut model.booster {
            ensemble.trees[0].nodes[0] = Node::Split {
                feature: 40,
                threshold: 1.0,
                left: 1,
                right: 2,
            };
        }
        let x = Array2::<f64>::zeros((1, NUM_FEATURES));
        assert!(matches!(
            model.score(x.view()),
            Err(ModelError::InvalidTree { .. })
        ));
    }

    fn stump_artifact(split_extra: &str, top_extra: &str) -> String {
        let names = FEATURE_ORDER
            .iter()
            .map(|name| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            r#"feature_names = [{names}]
{top_extra}
[booster]
kind = "tree_ensemble"
base_margin = 0.0

[[booster.trees]]
nodes = [
    {{ type = "split", feature = 6, threshold = 30.0, left = 1, right = 2{split_extra} }},
    {{ type = "leaf", value = -1.0 }},
    {{ type = "leaf", value = 1.0 }},
]
"#
        )
    }

    #[test]
    fn test_unknown_artifact_keys_are_rejected() {
        assert!(TrainedModel::from_toml_str(&stump_artifact("", "")).is_ok());

        let result = TrainedModel::from_toml_str(&stump_artifact(", missing_left = false", ""));
        assert!(matches!(result, Err(ModelError::TomlParseError(_))));

        let result = TrainedModel::from_toml_str(&stump_artifact("", "link = \"probit\""));
        assert!(matches!(result, Err(ModelError::TomlParseError(_))));
    }

    #[test]
    fn test_corrupt_artifact_is_a_parse_error() {
        let result = TrainedModel::from_toml_str("feature_names = [\"age\"\nbooster = 3");
        assert!(matches!(result, Err(ModelError::TomlParseError(_))));
    }
}
