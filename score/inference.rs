//! # Inference Adapter
//!
//! Bridges validated `FeatureRecord`s and the numeric contract of the scoring
//! artifact. Records become rows of a matrix in `FEATURE_ORDER`, the whole matrix
//! is scored in one call, and the probabilities come back as `PredictionResult`s
//! whose `id` is the record's position in the input.
//!
//! A batch succeeds or fails as a unit: there are no partial results.

use crate::features::{FeatureRecord, NUM_FEATURES, SchemaError, json_kind};
use crate::model::{ModelError, ModelHandle};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Name of the list field in a batch payload.
pub const BATCH_FIELD: &str = "patients";

/// A single scored record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Probability of diabetes, in `[0, 1]`.
    pub probability: f64,
    /// 0-based position of the record within its request.
    pub id: usize,
}

/// Response body of a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPrediction {
    pub predictions: Vec<PredictionResult>,
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Invalid patient record: {0}")]
    InvalidRecord(#[from] SchemaError),
    #[error("Invalid patient record at index {index}: {source}")]
    InvalidBatchRecord {
        index: usize,
        #[source]
        source: SchemaError,
    },
    #[error("Batch contains no patient records; at least one is required.")]
    EmptyBatch,
    #[error("Scoring failed: {0}")]
    Scoring(#[from] ModelError),
}

impl PredictionError {
    /// True when the caller sent something wrong, false for failures on our side.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, PredictionError::Scoring(_))
    }
}

/// Scores records against a shared, read-only model. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Predictor {
    model: ModelHandle,
}

impl Predictor {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Scores one record. The result always carries `id: 0`.
    pub fn predict_single(
        &self,
        record: &FeatureRecord,
    ) -> Result<PredictionResult, PredictionError> {
        let mut results = self.score_records(std::slice::from_ref(record))?;
        // score_records returns exactly one result per record
        match results.pop() {
            Some(result) => Ok(result),
            None => Err(PredictionError::Scoring(ModelError::EmptyMatrix)),
        }
    }

    /// Scores an ordered, non-empty batch with a single model call.
    pub fn predict_batch(
        &self,
        records: &[FeatureRecord],
    ) -> Result<Vec<PredictionResult>, PredictionError> {
        if records.is_empty() {
            return Err(PredictionError::EmptyBatch);
        }
        self.score_records(records)
    }

    /// Validates a raw single-record payload and scores it.
    pub fn predict_json(&self, payload: &Value) -> Result<PredictionResult, PredictionError> {
        let record = FeatureRecord::from_json(payload)?;
        self.predict_single(&record)
    }

    /// Validates a raw `{"patients": [...]}` payload and scores it.
    pub fn predict_batch_json(&self, payload: &Value) -> Result<BatchPrediction, PredictionError> {
        let records = parse_batch(payload)?;
        let predictions = self.predict_batch(&records)?;
        Ok(BatchPrediction { predictions })
    }

    fn score_records(
        &self,
        records: &[FeatureRecord],
    ) -> Result<Vec<PredictionResult>, PredictionError> {
        let matrix = build_matrix(records);
        let probabilities = self.model.score(matrix.view())?;
        if probabilities.len() != records.len() {
            return Err(PredictionError::Scoring(ModelError::MismatchedFeatureCount {
                found: probabilities.len(),
                expected: records.len(),
            }));
        }
        log::debug!("Scored {} record(s)", records.len());

        Ok(probabilities
            .iter()
            .enumerate()
            .map(|(id, &probability)| PredictionResult { probability, id })
            .collect())
    }
}

/// Lays records out as rows of an `[n, NUM_FEATURES]` matrix, preserving input order.
pub fn build_matrix(records: &[FeatureRecord]) -> Array2<f64> {
    let mut matrix = Array2::<f64>::zeros((records.len(), NUM_FEATURES));
    for (mut row, record) in matrix.rows_mut().into_iter().zip(records) {
        row.iter_mut()
            .zip(record.to_row())
            .for_each(|(cell, value)| *cell = value);
    }
    matrix
}

/// Validates every record of a batch payload. The first invalid record fails the batch.
pub fn parse_batch(payload: &Value) -> Result<Vec<FeatureRecord>, PredictionError> {
    let object = payload.as_object().ok_or(SchemaError::NotAnObject {
        found: json_kind(payload),
    })?;
    let patients = match object.get(BATCH_FIELD) {
        None | Some(Value::Null) => {
            return Err(SchemaError::MissingField(BATCH_FIELD.to_string()).into());
        }
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(SchemaError::NotArray {
                field: BATCH_FIELD.to_string(),
                found: json_kind(other),
            }
            .into());
        }
    };

    patients
        .iter()
        .enumerate()
        .map(|(index, item)| {
            FeatureRecord::from_json(item)
                .map_err(|source| PredictionError::InvalidBatchRecord { index, source })
        })
        .collect()
}
