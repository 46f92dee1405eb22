//! # Feature Record Module
//!
//! The exclusive entry point for patient data. A raw JSON payload is validated
//! against a strict, predefined schema and turned into a `FeatureRecord` whose
//! numeric values sit in the canonical column order the scoring artifact was
//! trained with.
//!
//! - Strict Schema: Field names are not configurable. The 18 required names and
//!   their order are the compile-time constant `FEATURE_ORDER`. The order of keys
//!   in the incoming object is never consulted.
//! - No Guessing: A missing or non-numeric required field is an error. Nothing is
//!   defaulted and nothing is coerced from text.
//! - Ignored Extras: The six descriptive fields are accepted (text or null) but
//!   never reach the feature row. Unknown keys are ignored.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Number of numeric columns the scoring artifact consumes.
pub const NUM_FEATURES: usize = 18;

/// Defines the canonical column order of the feature matrix. This order is strictly
/// enforced when building rows and when loading an artifact.
pub const FEATURE_ORDER: [&str; NUM_FEATURES] = [
    "age",
    "alcohol_consumption_per_week",
    "physical_activity_minutes_per_week",
    "diet_score",
    "sleep_hours_per_day",
    "screen_time_hours_per_day",
    "bmi",
    "waist_to_hip_ratio",
    "systolic_bp",
    "diastolic_bp",
    "heart_rate",
    "cholesterol_total",
    "hdl_cholesterol",
    "ldl_cholesterol",
    "triglycerides",
    "family_history_diabetes",
    "hypertension_history",
    "cardiovascular_history",
];

/// Columns that hold 0/1 history indicators.
pub const BINARY_FEATURES: [&str; 3] = [
    "family_history_diabetes",
    "hypertension_history",
    "cardiovascular_history",
];

/// Descriptive fields that are accepted but never scored.
pub const DESCRIPTIVE_FIELDS: [&str; 6] = [
    "gender",
    "ethnicity",
    "education_level",
    "income_level",
    "smoking_status",
    "employment_status",
];

/// A comprehensive error type for record validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Expected a JSON object describing one patient, found {found}.")]
    NotAnObject { found: &'static str },
    #[error("The required field '{0}' is missing. Please check spelling and case.")]
    MissingField(String),
    #[error("The required field '{field}' must be a number (found {found}).")]
    NotNumeric { field: String, found: &'static str },
    #[error("The field '{field}' must be 0 or 1 (found {value}).")]
    InvalidFlag { field: String, value: f64 },
    #[error("The field '{0}' must be a finite number.")]
    NonFinite(String),
    #[error("The optional field '{field}' must be text or null (found {found}).")]
    NotText { field: String, found: &'static str },
    #[error("The field '{field}' must be a list of patient records (found {found}).")]
    NotArray { field: String, found: &'static str },
}

/// The descriptive, non-scored part of a patient profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Demographics {
    pub gender: Option<String>,
    pub ethnicity: Option<String>,
    pub education_level: Option<String>,
    pub income_level: Option<String>,
    pub smoking_status: Option<String>,
    pub employment_status: Option<String>,
}

impl Demographics {
    fn slot_mut(&mut self, field: &str) -> Option<&mut Option<String>> {
        match field {
            "gender" => Some(&mut self.gender),
            "ethnicity" => Some(&mut self.ethnicity),
            "education_level" => Some(&mut self.education_level),
            "income_level" => Some(&mut self.income_level),
            "smoking_status" => Some(&mut self.smoking_status),
            "employment_status" => Some(&mut self.employment_status),
            _ => None,
        }
    }
}

/// One patient's validated profile. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    values: [f64; NUM_FEATURES],
    demographics: Demographics,
}

impl FeatureRecord {
    /// Builds a record from values already laid out in `FEATURE_ORDER`.
    pub fn from_values(values: [f64; NUM_FEATURES]) -> Result<Self, SchemaError> {
        for (name, &value) in FEATURE_ORDER.iter().zip(values.iter()) {
            if !value.is_finite() {
                return Err(SchemaError::NonFinite((*name).to_string()));
            }
            validate_flag(name, value)?;
        }
        Ok(Self {
            values,
            demographics: Demographics::default(),
        })
    }

    /// Validates a parsed JSON payload against the record schema.
    pub fn from_json(payload: &Value) -> Result<Self, SchemaError> {
        let object = payload.as_object().ok_or(SchemaError::NotAnObject {
            found: json_kind(payload),
        })?;

        let mut values = [0.0; NUM_FEATURES];
        for (slot, name) in values.iter_mut().zip(FEATURE_ORDER.iter()) {
            *slot = internal::required_number(object, name)?;
            validate_flag(name, *slot)?;
        }

        let demographics = internal::descriptive_fields(object)?;
        Ok(Self {
            values,
            demographics,
        })
    }

    /// The numeric feature row, in `FEATURE_ORDER`.
    pub fn to_row(&self) -> [f64; NUM_FEATURES] {
        self.values
    }

    /// Looks up one required value by its field name.
    pub fn get(&self, field: &str) -> Option<f64> {
        FEATURE_ORDER
            .iter()
            .position(|name| *name == field)
            .map(|i| self.values[i])
    }

    pub fn demographics(&self) -> &Demographics {
        &self.demographics
    }
}

fn validate_flag(field: &str, value: f64) -> Result<(), SchemaError> {
    if BINARY_FEATURES.contains(&field) && value != 0.0 && value != 1.0 {
        return Err(SchemaError::InvalidFlag {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

/// Short, human-readable name of a JSON value's type, for error messages.
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Internal module for field-level extraction.
mod internal {
    use super::*;

    /// Absent and explicit null are treated alike: the field is missing.
    pub(super) fn required_number(
        object: &Map<String, Value>,
        name: &str,
    ) -> Result<f64, SchemaError> {
        match object.get(name) {
            None | Some(Value::Null) => Err(SchemaError::MissingField(name.to_string())),
            Some(Value::Number(n)) => n
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| SchemaError::NonFinite(name.to_string())),
            Some(other) => Err(SchemaError::NotNumeric {
                field: name.to_string(),
                found: json_kind(other),
            }),
        }
    }

    pub(super) fn descriptive_fields(
        object: &Map<String, Value>,
    ) -> Result<Demographics, SchemaError> {
        let mut demographics = Demographics::default();
        for name in DESCRIPTIVE_FIELDS {
            let text = match object.get(name) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => {
                    return Err(SchemaError::NotText {
                        field: name.to_string(),
                        found: json_kind(other),
                    });
                }
            };
            if let Some(slot) = demographics.slot_mut(name) {
                *slot = text;
            }
        }
        Ok(demographics)
    }
}
