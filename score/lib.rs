#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod features;
pub mod inference;
pub mod model;
pub mod server;

pub use features::{FEATURE_ORDER, FeatureRecord, NUM_FEATURES, SchemaError};
pub use inference::{BatchPrediction, PredictionError, PredictionResult, Predictor};
pub use model::{ModelError, ModelHandle, TrainedModel, load_handle};
