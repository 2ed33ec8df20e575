//! Trip-demand forecasting: feature table construction from the feed, categorical
//! encoders, a gradient-boosted regressor, and the versioned artifact bundle that ties
//! them together.

pub mod boosting;
pub mod encoders;
pub mod features;
pub mod model;

pub use features::{DemandFeatures, FeatureRow, PredictionRequest, build_feature_table};
pub use model::{DemandBundle, ModelStore, TrainingOptions, TrainingReport, train};
