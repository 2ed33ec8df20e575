pub mod between_stops;
pub mod chat;
pub mod config;
pub mod demand;
pub mod error;
pub mod feed;
pub mod gtfs_models;
pub mod mirror;
pub mod server;
pub mod service_clock;
pub mod stats;

pub use error::{InsightError, Result};
pub use feed::Feed;
