// Error taxonomy shared by the feed loader, the analytics and the HTTP layer

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("Invalid date format. Use YYYYMMDD. ({0:?})")]
    InvalidDateFormat(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} is required")]
    MissingParameter(&'static str),

    #[error("{kind} '{id}' not found")]
    EntityNotFound { kind: &'static str, id: String },

    #[error("No routes found between the given stops")]
    NoRouteBetweenStops,

    #[error("Stop {stop_id:?} is not served by trip {trip_id:?}")]
    StopNotOnTrip { stop_id: String, trip_id: String },

    #[error("Zero-duration interval between {start_stop_id:?} and {end_stop_id:?}; speed is undefined")]
    DegenerateInterval {
        start_stop_id: String,
        end_stop_id: String,
    },

    #[error("Demand model has not been trained yet")]
    ModelNotTrained,

    #[error("Model artifacts disagree: {0}")]
    ModelArtifactMismatch(String),

    #[error("Failed to generate a correct SQL query after {attempts} attempts. Last error: {last_error}")]
    SqlGenerationFailure { attempts: u32, last_error: String },

    #[error("Generated SQL rejected: {0}")]
    UnsafeGeneratedSql(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, InsightError>;

impl InsightError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        InsightError::EntityNotFound {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ResponseError for InsightError {
    fn status_code(&self) -> StatusCode {
        match self {
            InsightError::InvalidDateFormat(_)
            | InsightError::InvalidInput(_)
            | InsightError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            InsightError::EntityNotFound { .. }
            | InsightError::NoRouteBetweenStops
            | InsightError::StopNotOnTrip { .. } => StatusCode::NOT_FOUND,
            InsightError::DegenerateInterval { .. } | InsightError::UnsafeGeneratedSql(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            InsightError::ModelNotTrained | InsightError::ModelArtifactMismatch(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        HttpResponse::build(status).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
