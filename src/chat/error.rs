use std::time::Duration;
use thiserror::Error;

use super::llm::LlmError;

/// Failures inside one attempt of the question-to-answer pipeline.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("language model timed out after {0:?}")]
    LlmTimeout(Duration),

    #[error("SQL execution failed: {message}")]
    SqlExecution { sql: String, message: String },

    #[error("SQL execution exceeded {0:?} and was interrupted")]
    SqlTimeout(Duration),

    #[error("generated SQL is not a read-only query: {0}")]
    UnsafeSql(String),

    #[error("database unavailable: {0}")]
    Database(String),
}

impl ChatError {
    /// Whether the pipeline should start over from SQL generation.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Llm(e) => e.is_transient(),
            ChatError::LlmTimeout(_) | ChatError::SqlExecution { .. } | ChatError::SqlTimeout(_) => true,
            ChatError::UnsafeSql(_) | ChatError::Database(_) => false,
        }
    }
}
