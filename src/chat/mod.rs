//! Natural-language questions over the SQLite mirror: a language model writes SQL, the
//! query runs read-only, and the model explains the rows.

pub mod database;
pub mod error;
pub mod history;
pub mod llm;
pub mod responder;
pub mod sql_guard;

pub use database::ReadOnlyDatabase;
pub use error::ChatError;
pub use history::{ChatHistory, HistoryConfig};
pub use llm::{GeminiClient, GeminiConfig, LanguageModel, LlmError};
pub use responder::{QueryResponder, ResponderConfig};
