// Command line and environment configuration.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::chat::{GeminiConfig, HistoryConfig, ReadOnlyDatabase, ResponderConfig};
use crate::chat::llm::DEFAULT_GEMINI_BASE_URL;
use crate::gtfs_models::DistanceUnit;

#[derive(Parser, Debug)]
#[command(name = "gtfs_insights")]
#[command(about = "GTFS statistics, demand forecasting and transit Q&A over HTTP", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub settings: Settings,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Build the SQLite mirror used by the chat endpoint
    BuildDb {
        /// First service date to compute route statistics for (YYYYMMDD)
        #[arg(long, default_value = "20230901")]
        start_date: String,

        /// Last service date, inclusive (YYYYMMDD)
        #[arg(long, default_value = "20231231")]
        end_date: String,
    },
    /// Train the demand model and write its artifacts
    Train,
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// GTFS zip archive to load
    #[arg(long, env = "GTFS_PATH", default_value = "data/gtfs.zip", global = true)]
    pub gtfs_path: PathBuf,

    /// Unit of shape_dist_traveled in the feed: km, m, mi or ft
    #[arg(long, env = "GTFS_DIST_UNITS", default_value = "km", global = true)]
    pub dist_units: DistanceUnit,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0", global = true)]
    pub bind_addr: String,

    #[arg(long, env = "PORT", default_value_t = 5000, global = true)]
    pub port: u16,

    /// Directory holding the demand model artifacts
    #[arg(long, env = "ARTIFACT_DIR", default_value = "artifacts", global = true)]
    pub artifact_dir: PathBuf,

    /// SQLite mirror queried by the chat endpoint
    #[arg(long, env = "SQLITE_PATH", default_value = "gtfs.db", global = true)]
    pub sqlite_path: PathBuf,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, global = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = "gemini-1.5-flash", global = true)]
    pub llm_model: String,

    #[arg(long, env = "LLM_BASE_URL", default_value = DEFAULT_GEMINI_BASE_URL, global = true)]
    pub llm_base_url: String,

    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = 30, global = true)]
    pub llm_timeout_secs: u64,

    #[arg(long, env = "SQL_TIMEOUT_SECS", default_value_t = 10, global = true)]
    pub sql_timeout_secs: u64,

    #[arg(long, env = "SQL_ROW_LIMIT", default_value_t = ReadOnlyDatabase::DEFAULT_ROW_LIMIT, global = true)]
    pub sql_row_limit: usize,

    #[arg(long, env = "CHAT_MAX_RETRIES", default_value_t = 3, global = true)]
    pub chat_max_retries: u32,

    #[arg(long, env = "CHAT_HISTORY_CAPACITY", default_value_t = 1000, global = true)]
    pub chat_history_capacity: usize,

    #[arg(long, env = "CHAT_HISTORY_TTL_SECS", default_value_t = 3600, global = true)]
    pub chat_history_ttl_secs: u64,

    #[arg(long, env = "CHAT_MAX_TURNS", default_value_t = 20, global = true)]
    pub chat_max_turns: usize,
}

impl Settings {
    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone(),
            model: self.llm_model.clone(),
            base_url: self.llm_base_url.clone(),
            timeout: Duration::from_secs(self.llm_timeout_secs),
        }
    }

    pub fn history(&self) -> HistoryConfig {
        HistoryConfig {
            capacity: self.chat_history_capacity,
            ttl: Duration::from_secs(self.chat_history_ttl_secs),
            max_turns: self.chat_max_turns,
        }
    }

    pub fn responder(&self) -> ResponderConfig {
        ResponderConfig {
            max_retries: self.chat_max_retries,
            llm_timeout: Duration::from_secs(self.llm_timeout_secs),
        }
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.sql_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_db_flags() {
        let cli = Cli::try_parse_from([
            "gtfs_insights",
            "build-db",
            "--start-date",
            "20231001",
            "--end-date",
            "20231007",
            "--dist-units",
            "m",
        ])
        .unwrap();
        match cli.command {
            Some(Command::BuildDb { start_date, end_date }) => {
                assert_eq!(start_date, "20231001");
                assert_eq!(end_date, "20231007");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.settings.dist_units, DistanceUnit::Metres);
    }

    #[test]
    fn test_row_limit_defaults_to_database_limit() {
        let cli = Cli::try_parse_from(["gtfs_insights"]).unwrap();
        assert_eq!(cli.settings.sql_row_limit, ReadOnlyDatabase::DEFAULT_ROW_LIMIT);
    }

    #[test]
    fn test_unknown_distance_unit_is_rejected() {
        assert!(Cli::try_parse_from(["gtfs_insights", "--dist-units", "furlong"]).is_err());
    }
}
