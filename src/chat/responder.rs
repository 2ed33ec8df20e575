use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::database::ReadOnlyDatabase;
use super::error::ChatError;
use super::history::{ChatHistory, Conversation};
use super::llm::LanguageModel;
use super::sql_guard::{check_allowed, extract_sql};
use crate::error::{InsightError, Result};

const SQL_PROMPT: &str = "You are an assistant that answers questions about a public transit network by \
writing SQLite queries.
Write one read-only SQL query (SELECT or WITH) against the schema below that answers the user's question. \
Use only tables and columns that exist in the schema. Use the conversation history to resolve follow-up questions.
Reply with the SQL query only, with no explanation and no formatting.

<SCHEMA>{schema}</SCHEMA>

Conversation History:
{history}

Example:
Question: which routes stop at both College Places and Skytop Office?
SQL Query:
SELECT DISTINCT r.route_short_name FROM Routes r
JOIN Trips t ON t.route_id = r.route_id
JOIN StopTimes st ON st.trip_id = t.trip_id
JOIN Stops s ON s.stop_id = st.stop_id
WHERE s.stop_name = 'College Places'
INTERSECT
SELECT DISTINCT r.route_short_name FROM Routes r
JOIN Trips t ON t.route_id = r.route_id
JOIN StopTimes st ON st.trip_id = t.trip_id
JOIN Stops s ON s.stop_id = st.stop_id
WHERE s.stop_name = 'Skytop Office';
{feedback}
Question: {question}
SQL Query:
";

const ANSWER_PROMPT: &str = "You are an assistant that answers questions about a public transit network.
A SQL query was run against the database below to answer the user's question. Explain the result in plain, \
natural language. Do not mention SQL unless the user asked about it.

<SCHEMA>{schema}</SCHEMA>

Conversation History:
{history}

SQL Query: <SQL>{sql}</SQL>
Question: {question}
SQL Response: {response}
";

/// Pipeline stage, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    GeneratingSql,
    ExecutingSql,
    GeneratingExplanation,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponderConfig {
    pub max_retries: u32,
    pub llm_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        ResponderConfig {
            max_retries: 3,
            llm_timeout: Duration::from_secs(30),
        }
    }
}

/// Answers natural-language questions by generating SQL, running it on the read-only
/// mirror and having the language model explain the rows.
pub struct QueryResponder {
    llm: Arc<dyn LanguageModel>,
    database: ReadOnlyDatabase,
    history: ChatHistory,
    config: ResponderConfig,
}

impl QueryResponder {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        database: ReadOnlyDatabase,
        history: ChatHistory,
        config: ResponderConfig,
    ) -> Self {
        QueryResponder {
            llm,
            database,
            history,
            config,
        }
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub async fn respond(&self, question: &str, user_id: &str) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(InsightError::MissingParameter("query"));
        }
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(InsightError::MissingParameter("user_id"));
        }

        let conversation = self.history.conversation(user_id);
        let mut conversation = conversation.lock().await;

        let schema = self
            .database
            .schema()
            .await
            .map_err(|e| InsightError::Internal(e.to_string()))?;

        let attempts = self.config.max_retries.max(1);
        let mut feedback: Option<String> = None;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.attempt(&schema, &conversation, question, feedback.as_deref()).await {
                Ok(answer) => {
                    conversation.record(question, &answer);
                    info!(user_id, attempt, "Chat query answered");
                    return Ok(answer);
                }
                Err(ChatError::UnsafeSql(sql)) => {
                    warn!(user_id, sql = %sql, "Rejected generated SQL");
                    return Err(InsightError::UnsafeGeneratedSql(sql));
                }
                Err(e) if e.is_retryable() => {
                    warn!(user_id, attempt, error = %e, "Chat attempt failed, retrying");
                    if let ChatError::SqlExecution { sql, message } = &e {
                        feedback = Some(format!(
                            "\nA previous attempt produced this query:\n{}\nwhich failed with: {}\nWrite a corrected query.\n",
                            sql, message
                        ));
                    }
                    last_error = e.to_string();
                }
                Err(e) => {
                    warn!(user_id, attempt, error = %e, "Chat attempt failed permanently");
                    return Err(InsightError::SqlGenerationFailure {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }

        Err(InsightError::SqlGenerationFailure {
            attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        schema: &str,
        conversation: &Conversation,
        question: &str,
        feedback: Option<&str>,
    ) -> std::result::Result<String, ChatError> {
        let history = conversation.transcript();

        debug!(stage = ?Stage::GeneratingSql, "Chat stage");
        let prompt = SQL_PROMPT
            .replace("{schema}", schema)
            .replace("{history}", &history)
            .replace("{feedback}", feedback.unwrap_or(""))
            .replace("{question}", question);
        let sql = extract_sql(&self.complete(&prompt).await?);
        check_allowed(&sql).map_err(|reason| ChatError::UnsafeSql(format!("{} ({})", sql, reason)))?;

        debug!(stage = ?Stage::ExecutingSql, sql = %sql, "Chat stage");
        let outcome = self.database.run(&sql).await?;

        debug!(stage = ?Stage::GeneratingExplanation, rows = outcome.rows.len(), "Chat stage");
        let prompt = ANSWER_PROMPT
            .replace("{schema}", schema)
            .replace("{history}", &history)
            .replace("{sql}", &sql)
            .replace("{question}", question)
            .replace("{response}", &outcome.render());
        let answer = self.complete(&prompt).await?;
        Ok(answer.trim().to_string())
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, ChatError> {
        match tokio::time::timeout(self.config.llm_timeout, self.llm.complete(prompt)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChatError::LlmTimeout(self.config.llm_timeout)),
        }
    }
}
