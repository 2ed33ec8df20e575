// Read-only access to the SQLite mirror for generated queries.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::ChatError;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// More rows were available than the row limit allowed.
    pub truncated: bool,
}

impl QueryOutcome {
    /// Compact text rendering for prompts: one tuple per row.
    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return "[]".to_string();
        }
        let rows: Vec<String> = self
            .rows
            .iter()
            .map(|row| {
                let cells: Vec<String> = row.iter().map(Value::to_string).collect();
                format!("({})", cells.join(", "))
            })
            .collect();
        let mut text = format!("[{}]", rows.join(", "));
        if self.truncated {
            text.push_str(&format!(" (first {} rows)", self.rows.len()));
        }
        text
    }
}

#[derive(Debug, Clone)]
pub struct ReadOnlyDatabase {
    path: PathBuf,
    timeout: Duration,
    row_limit: usize,
}

impl ReadOnlyDatabase {
    pub const DEFAULT_ROW_LIMIT: usize = 200;

    pub fn new(path: impl Into<PathBuf>, timeout: Duration, row_limit: usize) -> Self {
        ReadOnlyDatabase {
            path: path.into(),
            timeout,
            row_limit: row_limit.max(1),
        }
    }

    fn connect(&self) -> Result<Connection, ChatError> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ChatError::Database(format!("{}: {}", self.path.display(), e)))
    }

    /// `CREATE` statements of every table in the mirror.
    pub async fn schema(&self) -> Result<String, ChatError> {
        let conn = self.connect()?;
        self.bounded(conn, "Schema read interrupted", |conn| {
            let read = || -> rusqlite::Result<Vec<String>> {
                let mut stmt = conn.prepare(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND sql IS NOT NULL ORDER BY name",
                )?;
                let statements = stmt.query_map([], |row| row.get::<_, String>(0))?;
                statements.collect()
            };
            read()
                .map(|statements| statements.join(";\n\n"))
                .map_err(|e| ChatError::Database(e.to_string()))
        })
        .await
    }

    /// Runs one statement, interrupting it when it outlives the timeout.
    pub async fn run(&self, sql: &str) -> Result<QueryOutcome, ChatError> {
        let conn = self.connect()?;
        let owned = sql.to_string();
        let row_limit = self.row_limit;
        self.bounded(conn, "Generated query interrupted", move |conn| {
            execute(conn, &owned, row_limit)
        })
        .await
    }

    /// Runs `work` on the blocking pool and interrupts the connection past the timeout.
    async fn bounded<T, F>(&self, conn: Connection, interrupted: &'static str, work: F) -> Result<T, ChatError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ChatError> + Send + 'static,
    {
        let interrupt = conn.get_interrupt_handle();
        let task = tokio::task::spawn_blocking(move || work(&conn));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.map_err(|e| ChatError::Database(e.to_string()))?,
            Err(_) => {
                interrupt.interrupt();
                warn!(timeout = ?self.timeout, "{}", interrupted);
                Err(ChatError::SqlTimeout(self.timeout))
            }
        }
    }
}

fn execute(conn: &Connection, sql: &str, row_limit: usize) -> Result<QueryOutcome, ChatError> {
    let failed = |e: rusqlite::Error| ChatError::SqlExecution {
        sql: sql.to_string(),
        message: e.to_string(),
    };

    let mut stmt = conn.prepare(sql).map_err(failed)?;
    if !stmt.readonly() {
        return Err(ChatError::UnsafeSql(sql.to_string()));
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(failed)?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(failed)? {
        if out.len() == row_limit {
            truncated = true;
            break;
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(to_json(row.get_ref(i).map_err(failed)?));
        }
        out.push(cells);
    }

    debug!(rows = out.len(), truncated, "Generated query executed");
    Ok(QueryOutcome {
        columns,
        rows: out,
        truncated,
    })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(format!("<{} bytes>", b.len())),
    }
}
