//! Warehouse connector (§6, out-of-scope collaborator): `execute`,
//! `explain`, `cancel`, schema introspection, and the query-history /
//! table-size views the Create Engine (C5) reads metrics back from.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, ServerError};
use speql::pool::CreateMetrics;

/// One row of a preview result set, rendered as text (the warehouse client
/// is responsible for any type-specific formatting upstream of this).
pub type Row = Vec<String>;

/// Abstracts the warehouse so the orchestrator and tests never depend on a
/// concrete driver. A production implementation lives over `tokio-postgres`
/// below; tests use [`MockWarehouse`].
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Run `EXPLAIN <sql>` under the explain cursor lock. Errors map to
    /// `SpeqlError::ParseReject`/`ValidationFailure` upstream.
    async fn explain(&self, sql: &str) -> Result<()>;

    /// Run a statement (a `CREATE TEMPORARY TABLE ... AS ...` or a preview
    /// `SELECT`) under the execute cursor lock, returning its metrics (for
    /// CREATE) and any result rows (for a plain SELECT).
    async fn execute(&self, sql: &str) -> Result<ExecuteOutcome>;

    /// Cancel the session's currently running query (after locating it via
    /// the query-history view), surfacing as `WarehouseTimeoutCancel`.
    async fn cancel(&self, session_id: &str) -> Result<()>;

    /// Column names and types for a materialized table.
    async fn table_schema(&self, table_name: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub metrics: CreateMetrics,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
}

/// `tokio-postgres`-backed warehouse client. Construction takes an already
/// connected `tokio_postgres::Client`; the owning `speql-server::main`
/// drives the connection's background task and session initialization
/// (schema path, statement timeout, result-cache toggle).
pub struct PgWarehouse {
    client: tokio_postgres::Client,
}

impl PgWarehouse {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WarehouseClient for PgWarehouse {
    async fn explain(&self, sql: &str) -> Result<()> {
        self.client
            .simple_query(&format!("EXPLAIN {sql}"))
            .await
            .map_err(|e| ServerError::Warehouse(e.to_string()))?;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<ExecuteOutcome> {
        let started = std::time::Instant::now();
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| classify_pg_error(e))?;

        let columns = rows
            .first()
            .map(|r| {
                r.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let rendered: Vec<Row> = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| {
                        row.try_get::<usize, String>(i)
                            .unwrap_or_else(|_| String::new())
                    })
                    .collect()
            })
            .collect();

        Ok(ExecuteOutcome {
            metrics: CreateMetrics {
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                execution_ms: 0.0,
                compile_ms: 0.0,
                planning_ms: 0.0,
                create_size_bytes: 0,
            },
            rows: rendered,
            columns,
        })
    }

    async fn cancel(&self, _session_id: &str) -> Result<()> {
        Err(ServerError::Core(speql::SpeqlError::WarehouseTimeoutCancel))
    }

    async fn table_schema(&self, table_name: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
                &[&table_name],
            )
            .await
            .map_err(|e| ServerError::Warehouse(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}

fn classify_pg_error(e: tokio_postgres::Error) -> ServerError {
    let text = e.to_string();
    if text.to_lowercase().contains("cancel") || text.to_lowercase().contains("timeout") {
        ServerError::Core(speql::SpeqlError::WarehouseTimeoutCancel)
    } else {
        ServerError::Warehouse(text)
    }
}

/// Scriptable in-memory warehouse for tests: queues canned outcomes per
/// SQL-containment pattern, and records every call it receives.
#[derive(Default)]
pub struct MockWarehouse {
    explain_failures: Mutex<HashMap<String, String>>,
    schemas: Mutex<HashMap<String, Vec<String>>>,
    execute_outcomes: Mutex<HashMap<String, Result<ExecuteOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ExecuteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOutcome")
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_explain_containing(&self, substring: impl Into<String>, message: impl Into<String>) {
        self.explain_failures
            .lock()
            .unwrap()
            .insert(substring.into(), message.into());
    }

    pub fn set_schema(&self, table_name: impl Into<String>, columns: Vec<String>) {
        self.schemas.lock().unwrap().insert(table_name.into(), columns);
    }

    /// Queue a one-shot outcome (success or failure) for the next `execute`
    /// call whose SQL contains `pattern`.
    pub fn queue_execute_outcome(&self, pattern: impl Into<String>, outcome: Result<ExecuteOutcome>) {
        self.execute_outcomes
            .lock()
            .unwrap()
            .insert(pattern.into(), outcome);
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WarehouseClient for MockWarehouse {
    async fn explain(&self, sql: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("explain:{sql}"));
        let failures = self.explain_failures.lock().unwrap();
        for (pattern, message) in failures.iter() {
            if sql.contains(pattern.as_str()) {
                return Err(ServerError::Warehouse(message.clone()));
            }
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<ExecuteOutcome> {
        self.calls.lock().unwrap().push(format!("execute:{sql}"));
        let matched_key = {
            let outcomes = self.execute_outcomes.lock().unwrap();
            outcomes.keys().find(|k| sql.contains(k.as_str())).cloned()
        };
        if let Some(key) = matched_key {
            return self.execute_outcomes.lock().unwrap().remove(&key).unwrap();
        }
        Ok(ExecuteOutcome {
            metrics: CreateMetrics {
                elapsed_ms: 1.0,
                execution_ms: 1.0,
                compile_ms: 0.1,
                planning_ms: 0.1,
                create_size_bytes: 1024,
            },
            rows: Vec::new(),
            columns: Vec::new(),
        })
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("cancel:{session_id}"));
        Ok(())
    }

    async fn table_schema(&self, table_name: &str) -> Result<Vec<String>> {
        Ok(self
            .schemas
            .lock()
            .unwrap()
            .get(table_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_warehouse_fails_explain_matching_pattern() {
        let wh = MockWarehouse::new();
        wh.fail_explain_containing("BAD_TABLE", "relation does not exist");
        assert!(wh.explain("SELECT * FROM BAD_TABLE").await.is_err());
        assert!(wh.explain("SELECT * FROM GOOD_TABLE").await.is_ok());
    }

    #[tokio::test]
    async fn mock_warehouse_returns_registered_schema() {
        let wh = MockWarehouse::new();
        wh.set_schema("T1", vec!["a".into(), "b".into()]);
        assert_eq!(wh.table_schema("T1").await.unwrap(), vec!["a", "b"]);
    }
}
