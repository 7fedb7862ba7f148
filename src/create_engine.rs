//! Execute / Create Engine (C5) — the synchronous half.
//!
//! Actually running `CREATE TEMPORARY TABLE ... AS ...` against a warehouse
//! is I/O and lives behind the `WarehouseClient` trait in `speql-server`.
//! What belongs here is warehouse-independent: classifying the outcome of
//! one attempt, deciding whether the sample-retry loop continues, and the
//! append-only schema cache the Create Engine populates on every successful
//! materialization.

use std::collections::HashMap;

use crate::pool::CreateMetrics;

/// The outcome of one `CREATE TEMPORARY TABLE ... AS ...` attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The statement completed; metrics were read back from the warehouse's
    /// query-history/info views.
    Success(CreateMetrics),
    /// The warehouse returned its distinguished cancelled-by-timeout error
    /// code. Retryable with a smaller sample, up to the configured ceiling.
    TimeoutCancel,
    /// Any other warehouse-side failure. Terminal for this script.
    Other(String),
}

/// Sentinel metrics recorded for a timeout-cancel, matching the
/// `execution_time=-1` convention the rest of the system (logging, test
/// fixtures) expects to see for a cancelled attempt.
pub fn timeout_cancel_metrics(configured_timeout_ms: f64) -> CreateMetrics {
    CreateMetrics {
        elapsed_ms: configured_timeout_ms,
        execution_ms: -1.0,
        compile_ms: -1.0,
        planning_ms: -1.0,
        create_size_bytes: 0,
    }
}

/// Whether the sample-retry loop should attempt another, smaller-sampled
/// `CREATE`, and at which retry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub next_retry_k: u32,
}

/// Decide the next step after one `CREATE` attempt.
///
/// `max_iteration` is 1 when sampling is disabled or the script doesn't
/// `support_rewrite` — in that case there is never a retry, matching the
/// upstream `max_iteration = 1` short-circuit.
pub fn next_retry(outcome: &CreateOutcome, retry_k: u32, max_iteration: u32) -> RetryDecision {
    match outcome {
        CreateOutcome::Success(_) | CreateOutcome::Other(_) => RetryDecision {
            should_retry: false,
            next_retry_k: retry_k,
        },
        CreateOutcome::TimeoutCancel => {
            let next = retry_k + 1;
            RetryDecision {
                should_retry: next < max_iteration,
                next_retry_k: next,
            }
        }
    }
}

/// Append-only cache of materialized-table column schemas, keyed by the
/// table's uppercased name (warehouses normalize unquoted identifiers to
/// uppercase, so lookups must match that).
#[derive(Debug, Default, Clone)]
pub struct SchemaCache {
    tables: HashMap<String, Vec<String>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the columns of a just-created table. Overwrites any prior
    /// entry for the same name — a temp table name is only reused after the
    /// pool evicts and the counter moves on, so this is append-only in
    /// practice even though the map allows overwrite.
    pub fn record(&mut self, table_name: &str, columns: Vec<String>) {
        self.tables.insert(table_name.to_uppercase(), columns);
    }

    pub fn columns_of(&self, table_name: &str) -> Option<&[String]> {
        self.tables.get(&table_name.to_uppercase()).map(|v| v.as_slice())
    }

    pub fn forget(&mut self, table_name: &str) {
        self.tables.remove(&table_name.to_uppercase());
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_never_retries() {
        let decision = next_retry(&CreateOutcome::Success(CreateMetrics::default()), 0, 3);
        assert!(!decision.should_retry);
    }

    #[test]
    fn other_error_never_retries() {
        let decision = next_retry(&CreateOutcome::Other("boom".into()), 0, 3);
        assert!(!decision.should_retry);
    }

    #[test]
    fn timeout_cancel_retries_until_max_iteration() {
        let d0 = next_retry(&CreateOutcome::TimeoutCancel, 0, 3);
        assert!(d0.should_retry);
        assert_eq!(d0.next_retry_k, 1);

        let d1 = next_retry(&CreateOutcome::TimeoutCancel, 1, 3);
        assert!(d1.should_retry);
        assert_eq!(d1.next_retry_k, 2);

        let d2 = next_retry(&CreateOutcome::TimeoutCancel, 2, 3);
        assert!(!d2.should_retry);
    }

    #[test]
    fn max_iteration_one_never_retries() {
        let d = next_retry(&CreateOutcome::TimeoutCancel, 0, 1);
        assert!(!d.should_retry);
    }

    #[test]
    fn schema_cache_lookup_is_case_insensitive() {
        let mut cache = SchemaCache::new();
        cache.record("\"speql_temp_table_1\"", vec!["x".into(), "y".into()]);
        assert_eq!(
            cache.columns_of("\"SPEQL_TEMP_TABLE_1\""),
            Some(&["x".to_string(), "y".to_string()][..])
        );
    }
}
