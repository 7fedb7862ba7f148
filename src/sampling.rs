//! Sampling Strategy (C6).
//!
//! On a warehouse timeout-cancel, the Create Engine retries with a smaller
//! random sample of the single base table driving the query, rather than
//! giving up outright. `sample_script` is pure: it does not know about
//! retry budgets or warehouse errors, only how to rewrite one `FROM`
//! reference into its sampled form for a given dialect.

use crate::formatter;
use crate::sql::{self, TableRef};

/// Warehouse dialects with a known sampled-scan rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDialect {
    Redshift,
    Snowflake,
}

impl SampleDialect {
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        match endpoint.to_lowercase().as_str() {
            "redshift" => Some(Self::Redshift),
            "snowflake" => Some(Self::Snowflake),
            _ => None,
        }
    }
}

/// Rewrite a single-table scan to a random sample at ratio `2^-retry_k`.
///
/// `retry_k == 0` is the identity rewrite (the first attempt is always run
/// unsampled). If the FROM clause does not match exactly one
/// `FROM <table> AS <alias>` occurrence, or the dialect has no known
/// sampled-scan form, returns `sql` unchanged — sampling is best-effort,
/// never a hard requirement.
pub fn sample_script(
    sql: &str,
    retry_k: u32,
    dialect: Option<SampleDialect>,
    cursor_identifier: &str,
) -> String {
    if retry_k == 0 {
        return sql.to_string();
    }

    let Ok(tree) = sql::extract(sql) else {
        return sql.to_string();
    };
    let Some(dialect) = dialect else {
        return sql.to_string();
    };

    let table_pattern = from_clause_pattern(&tree.from);
    if count_occurrences_case_insensitive(sql, &table_pattern) != 1 {
        return sql.to_string();
    }

    let ratio = 1.0f64 / 2f64.powi(retry_k as i32);
    let replacement = match dialect {
        SampleDialect::Redshift => format!(
            "FROM (SELECT * FROM {} WHERE RANDOM() < {ratio}) AS {}",
            tree.from.name,
            tree.from.effective_alias()
        ),
        SampleDialect::Snowflake => format!(
            "FROM (SELECT * FROM {} TABLESAMPLE ({} PERCENT)) AS {}",
            tree.from.name,
            (ratio * 100.0) as i64,
            tree.from.effective_alias()
        ),
    };

    let rewritten = replace_case_insensitive(sql, &table_pattern, &replacement);
    formatter::format(&rewritten, cursor_identifier)
}

fn from_clause_pattern(from: &TableRef) -> String {
    format!("FROM {} AS {}", from.name, from.effective_alias())
}

fn count_occurrences_case_insensitive(haystack: &str, needle: &str) -> usize {
    let haystack = haystack.to_lowercase();
    let needle = needle.to_lowercase();
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(&needle).count()
}

fn replace_case_insensitive(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_haystack = haystack.to_lowercase();
    let lower_needle = needle.to_lowercase();
    match lower_haystack.find(&lower_needle) {
        Some(pos) => {
            format!(
                "{}{}{}",
                &haystack[..pos],
                replacement,
                &haystack[pos + needle.len()..]
            )
        }
        None => haystack.to_string(),
    }
}
