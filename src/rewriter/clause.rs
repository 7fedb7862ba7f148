//! Per-clause matching primitives for the Rewriter (C3).
//!
//! Each `rewrite_*` function answers the same question for one clause: can
//! `target`'s version of this clause be satisfied by substituting the
//! cached `origin` materialization for its `FROM` table? If so, it returns
//! the clause rewritten against the temp table's alias; if not, `condition`
//! is `false` and the caller must fall back to the unmodified target.
//!
//! "Powerset" clauses (`where`, `having`, `join`) use subsequence matching:
//! `target`'s list of predicates must contain `origin`'s list as a subset,
//! in order; anything extra is kept and rewritten, anything missing fails
//! the match.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::sql::{ClauseTree, JoinClause, JoinKind, SelectItem};

/// Outcome of rewriting one clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseRewrite<T> {
    pub condition: bool,
    pub value: T,
}

impl<T: Default> ClauseRewrite<T> {
    fn fail() -> Self {
        Self {
            condition: false,
            value: T::default(),
        }
    }
}

// `extract` (C1) renders conditions back to SQL text with `sqlparser`'s
// `Expr::to_string()`, which never quotes a plain identifier — so these
// patterns match bare `table.column`/`schema.table.column` references, not
// quoted ones. Anchored to start with a letter/underscore so a numeric
// literal like `5.0` is never mistaken for a qualified column reference.
static SCHEMA_TABLE_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<schema>[A-Za-z_]\w*)\.(?P<table>[A-Za-z_]\w*)\.(?P<column>[A-Za-z_]\w*)").unwrap()
});
static TABLE_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<table>[A-Za-z_]\w*)\.(?P<column>[A-Za-z_]\w*)").unwrap()
});

/// Table/column references a condition string makes, used to verify it
/// only touches the origin's `FROM` table and its selected columns.
pub struct Reference {
    pub tables: Vec<String>,
    pub columns: Vec<String>,
}

/// Extract table and column references from a condition like
/// `t1.col1 = t2.col2`, tracking which columns are qualified by
/// `from_alias` specifically.
pub fn match_table_and_column(cond: &str, from_alias: &str) -> Reference {
    let from_pattern = format!(r"\b{}\.([A-Za-z_]\w*)\b", regex::escape(from_alias));
    let from_re = Regex::new(&from_pattern).unwrap();
    let columns: Vec<String> = from_re
        .captures_iter(cond)
        .map(|c| c[1].to_string())
        .collect();

    let mut tables = Vec::new();
    let mut remaining = cond.to_string();
    for caps in SCHEMA_TABLE_COLUMN.captures_iter(cond) {
        let schema_table = format!("{}.{}", &caps["schema"], &caps["table"]);
        tables.push(schema_table.clone());
        let full = format!("{}.{}", schema_table, &caps["column"]);
        remaining = remaining.replace(&full, "");
    }
    for caps in TABLE_COLUMN.captures_iter(&remaining) {
        tables.push(caps["table"].to_string());
    }

    Reference { tables, columns }
}

fn rewrite_qualifier(text: &str, old_alias: &str, new_alias: &str) -> String {
    let pattern = format!(r"(?<!\.){}\.", regex::escape(old_alias));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, format!("{new_alias}.")).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// `FROM` clause match: origin and target must reference the identical
/// table+alias. Value is the temp-table name that stands in for it.
pub fn rewrite_from(
    origin: &ClauseTree,
    target: &ClauseTree,
    temp_table_name: &str,
) -> ClauseRewrite<Option<String>> {
    if origin.from == target.from {
        ClauseRewrite {
            condition: true,
            value: Some(temp_table_name.to_string()),
        }
    } else {
        ClauseRewrite::fail()
    }
}

/// `DISTINCT` clause match: both queries must agree.
pub fn rewrite_distinct(origin: &ClauseTree, target: &ClauseTree) -> ClauseRewrite<bool> {
    ClauseRewrite {
        condition: origin.distinct == target.distinct,
        value: target.distinct,
    }
}

/// `LIMIT` clause match. The origin (a cached materialization) must never
/// carry a `LIMIT` of its own; the target's limit, if any, must be a bare
/// integer.
pub fn rewrite_limit(
    origin: &ClauseTree,
    target: &ClauseTree,
) -> ClauseRewrite<Option<String>> {
    debug_assert!(
        origin.limit.is_none(),
        "cached materializations must not carry a LIMIT"
    );
    match &target.limit {
        Some(limit) if limit.chars().all(|c| c.is_ascii_digit()) => ClauseRewrite {
            condition: true,
            value: Some(limit.clone()),
        },
        Some(_) => ClauseRewrite::fail(),
        None => ClauseRewrite {
            condition: true,
            value: None,
        },
    }
}

/// `WHERE`/`HAVING` clause match. `target`'s condition list must contain
/// `origin`'s as an ordered subsequence (the *powerset* property); anything
/// extra is validated to reference only the origin's `FROM` alias and its
/// selected columns, then rewritten onto `new_alias`.
pub fn rewrite_where_or_having(
    origin_conditions: &[String],
    target_conditions: &[String],
    origin_from_alias: &str,
    origin_select: &[SelectItem],
    new_alias: &str,
) -> ClauseRewrite<Vec<String>> {
    let mut origin_ptr = 0usize;
    let mut condition = true;
    let mut value = Vec::new();
    let select_aliases: Vec<&str> = origin_select.iter().map(|s| s.alias.as_str()).collect();

    for target_cond in target_conditions {
        let matches_next_origin =
            origin_ptr < origin_conditions.len() && *target_cond == origin_conditions[origin_ptr];

        if matches_next_origin {
            origin_ptr += 1;
            continue;
        }

        let refs = match_table_and_column(target_cond, origin_from_alias);
        if refs.tables.iter().any(|t| t != origin_from_alias) {
            condition = false;
            break;
        }
        if refs.columns.iter().any(|c| !select_aliases.contains(&c.as_str())) {
            condition = false;
            break;
        }
        if contains_aggregate_call(target_cond) {
            condition = false;
            break;
        }

        value.push(rewrite_qualifier(target_cond, origin_from_alias, new_alias));
    }

    if origin_ptr != origin_conditions.len() {
        condition = false;
    }

    if condition {
        ClauseRewrite { condition, value }
    } else {
        ClauseRewrite::fail()
    }
}

static AGG_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(count|max|min|sum|avg)\s*\(").unwrap());

fn contains_aggregate_call(text: &str) -> bool {
    AGG_CALL.is_match(text)
}

/// `JOIN` clause match, simplified: `origin`'s joined tables (in order)
/// must appear as a contiguous prefix-aligned subsequence of `target`'s —
/// every origin join must be matched by a target join on the same table
/// with an identical condition list; any *extra* target joins interspersed
/// before the last matched origin join are rejected (mixing a new join in
/// the middle of the cached shape isn't safely reorderable), but extra
/// joins after the last origin join are kept and rewritten onto the new
/// alias, and cross joins are passed through unexamined.
pub fn rewrite_join(
    origin: &ClauseTree,
    target: &ClauseTree,
    origin_from_alias: &str,
    new_alias: &str,
) -> ClauseRewrite<Vec<JoinClause>> {
    let mut origin_ptr = 0usize;
    let mut result = Vec::new();
    let mut condition = true;
    let mut extras_started = false;

    for t_join in &target.join {
        let matches_next =
            origin_ptr < origin.join.len() && joins_equal(t_join, &origin.join[origin_ptr]);

        if matches_next {
            if extras_started {
                condition = false;
                break;
            }
            origin_ptr += 1;
            continue;
        }

        extras_started = true;

        if t_join.join_type == JoinKind::Cross {
            result.push(t_join.clone());
            continue;
        }
        if t_join.join_type != JoinKind::Inner {
            condition = false;
            break;
        }

        let mut rewritten = t_join.clone();
        for cond in rewritten.condition.iter_mut() {
            let refs = match_table_and_column(cond, origin_from_alias);
            if refs
                .tables
                .iter()
                .any(|tbl| tbl != origin_from_alias && tbl != t_join.table.effective_alias())
            {
                condition = false;
                break;
            }
            *cond = rewrite_qualifier(cond, origin_from_alias, new_alias);
        }
        result.push(rewritten);
    }

    if origin_ptr != origin.join.len() {
        condition = false;
    }

    if condition {
        ClauseRewrite {
            condition: true,
            value: result,
        }
    } else {
        ClauseRewrite::fail()
    }
}

fn joins_equal(a: &JoinClause, b: &JoinClause) -> bool {
    a.table == b.table && a.join_type == b.join_type && a.condition == b.condition
}

/// `SELECT` clause match: every target select item must already be
/// selected (by value, not alias) in `origin`. The rewritten projection
/// reads the aliased column off the temp table, or re-applies the
/// aggregate function over it when `target` groups (the temp table stores
/// pre-aggregation rows in that case is never true here — see design
/// notes: aggregates are only re-wrapped when a GROUP BY survived the
/// rewrite, since the cached rows are already the ungrouped base rows).
pub fn rewrite_select(
    origin: &ClauseTree,
    target: &ClauseTree,
    new_alias: &str,
    group_survived: bool,
    agg_func: Option<&[Option<String>]>,
) -> ClauseRewrite<Vec<SelectItem>> {
    let select_condition = target
        .select
        .iter()
        .all(|item| origin.select.contains(item));

    if !select_condition {
        return ClauseRewrite::fail();
    }

    let mut select = Vec::with_capacity(target.select.len());
    for (i, item) in target.select.iter().enumerate() {
        let func = agg_func.and_then(|f| f.get(i)).and_then(|f| f.as_ref());
        let expr = match func {
            Some(f) if group_survived => {
                crate::sql::Expr::Raw(format!("{f}({new_alias}.{})", item.alias))
            }
            _ => crate::sql::Expr::Raw(format!("{new_alias}.{}", item.alias)),
        };
        select.push(SelectItem {
            alias: item.alias.clone(),
            expr,
        });
    }

    ClauseRewrite {
        condition: true,
        value: select,
    }
}

/// `ORDER BY` clause match. The origin (cached materialization) must not
/// itself carry an `ORDER BY`; each target ordering expression must
/// reference a column the origin selected (by full name or by alias).
pub fn rewrite_order(
    origin: &ClauseTree,
    target: &ClauseTree,
    new_alias: &str,
) -> ClauseRewrite<Vec<String>> {
    if !origin.order_by.is_empty() {
        return ClauseRewrite::fail();
    }

    let mut order = Vec::new();
    for item in &target.order_by {
        let mut found = false;
        for select_item in &origin.select {
            let full_name = select_item.expr.to_sql();
            if item.starts_with(&full_name) {
                let suffix = &item[full_name.len()..];
                order.push(format!("{new_alias}.{}{suffix}", select_item.alias));
                found = true;
                break;
            }
            if item.starts_with(&select_item.alias) {
                let suffix = &item[select_item.alias.len()..];
                order.push(format!("{}{suffix}", select_item.alias));
                found = true;
                break;
            }
        }
        if !found {
            return ClauseRewrite::fail();
        }
    }

    ClauseRewrite {
        condition: true,
        value: order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::extract;

    #[test]
    fn from_matches_identical_table_and_alias() {
        let origin = extract("SELECT a.x FROM t AS a").unwrap();
        let target = extract("SELECT a.x FROM t AS a WHERE a.y > 1").unwrap();
        let result = rewrite_from(&origin, &target, "\"TMP_1\"");
        assert!(result.condition);
        assert_eq!(result.value.as_deref(), Some("\"TMP_1\""));
    }

    #[test]
    fn from_rejects_different_table() {
        let origin = extract("SELECT a.x FROM t AS a").unwrap();
        let target = extract("SELECT a.x FROM u AS a").unwrap();
        assert!(!rewrite_from(&origin, &target, "\"TMP_1\"").condition);
    }

    #[test]
    fn where_powerset_allows_extra_conjunct_over_selected_column() {
        // `y` must already be in origin's select list (as it would be after
        // powerset enrichment widened the materialization) for the extra
        // conjunct to be allowed.
        let origin = extract("SELECT a.x, a.y FROM t AS a WHERE a.x > 0").unwrap();
        let target =
            extract("SELECT a.x FROM t AS a WHERE a.x > 0 AND a.y < 5").unwrap();
        let result = rewrite_where_or_having(
            &origin.where_conditions,
            &target.where_conditions,
            "a",
            &origin.select,
            "\"TMP_1\"",
        );
        assert!(result.condition);
        assert_eq!(result.value.len(), 1);
    }

    #[test]
    fn where_rejects_extra_conjunct_over_unselected_column() {
        let origin = extract("SELECT a.x FROM t AS a WHERE a.x > 0").unwrap();
        let target =
            extract("SELECT a.x FROM t AS a WHERE a.x > 0 AND a.y < 5").unwrap();
        let result = rewrite_where_or_having(
            &origin.where_conditions,
            &target.where_conditions,
            "a",
            &origin.select,
            "\"TMP_1\"",
        );
        assert!(!result.condition);
    }

    #[test]
    fn where_rejects_missing_origin_condition() {
        let origin = extract("SELECT a.x FROM t AS a WHERE a.x > 0 AND a.z = 1").unwrap();
        let target = extract("SELECT a.x FROM t AS a WHERE a.x > 0").unwrap();
        let result = rewrite_where_or_having(
            &origin.where_conditions,
            &target.where_conditions,
            "a",
            &origin.select,
            "\"TMP_1\"",
        );
        assert!(!result.condition);
    }

    #[test]
    fn distinct_requires_agreement() {
        let origin = extract("SELECT DISTINCT a.x FROM t AS a").unwrap();
        let target = extract("SELECT a.x FROM t AS a").unwrap();
        assert!(!rewrite_distinct(&origin, &target).condition);
    }

    #[test]
    fn limit_accepts_bare_integer() {
        let origin = extract("SELECT a.x FROM t AS a").unwrap();
        let target = extract("SELECT a.x FROM t AS a LIMIT 25").unwrap();
        let result = rewrite_limit(&origin, &target);
        assert!(result.condition);
        assert_eq!(result.value.as_deref(), Some("25"));
    }

    #[test]
    fn select_rejects_unknown_column() {
        let origin = extract("SELECT a.x FROM t AS a").unwrap();
        let target = extract("SELECT a.x, a.z FROM t AS a").unwrap();
        let result = rewrite_select(&origin, &target, "\"TMP_1\"", false, None);
        assert!(!result.condition);
    }

    #[test]
    fn select_accepts_subset() {
        let origin = extract("SELECT a.x, a.y FROM t AS a").unwrap();
        let target = extract("SELECT a.x FROM t AS a").unwrap();
        let result = rewrite_select(&origin, &target, "\"TMP_1\"", false, None);
        assert!(result.condition);
        assert_eq!(result.value.len(), 1);
    }
}
