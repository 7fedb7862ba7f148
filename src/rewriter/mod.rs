//! Rewriter (C3).
//!
//! Given a cached `origin` materialization (a `CREATE TEMPORARY TABLE ...
//! AS <select>` script already in the pool) and a `target` query, attempts
//! a clause-by-clause substitution of the temp table for the matching
//! fragment of `target`. [`rewrite`] is the entry point the orchestrator
//! calls with the pool's MRU candidate list; [`get_powerset`] widens a
//! main-query projection ahead of caching so future, not-yet-typed queries
//! have a better chance of matching; [`resolve_alias_conflict`] uniquifies
//! duplicate `SELECT` aliases before any of the above runs.

pub mod clause;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::formatter;
use crate::pool::TempTablePool;
use crate::sql::{self, ClauseTree, Expr, SelectItem};
use clause::ClauseRewrite;

static AGG_FUNC_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^(count|max|min|sum)\s*\(\s*("?[\w]+"?\.)?"?[\w]+"?\."?[\w]+"?\s*\)$"#)
        .unwrap()
});
static BARE_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^("?[\w]+"?\.)?"?[\w]+"?\."?[\w]+"?$"#).unwrap());

/// Detect a per-column aggregate function (`COUNT`/`MAX`/`MIN`/`SUM`) over a
/// single qualified column, for each select item in turn. `None` in the
/// returned vec means "that item is a plain column, not an aggregate call";
/// the whole function returns `None` if any item is neither shape (e.g. a
/// nested aggregate or arbitrary expression) — the rewrite is then not
/// attempted for group-by queries.
pub fn get_agg_func(tree: &ClauseTree) -> Option<Vec<Option<String>>> {
    let mut out = Vec::with_capacity(tree.select.len());
    for item in &tree.select {
        let text = item.expr.to_sql();
        if AGG_FUNC_CALL.is_match(&text) {
            let name = text.split('(').next().unwrap_or_default().trim().to_lowercase();
            out.push(Some(name));
        } else if BARE_COLUMN.is_match(&text) {
            out.push(None);
        } else {
            return None;
        }
    }
    Some(out)
}

fn rewrite_group(
    origin: &ClauseTree,
    target: &ClauseTree,
    where_value: &[String],
    join_conditions: &[String],
    new_alias: &str,
) -> ClauseRewrite<Vec<String>> {
    let has_no_filter = where_value.is_empty() && join_conditions.is_empty();
    let group_match = origin.group_by == target.group_by;
    let target_has_no_group = target.group_by.is_empty();

    let (mut condition, mut group) = if (has_no_filter && group_match)
        || (target_has_no_group && (has_no_filter != group_match))
    {
        (true, Vec::new())
    } else if !has_no_filter && !group_match && target_has_no_group {
        (false, Vec::new())
    } else {
        let mut condition = true;
        let group = target.group_by.clone();

        if get_agg_func(target).is_none() {
            condition = false;
        }

        let select_string = target
            .select
            .iter()
            .map(|s| format!("{new_alias}.{} AS {}", s.alias, s.alias))
            .collect::<Vec<_>>()
            .join(", ");
        let combine = format!(
            "{select_string} {} {}",
            where_value.join(" "),
            join_conditions.join(" ")
        );

        for item in &target.group_by {
            if !combine.contains(&format!(" {item} ")) {
                condition = false;
            }
            if !origin.group_by.contains(item) {
                condition = false;
            }
        }

        let mut all_conditions: Vec<String> = where_value.to_vec();
        all_conditions.extend(join_conditions.iter().cloned());
        for cond in &all_conditions {
            let valid = group.iter().any(|g| {
                is_equality_with(cond, g) || is_in_list_with(cond, g)
            });
            if !valid && !group.is_empty() {
                condition = false;
            }
        }

        (condition, group)
    };

    if !condition {
        return ClauseRewrite {
            condition: false,
            value: Vec::new(),
        };
    }

    for item in group.iter_mut() {
        let refs = clause::match_table_and_column(item, origin.from.effective_alias());
        if refs.tables.iter().any(|t| t != origin.from.effective_alias()) {
            condition = false;
            break;
        }
        let found = origin
            .select
            .iter()
            .find(|s| s.expr.to_sql() == *item || format!("{}.{}", origin.from.effective_alias(), s.alias) == *item);
        if let Some(select_item) = found {
            *item = format!("{new_alias}.{}", select_item.alias);
        } else {
            *item = item.replace(&format!("{}.", origin.from.effective_alias()), &format!("{new_alias}."));
        }
    }

    if condition {
        ClauseRewrite {
            condition: true,
            value: group,
        }
    } else {
        ClauseRewrite {
            condition: false,
            value: Vec::new(),
        }
    }
}

fn is_equality_with(cond: &str, group_item: &str) -> bool {
    let lhs = format!(r"^{}\s*=\s*.+$", regex::escape(group_item));
    let rhs = format!(r"^.+\s*=\s*{}$", regex::escape(group_item));
    Regex::new(&lhs).map(|r| r.is_match(cond)).unwrap_or(false)
        || Regex::new(&rhs).map(|r| r.is_match(cond)).unwrap_or(false)
}

fn is_in_list_with(cond: &str, group_item: &str) -> bool {
    let pattern = format!(r"(?i)^{}\s*IN\s*\(.*\)$", regex::escape(group_item));
    Regex::new(&pattern).map(|r| r.is_match(cond)).unwrap_or(false)
}

/// Try to rewrite `target_sql` against one cached `origin_sql`, whose
/// materialization lives under `temp_table_name`. Returns `None` if any
/// clause fails to match, mirroring `rewrite_clause`'s early return of the
/// unmodified target.
pub fn rewrite_clause(
    origin_sql: &str,
    target_sql: &str,
    temp_table_name: &str,
    cursor_identifier: &str,
) -> Option<String> {
    let origin = sql::extract(origin_sql).ok()?;
    let target = sql::extract(target_sql).ok()?;

    let distinct = clause::rewrite_distinct(&origin, &target);
    if !distinct.condition {
        return None;
    }

    let from = clause::rewrite_from(&origin, &target, temp_table_name);
    if !from.condition {
        return None;
    }
    let new_alias = from.value?;

    let join = clause::rewrite_join(&origin, &target, origin.from.effective_alias(), &new_alias);
    if !join.condition {
        return None;
    }

    let where_rw = clause::rewrite_where_or_having(
        &origin.where_conditions,
        &target.where_conditions,
        origin.from.effective_alias(),
        &origin.select,
        &new_alias,
    );
    if !where_rw.condition {
        return None;
    }

    let join_conditions: Vec<String> = join
        .value
        .iter()
        .flat_map(|j| j.condition.iter().cloned())
        .collect();
    let group = rewrite_group(&origin, &target, &where_rw.value, &join_conditions, &new_alias);
    if !group.condition {
        return None;
    }

    let agg_func = get_agg_func(&target);
    let select = clause::rewrite_select(
        &origin,
        &target,
        &new_alias,
        !group.value.is_empty(),
        agg_func.as_deref(),
    );
    if !select.condition {
        return None;
    }

    let having = clause::rewrite_where_or_having(
        &origin.having,
        &target.having,
        origin.from.effective_alias(),
        &origin.select,
        &new_alias,
    );
    if !having.condition {
        return None;
    }

    let order = clause::rewrite_order(&origin, &target, &new_alias);
    if !order.condition {
        return None;
    }

    let limit = clause::rewrite_limit(&origin, &target);
    if !limit.condition {
        return None;
    }

    let rewritten = ClauseTree {
        select: select.value,
        from: sql::TableRef {
            name: new_alias.clone(),
            alias: Some(new_alias.clone()),
        },
        join: join.value,
        where_conditions: where_rw.value,
        group_by: group.value,
        having: having.value,
        order_by: order.value,
        limit: limit.value,
        distinct: distinct.value,
    };

    formatter::format_clause(&rewritten, cursor_identifier).ok()
}

/// Try every candidate in `candidates` (MRU order) against `target_sql`,
/// returning the first successful rewrite, or `target_sql` canonicalized
/// but unmodified if none match. The bool reports whether the matched
/// origin's materialization was itself sampled (propagated as the
/// user-visible "approximate result" flag).
pub fn rewrite(
    pool: &TempTablePool,
    candidates: &[String],
    target_sql: &str,
    cursor_identifier: &str,
) -> (String, bool) {
    if !formatter::support_rewrite(target_sql) {
        return (target_sql.to_string(), false);
    }

    for candidate in candidates {
        if !formatter::support_rewrite(candidate) {
            continue;
        }
        let Some(name) = pool.name_for(candidate) else {
            continue;
        };
        if let Some(rewritten) = rewrite_clause(candidate, target_sql, name, cursor_identifier) {
            if rewritten != target_sql {
                let is_sample = pool.is_sample(candidate).unwrap_or(false);
                return (rewritten, is_sample);
            }
        }
    }

    (target_sql.to_string(), false)
}

/// Widen a main-query projection ahead of caching: add base-table columns
/// that aren't already selected/grouped but were present in the Debug
/// loop's speculated cursor-region text, so a later, not-yet-typed query
/// referencing them can still hit this cache entry. Drops `ORDER BY`/
/// `LIMIT` (the materialization is a full, unordered scan).
pub fn get_powerset(
    script: &str,
    alternative_columns: &[String],
    speculated_middle: &str,
    cursor_identifier: &str,
) -> crate::error::Result<String> {
    let mut tree = sql::extract(script)?;
    tree.order_by.clear();
    tree.limit = None;

    let agg_func = get_agg_func(&tree);
    let eligible = match &agg_func {
        Some(funcs) => funcs.iter().all(|f| f.is_none()) || !tree.group_by.is_empty(),
        None => false,
    };

    let mut columns_to_add = Vec::new();
    if eligible {
        for col in alternative_columns {
            let already_selected = tree
                .select
                .iter()
                .any(|s| s.expr.to_sql().contains(col.as_str()) || s.alias.contains(col.as_str()));
            let already_grouped = tree.group_by.iter().any(|g| g.contains(col.as_str()));
            let in_middle = speculated_middle.contains(col.as_str());
            if !already_selected && !already_grouped && in_middle {
                columns_to_add.push(col.clone());
            }
        }
    }

    let alias = tree.from.effective_alias().to_string();
    for col in &columns_to_add {
        tree.select.push(SelectItem {
            alias: col.clone(),
            expr: Expr::ColumnRef {
                table_alias: Some(alias.clone()),
                column_name: col.clone(),
            },
        });
    }
    if !tree.group_by.is_empty() {
        for col in &columns_to_add {
            tree.group_by.push(format!("{alias}.{col}"));
        }
    }

    formatter::format_clause(&tree, cursor_identifier)
}

/// Uniquify duplicate `SELECT` aliases as `"{alias}_COL_{i}"` before the
/// rewriter (or the cache) ever sees the script, since the pool keys on
/// the select list's alias names.
pub fn resolve_alias_conflict(script: &str, cursor_identifier: &str) -> String {
    let Ok(tree) = sql::extract(script) else {
        return formatter::format(script, cursor_identifier);
    };

    let mut seen = std::collections::HashSet::new();
    let mut select = tree.select.clone();
    for (i, item) in select.iter_mut().enumerate() {
        if seen.contains(&item.alias) {
            item.alias = format!("{}_COL_{i}", item.alias);
        }
        seen.insert(item.alias.clone());
    }

    let mut rewritten = tree;
    rewritten.select = select;
    formatter::format_clause(&rewritten, cursor_identifier)
        .unwrap_or_else(|_| formatter::format(script, cursor_identifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{CreateMetrics, TempTablePool};

    const CURSOR: &str = "/*CURSOR_IDENTIFIER*/";

    fn pool_with_entry(script: &str) -> TempTablePool {
        let mut pool = TempTablePool::new("speql", 10, u64::MAX);
        pool.update(script, false, CreateMetrics::default());
        pool
    }

    #[test]
    fn rewrite_clause_substitutes_temp_table_for_matching_from() {
        // Y must already be in the origin's select list — as it would be
        // after powerset enrichment widened it — for the extra conjunct on
        // Y to be allowed; otherwise it references a column the cached
        // temp table never materialized.
        let origin = "SELECT A.X AS X, A.Y AS Y FROM T AS A WHERE A.X > 0";
        let target = "SELECT A.X AS X FROM T AS A WHERE A.X > 0 AND A.Y < 5";
        let result = rewrite_clause(origin, target, "\"TMP_1\"", CURSOR).unwrap();
        assert!(result.contains("TMP_1"));
    }

    #[test]
    fn rewrite_clause_rejects_conjunct_over_unmaterialized_column() {
        let origin = "SELECT A.X AS X FROM T AS A WHERE A.X > 0";
        let target = "SELECT A.X AS X FROM T AS A WHERE A.X > 0 AND A.Y < 5";
        assert!(rewrite_clause(origin, target, "\"TMP_1\"", CURSOR).is_none());
    }

    #[test]
    fn rewrite_clause_rejects_different_base_table() {
        let origin = "SELECT A.X AS X FROM T AS A";
        let target = "SELECT A.X AS X FROM U AS A";
        assert!(rewrite_clause(origin, target, "\"TMP_1\"", CURSOR).is_none());
    }

    #[test]
    fn rewrite_returns_target_unchanged_when_no_candidate_matches() {
        let pool = pool_with_entry("SELECT A.X AS X FROM U AS A");
        let (out, is_sample) = rewrite(
            &pool,
            &["SELECT A.X AS X FROM U AS A".to_string()],
            "SELECT A.X AS X FROM T AS A",
            CURSOR,
        );
        assert!(out.contains('T'));
        assert!(!is_sample);
    }

    #[test]
    fn resolve_alias_conflict_uniquifies_duplicate_aliases() {
        let out = resolve_alias_conflict("SELECT A.X AS C, A.Y AS C FROM T AS A", CURSOR);
        assert!(out.matches("AS C").count() <= 1 || out.contains("C_COL_"));
    }

    #[test]
    fn get_agg_func_detects_count_call() {
        let tree = sql::extract("SELECT COUNT(A.X) AS CNT FROM T AS A").unwrap();
        let funcs = get_agg_func(&tree).unwrap();
        assert_eq!(funcs, vec![Some("count".to_string())]);
    }

    #[test]
    fn get_agg_func_none_for_complex_expression() {
        let tree = sql::extract("SELECT A.X + 1 AS Y FROM T AS A").unwrap();
        assert!(get_agg_func(&tree).is_none());
    }
}
