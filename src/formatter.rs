//! Formatter / Dialect Patcher (C2).
//!
//! Canonicalizes raw SQL into the stable string form ([`CanonicalQuery`] in
//! the design doc) that keys every cache in the system: comments become
//! block comments, semicolons are stripped, keywords are uppercased and
//! operators spaced out, all outside of string literals. [`patch`] applies
//! warehouse-dialect fixups ahead of canonicalization. [`prepare_sql`] locates
//! the cursor sentinel in a raw editor buffer and computes its "priority"
//! (how isolated it is on its own line) plus the surrounding CTE wrapper, if
//! any, so the pipeline can decide whether to even attempt a rewrite.
//!
//! None of this module calls into a warehouse or an LLM; it is pure string
//! transformation, safe to unit-test and fuzz directly.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SpeqlError};
use crate::sql::{self, ClauseTree, JoinKind};

static DOUBLE_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bAS DOUBLE\b").unwrap());
static PRECISION_DUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bPRECISION PRECISION\b").unwrap());
static DATE_MONTH_PAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(\d{4})-(\d{1})-(\d{1,2})'").unwrap());
static DATE_DAY_PAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(\d{4})-(\d{2})-(\d{1})'").unwrap());
static FROM_WRAPPED_PAREN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"FROM\s+\(\s*"(\w+)"\s+AS\s+"(\w+)"\)"#).unwrap());

static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--(.*?)(\n|$)").unwrap());
static STRING_OR_REST: Lazy<Regex> = Lazy::new(|| Regex::new(r"('[^']*')|([^']+)").unwrap());
static OPERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(<=|>=|!=|/\*|\*/|<>|->|[=(),<>+*/])").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const UNSUPPORTED_KEYWORDS: &[&str] = &["select", "offset", "union", "intersect"];

/// Apply warehouse-dialect fixups ahead of canonicalization.
///
/// Grounded on the three fixups the original dialect patcher applies:
/// `DOUBLE` to `DOUBLE PRECISION` (and collapsing an accidental double
/// application), zero-padding single-digit month/day literals, and
/// collapsing a parenthesized single-table `FROM` that some transpilers
/// emit.
pub fn patch(sql: &str) -> String {
    let sql = DOUBLE_KEYWORD.replace_all(sql, "AS DOUBLE PRECISION");
    let sql = PRECISION_DUP.replace_all(&sql, "PRECISION");
    let sql = DATE_MONTH_PAD.replace_all(&sql, |caps: &regex::Captures| {
        format!(
            "'{}-{:02}-{:02}'",
            &caps[1],
            caps[2].parse::<u32>().unwrap_or(0),
            caps[3].parse::<u32>().unwrap_or(0)
        )
    });
    let sql = DATE_DAY_PAD.replace_all(&sql, |caps: &regex::Captures| {
        format!(
            "'{}-{}-{:02}'",
            &caps[1],
            &caps[2],
            caps[3].parse::<u32>().unwrap_or(0)
        )
    });
    let sql = FROM_WRAPPED_PAREN.replace_all(&sql, r#"FROM "$1" AS "$2""#);
    sql.into_owned()
}

/// Canonicalize a SQL string: patch, comment conversion, semicolon removal,
/// keyword uppercasing with operator spacing (string literals left
/// untouched), whitespace collapsing, and restoration of the cursor
/// sentinel if comment conversion mangled it.
pub fn format(sql: &str, cursor_identifier: &str) -> String {
    let sql = patch(sql);
    let sql = LINE_COMMENT.replace_all(&sql, "/*$1 */$2");
    let sql = sql.replace(';', "");

    let uppered = STRING_OR_REST.replace_all(&sql, |caps: &regex::Captures| {
        if let Some(lit) = caps.get(1) {
            lit.as_str().to_string()
        } else {
            let chunk = caps.get(2).unwrap().as_str();
            let spaced = OPERATOR.replace_all(chunk, " $1 ");
            spaced.to_uppercase()
        }
    });

    let collapsed = WHITESPACE_RUN.replace_all(&uppered, " ");

    let cursor_comment_form = format!(
        "/* {} */",
        &cursor_identifier[2..cursor_identifier.len() - 2]
    );
    let restored = collapsed.replace(&cursor_comment_form, cursor_identifier);

    restored.trim().to_string()
}

/// Re-render a [`ClauseTree`] back into a `SELECT` statement, then run it
/// through [`format`]. This is the Rewriter's output path: once clauses have
/// been substituted, the tree is flattened back to SQL text.
pub fn format_clause(tree: &ClauseTree, cursor_identifier: &str) -> Result<String> {
    let mut parts = vec!["SELECT".to_string()];

    if tree.distinct {
        parts.push("DISTINCT".to_string());
    }

    let select_items: Vec<String> = tree
        .select
        .iter()
        .map(|item| format!("{} AS {}", item.expr.to_sql(), item.alias))
        .collect();
    if select_items.is_empty() {
        return Err(SpeqlError::ContractViolation(
            "clause tree has empty select list".to_string(),
        ));
    }
    parts.push(select_items.join(", "));

    parts.push("FROM".to_string());
    parts.push(format!(
        "{} AS {}",
        tree.from.name,
        tree.from.effective_alias()
    ));

    for join in &tree.join {
        if join.join_type == JoinKind::Cross {
            parts.push(format!(
                "CROSS JOIN {} AS {}",
                join.table.name,
                join.table.effective_alias()
            ));
        } else {
            let kw = match join.join_type {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
                JoinKind::Right => "RIGHT JOIN",
                JoinKind::Full => "FULL JOIN",
                JoinKind::Cross => unreachable!(),
            };
            parts.push(format!(
                "{} {} AS {} ON {}",
                kw,
                join.table.name,
                join.table.effective_alias(),
                join.condition.join(" AND ")
            ));
        }
    }

    if !tree.where_conditions.is_empty() {
        parts.push("WHERE".to_string());
        parts.push(tree.where_conditions.join(" AND "));
    }
    if !tree.group_by.is_empty() {
        parts.push("GROUP BY".to_string());
        parts.push(tree.group_by.join(", "));
    }
    if !tree.having.is_empty() {
        parts.push("HAVING".to_string());
        parts.push(tree.having.join(" AND "));
    }
    if !tree.order_by.is_empty() {
        parts.push("ORDER BY".to_string());
        parts.push(tree.order_by.join(", "));
    }
    if let Some(limit) = &tree.limit {
        parts.push("LIMIT".to_string());
        parts.push(limit.clone());
    }

    Ok(format(&parts.join(" "), cursor_identifier))
}

/// The result of locating the cursor sentinel in a raw editor buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareResult {
    /// The query text with the sentinel in place, sans CTE wrapper.
    pub sql: String,
    /// Text preceding a detected single CTE wrapper (empty if none).
    pub prefix: String,
    /// Text following a detected single CTE wrapper (empty if none).
    pub suffix: String,
    /// How "isolated" the cursor is: 0 means inline with other tokens (the
    /// caller should not run Debug/Create at all), 1+ means it sits on its
    /// own line, and higher counts come from e.g. blank lines around it,
    /// feeding `llm`/`db` job priority.
    pub priority: i32,
    pub space_before: String,
    pub space_after: String,
}

fn trailing_newline_run(s: &str) -> i32 {
    let trimmed_end = s.trim_end_matches([' ', '\t']);
    let trailing_ws = &s[trimmed_end.len()..];
    trailing_ws.matches('\n').count() as i32
}

fn leading_newline_run(s: &str) -> i32 {
    let trimmed_start = s.trim_start_matches([' ', '\t']);
    let leading_ws = &s[..s.len() - trimmed_start.len()];
    leading_ws.matches('\n').count() as i32
}

static CTE_WRAPPER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*((--.*(?:\n|$))|(/\*.*?\*/\s*))*with\s+((--.*(?:\n|$))|(/\*.*?\*/\s*))*"?[\w]+"?\s+as\s*\(\s*(select.*?\))\s*$"#,
    )
    .unwrap()
});

/// Locate the cursor sentinel in `sql`, compute its priority, and detect a
/// wrapping single-CTE shell (the user is editing the first/only CTE).
/// Returns `None` when the cursor is missing, the buffer is empty besides
/// the sentinel, or the cursor sits inline (priority 0 after minimum-1
/// clamping never triggers `None` on its own — see below).
pub fn prepare_sql(sql: &str, cursor_identifier: &str) -> Option<PrepareResult> {
    let cursor_position = sql.find(cursor_identifier)?;

    let before = &sql[..cursor_position];
    let after = &sql[cursor_position + cursor_identifier.len()..];

    let mut priority = trailing_newline_run(before) + leading_newline_run(after);
    if priority < 3 {
        priority = 1;
    }

    let before_trimmed_end = before.trim_end();
    let mut space_before = before[before_trimmed_end.len()..].to_string();
    if !space_before.is_empty() {
        space_before = space_before[1..].to_string();
    }

    let after_trimmed_start = after.trim_start();
    let mut space_after = after[..after.len() - after_trimmed_start.len()].to_string();
    if !space_after.is_empty() {
        space_after.pop();
    }

    let start = cursor_position - space_before.len();
    let end = cursor_position + cursor_identifier.len() + space_after.len();
    let normalized = format!("{}{}{}", &sql[..start], cursor_identifier, &sql[end..]);

    if normalized.trim() == cursor_identifier.trim() {
        return None;
    }

    let (prefix, raw_sql, suffix) = match CTE_WRAPPER.captures(&normalized) {
        Some(caps) => {
            let m = caps.get(7).unwrap();
            (
                normalized[..m.start()].to_string(),
                normalized[m.start()..m.end()].to_string(),
                normalized[m.end()..].to_string(),
            )
        }
        None => (String::new(), normalized.clone(), String::new()),
    };

    Some(PrepareResult {
        sql: raw_sql,
        prefix,
        suffix,
        priority,
        space_before,
        space_after,
    })
}

/// Strip the cursor sentinel from a finished modification and drop a
/// trailing semicolon, matching the client-facing text the HTTP edge emits.
pub fn format_modification(modification: &str, cursor_identifier: &str) -> String {
    let stripped = modification.replace(cursor_identifier, "");
    let trimmed = stripped.trim_end();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed);
    trimmed.trim_end().to_string()
}

/// Whether `script` is a shape the Rewriter/Create Engine can reason about:
/// a single `SELECT` (no nested `SELECT`/`UNION`/`INTERSECT`/`OFFSET` past
/// the initial keyword) that the Clause Extractor can successfully parse.
pub fn support_rewrite(script: &str) -> bool {
    let lower = script.to_lowercase();
    let Some(select_pos) = lower.find("select") else {
        return false;
    };
    let tail = &lower[select_pos + "select ".len()..];
    for kw in UNSUPPORTED_KEYWORDS {
        if word_boundary_contains(tail, kw) {
            return false;
        }
    }
    sql::extract(script).is_ok()
}

fn word_boundary_contains(haystack: &str, needle: &str) -> bool {
    let pattern = format!(r"\b{}\b", regex::escape(needle));
    Regex::new(&pattern).map(|re| re.is_match(haystack)).unwrap_or(false)
}
