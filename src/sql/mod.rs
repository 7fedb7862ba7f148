//! Clause Extractor (C1).
//!
//! Parses a canonical `SELECT` (already passed through the Formatter) into a
//! [`ClauseTree`]: clause-level records for the select list, from, joins,
//! where, group by, having, order by, limit, and distinct. This is the
//! shared representation both the Rewriter (C3) and the Powerset enrichment
//! step consume — everything downstream works on `ClauseTree`, never on the
//! raw `sqlparser` AST directly.
//!
//! Grammar parsing itself is delegated to `sqlparser`; this module only
//! walks the resulting AST into the flatter shape the rewrite algebra needs.

pub mod expr;

pub use expr::Expr;

use crate::error::{Result, SpeqlError};
use sqlparser::ast::{self, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// A table reference: `table` or `table AS alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub alias: Option<String>,
    pub name: String,
}

impl TableRef {
    /// The name queries should use to refer to this table: its alias if it
    /// has one, otherwise its bare name.
    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// One projected item in the select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectItem {
    /// The output column name (its `AS` alias, or the expression's own
    /// natural name).
    pub alias: String,
    /// The expression being projected.
    pub expr: Expr,
}

/// A join in the `FROM` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    pub table: TableRef,
    pub join_type: JoinKind,
    /// Top-level AND-conjuncts of the `ON` condition, each already rendered
    /// to SQL text (OR-conjuncts are parenthesized), matching the shape the
    /// Rewriter matches element-wise.
    pub condition: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// Clause-level decomposition of a single `SELECT` (or a `UNION`/`INTERSECT`
/// arm thereof — see [`extract`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseTree {
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub join: Vec<JoinClause>,
    pub where_conditions: Vec<String>,
    pub group_by: Vec<String>,
    pub having: Vec<String>,
    pub order_by: Vec<String>,
    pub limit: Option<String>,
    pub distinct: bool,
}

/// Parse `sql` with the generic dialect. The grammar itself is not this
/// crate's concern; only the shape `extract` needs is pulled out of the AST.
fn parse_query(sql: &str) -> Result<Box<ast::Query>> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| SpeqlError::ParseReject(e.to_string()))?;
    let stmt = statements
        .into_iter()
        .next()
        .ok_or_else(|| SpeqlError::ParseReject("empty statement list".to_string()))?;
    match stmt {
        Statement::Query(q) => Ok(q),
        other => Err(SpeqlError::ParseReject(format!(
            "not a query statement: {other}"
        ))),
    }
}

fn table_ref_from_factor(factor: &ast::TableFactor) -> Result<TableRef> {
    match factor {
        ast::TableFactor::Table { name, alias, .. } => Ok(TableRef {
            name: name.to_string(),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
        }),
        ast::TableFactor::Derived { alias, .. } => Ok(TableRef {
            name: alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_default(),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
        }),
        other => Err(SpeqlError::ParseReject(format!(
            "unsupported from-clause factor: {other}"
        ))),
    }
}

fn join_kind(op: &ast::JoinOperator) -> JoinKind {
    match op {
        ast::JoinOperator::Inner(_) => JoinKind::Inner,
        ast::JoinOperator::LeftOuter(_) => JoinKind::Left,
        ast::JoinOperator::RightOuter(_) => JoinKind::Right,
        ast::JoinOperator::FullOuter(_) => JoinKind::Full,
        ast::JoinOperator::CrossJoin => JoinKind::Cross,
        _ => JoinKind::Inner,
    }
}

fn join_constraint_condition(constraint: &ast::JoinConstraint) -> Vec<String> {
    match constraint {
        ast::JoinConstraint::On(expr) => flatten_and(expr),
        ast::JoinConstraint::Using(cols) => {
            let names: Vec<String> = cols.iter().map(|c| c.to_string()).collect();
            vec![names.join(" = ")]
        }
        _ => Vec::new(),
    }
}

/// Split a condition on top-level `AND`, matching `extract_inner`'s
/// "where"/"having"/join-`ON` behaviour: an `OR` sub-expression is kept
/// whole and parenthesized rather than split further.
fn flatten_and(expr: &ast::Expr) -> Vec<String> {
    match expr {
        ast::Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            let mut out = flatten_and(left);
            out.extend(flatten_and(right));
            out
        }
        ast::Expr::BinaryOp {
            op: ast::BinaryOperator::Or,
            ..
        } => vec![format!("({expr})")],
        other => vec![other.to_string()],
    }
}

fn select_item_alias(item: &ast::SelectItem) -> (String, Expr) {
    match item {
        ast::SelectItem::UnnamedExpr(e) => {
            let expr = Expr::from_ast(e);
            (expr.output_name(), expr)
        }
        ast::SelectItem::ExprWithAlias { expr, alias } => {
            (alias.value.clone(), Expr::from_ast(expr))
        }
        ast::SelectItem::Wildcard(_) => ("*".to_string(), Expr::Star { table_alias: None }),
        ast::SelectItem::QualifiedWildcard(name, _) => {
            let alias = name.to_string();
            (
                alias.clone(),
                Expr::Star {
                    table_alias: Some(alias),
                },
            )
        }
    }
}

/// Extract clause-level records from a single-`SELECT` query.
///
/// Rejects anything that is not a bare `SELECT` with a single `FROM`
/// relation — `UNION`/`INTERSECT` arms must be extracted one at a time by
/// the caller (mirroring `create.py`'s `traverse_scope` walk, which feeds
/// one scope at a time into `create_inner`).
pub fn extract(sql: &str) -> Result<ClauseTree> {
    let query = parse_query(sql)?;
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s.as_ref(),
        _ => {
            return Err(SpeqlError::ParseReject(
                "expected a single SELECT, not a set operation".to_string(),
            ))
        }
    };

    let select_items: Vec<SelectItem> = select
        .projection
        .iter()
        .map(|item| {
            let (alias, expr) = select_item_alias(item);
            SelectItem { alias, expr }
        })
        .collect();

    let twj = select
        .from
        .first()
        .ok_or_else(|| SpeqlError::ParseReject("missing FROM clause".to_string()))?;
    let from = table_ref_from_factor(&twj.relation)?;

    let mut join = Vec::new();
    for j in &twj.joins {
        let table = table_ref_from_factor(&j.relation)?;
        let join_type = join_kind(&j.join_operator);
        let condition = match &j.join_operator {
            ast::JoinOperator::CrossJoin => Vec::new(),
            ast::JoinOperator::Inner(c)
            | ast::JoinOperator::LeftOuter(c)
            | ast::JoinOperator::RightOuter(c)
            | ast::JoinOperator::FullOuter(c) => join_constraint_condition(c),
            _ => Vec::new(),
        };
        join.push(JoinClause {
            table,
            join_type,
            condition,
        });
    }

    let where_conditions = select
        .selection
        .as_ref()
        .map(flatten_and)
        .unwrap_or_default();

    let group_by = match &select.group_by {
        ast::GroupByExpr::Expressions(exprs, _) => exprs
            .iter()
            .enumerate()
            .map(|(i, e)| resolve_group_ref(e, i, &select_items, &from))
            .collect(),
        ast::GroupByExpr::All(_) => Vec::new(),
    };

    let having = select.having.as_ref().map(flatten_and).unwrap_or_default();

    let order_by = query
        .order_by
        .as_ref()
        .map(|ob| {
            ob.exprs
                .iter()
                .map(|oe| {
                    let mut s = oe.expr.to_string();
                    if let Some(false) = oe.asc {
                        s.push_str(" DESC");
                    }
                    s
                })
                .collect()
        })
        .unwrap_or_default();

    let limit = query.limit.as_ref().map(|e| e.to_string());
    let distinct = select.distinct.is_some();

    Ok(ClauseTree {
        select: select_items,
        from,
        join,
        where_conditions,
        group_by,
        having,
        order_by,
        limit,
        distinct,
    })
}

/// One `WITH`-clause common-table-expression: its alias and its body query
/// text (without the alias or the `AS (...)` wrapper).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CteScope {
    pub alias: String,
    pub body: String,
}

/// Split a query into its `WITH`-clause scopes, in declaration order, and
/// the remaining main-query text with the `WITH` clause stripped off. Used
/// by `create` (C10) to walk each CTE scope independently — materializing
/// or rewriting it on its own — before processing the main query, the way
/// `create.py`'s `traverse_scope` visits one scope at a time.
pub fn split_ctes(sql: &str) -> Result<(Vec<CteScope>, String)> {
    let mut query = parse_query(sql)?;
    let with = query.with.take();
    let main_sql = query.to_string();

    let scopes = match with {
        Some(with) => with
            .cte_tables
            .into_iter()
            .map(|cte| CteScope {
                alias: cte.alias.name.value,
                body: cte.query.to_string(),
            })
            .collect(),
        None => Vec::new(),
    };

    Ok((scopes, main_sql))
}

/// Replace whole-word references to `alias` with `replacement`, used after
/// a CTE scope materializes into a temp table so later CTEs and the main
/// query can pick up the substitution textually. `schema.alias.column`
/// never applies (a CTE can't be schema-qualified), so a word-boundary
/// match is enough to avoid touching unrelated identifiers that merely
/// contain `alias` as a substring.
pub fn substitute_table_reference(sql: &str, alias: &str, replacement: &str) -> String {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(alias));
    match regex::Regex::new(&pattern) {
        Ok(re) => re.replace_all(sql, replacement).into_owned(),
        Err(_) => sql.to_string(),
    }
}

/// `GROUP BY 1` references the first select-list item positionally; resolve
/// it to `{from_alias}.{select_alias}` the way the original numeric-group
/// handling did, since the warehouse materializes a temp table with
/// unqualified output columns and the rewriter needs a stable name.
fn resolve_group_ref(
    expr: &ast::Expr,
    _position: usize,
    select_items: &[SelectItem],
    from: &TableRef,
) -> String {
    if let ast::Expr::Value(ast::Value::Number(n, _)) = expr {
        if let Ok(idx) = n.parse::<usize>() {
            if idx >= 1 {
                if let Some(item) = select_items.get(idx - 1) {
                    return format!("{}.{}", from.effective_alias(), item.alias);
                }
            }
        }
    }
    expr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_select() {
        let tree = extract("SELECT a.x, a.y FROM t AS a WHERE a.x > 0").unwrap();
        assert_eq!(tree.select.len(), 2);
        assert_eq!(tree.from.name, "t");
        assert_eq!(tree.from.alias.as_deref(), Some("a"));
        assert_eq!(tree.where_conditions, vec!["a.x > 0"]);
    }

    #[test]
    fn splits_where_on_top_level_and() {
        let tree = extract("SELECT a.x FROM t AS a WHERE a.x > 0 AND a.y < 5").unwrap();
        assert_eq!(tree.where_conditions.len(), 2);
    }

    #[test]
    fn keeps_or_group_parenthesized() {
        let tree = extract("SELECT a.x FROM t AS a WHERE a.x > 0 OR a.y < 5").unwrap();
        assert_eq!(tree.where_conditions.len(), 1);
        assert!(tree.where_conditions[0].starts_with('('));
    }

    #[test]
    fn extracts_joins_with_type() {
        let tree =
            extract("SELECT a.x FROM t AS a LEFT JOIN u AS b ON a.id = b.id").unwrap();
        assert_eq!(tree.join.len(), 1);
        assert_eq!(tree.join[0].join_type, JoinKind::Left);
    }

    #[test]
    fn resolves_positional_group_by() {
        let tree = extract("SELECT a.x AS col FROM t AS a GROUP BY 1").unwrap();
        assert_eq!(tree.group_by, vec!["a.col".to_string()]);
    }

    #[test]
    fn rejects_set_operations() {
        let err = extract("SELECT 1 UNION SELECT 2").unwrap_err();
        assert!(matches!(err, SpeqlError::ParseReject(_)));
    }

    #[test]
    fn distinct_flag_is_detected() {
        let tree = extract("SELECT DISTINCT a.x FROM t AS a").unwrap();
        assert!(tree.distinct);
        let tree2 = extract("SELECT a.x FROM t AS a").unwrap();
        assert!(!tree2.distinct);
    }

    #[test]
    fn limit_is_extracted() {
        let tree = extract("SELECT a.x FROM t AS a LIMIT 10").unwrap();
        assert_eq!(tree.limit.as_deref(), Some("10"));
    }

    #[test]
    fn split_ctes_separates_scopes_from_main_query() {
        let (scopes, main) =
            split_ctes("WITH cte1 AS (SELECT a.x FROM t AS a) SELECT c.x FROM cte1 AS c").unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].alias, "cte1");
        assert!(scopes[0].body.contains("SELECT"));
        assert!(!main.to_uppercase().contains("WITH"));
    }

    #[test]
    fn split_ctes_returns_empty_scopes_without_with_clause() {
        let (scopes, main) = split_ctes("SELECT a.x FROM t AS a").unwrap();
        assert!(scopes.is_empty());
        assert!(main.contains("SELECT"));
    }

    #[test]
    fn substitute_table_reference_replaces_whole_word_only() {
        let out = substitute_table_reference("SELECT * FROM cte1, cte10", "cte1", "TMP_1");
        assert!(out.contains("TMP_1"));
        assert!(out.contains("cte10"));
    }
}
