//! A small expression sublanguage used by the clause tree and the rewriter.
//!
//! `sqlparser::ast::Expr` is the AST we parse into, but it is far larger
//! than what clause matching needs — the rewriter only ever asks "is this a
//! bare column reference, and if so to which table", or "render this back
//! to SQL verbatim". `Expr` here is that reduced view: anything the
//! converter in [`from_ast`] doesn't specifically recognise degrades to
//! `Raw`, which still round-trips through `to_sql` losslessly.

use sqlparser::ast;

/// A reduced expression tree, enough for clause-level matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A column reference: `table.column` or just `column`.
    ColumnRef {
        table_alias: Option<String>,
        column_name: String,
    },
    /// A literal value, kept as its source text.
    Literal(String),
    /// A binary operation: `left op right`.
    BinaryOp {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// A function call: `func(args...)`.
    FuncCall { func_name: String, args: Vec<Expr> },
    /// A star expression: `*` or `table.*`.
    Star { table_alias: Option<String> },
    /// Anything else, kept as the original SQL text so it round-trips.
    Raw(String),
}

impl Expr {
    /// Build a reduced `Expr` from a full `sqlparser` expression. Anything
    /// not explicitly handled is kept as `Raw(expr.to_string())`.
    pub fn from_ast(expr: &ast::Expr) -> Expr {
        match expr {
            ast::Expr::Identifier(ident) => Expr::ColumnRef {
                table_alias: None,
                column_name: ident.value.clone(),
            },
            ast::Expr::CompoundIdentifier(parts) if parts.len() == 2 => Expr::ColumnRef {
                table_alias: Some(parts[0].value.clone()),
                column_name: parts[1].value.clone(),
            },
            ast::Expr::Value(v) => Expr::Literal(v.to_string()),
            ast::Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                op: op.to_string(),
                left: Box::new(Expr::from_ast(left)),
                right: Box::new(Expr::from_ast(right)),
            },
            ast::Expr::Function(func) => {
                let func_name = func.name.to_string();
                let args = match &func.args {
                    ast::FunctionArguments::List(list) => list
                        .args
                        .iter()
                        .filter_map(|a| match a {
                            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => {
                                Some(Expr::from_ast(e))
                            }
                            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard) => {
                                Some(Expr::Star { table_alias: None })
                            }
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                Expr::FuncCall { func_name, args }
            }
            ast::Expr::Wildcard(_) => Expr::Star { table_alias: None },
            ast::Expr::QualifiedWildcard(name, _) => Expr::Star {
                table_alias: Some(name.to_string()),
            },
            other => Expr::Raw(other.to_string()),
        }
    }

    /// Render back to SQL text.
    pub fn to_sql(&self) -> String {
        match self {
            Expr::ColumnRef {
                table_alias,
                column_name,
            } => match table_alias {
                Some(alias) => format!("{alias}.{column_name}"),
                None => column_name.clone(),
            },
            Expr::Literal(val) => val.clone(),
            Expr::BinaryOp { op, left, right } => {
                format!("{} {op} {}", left.to_sql(), right.to_sql())
            }
            Expr::FuncCall { func_name, args } => {
                let arg_strs: Vec<String> = args.iter().map(|a| a.to_sql()).collect();
                format!("{func_name}({})", arg_strs.join(", "))
            }
            Expr::Star { table_alias } => match table_alias {
                Some(alias) => format!("{alias}.*"),
                None => "*".to_string(),
            },
            Expr::Raw(sql) => sql.clone(),
        }
    }

    /// The output column name a subquery projecting this expression would
    /// expose: just the bare column name for a `ColumnRef`, the full
    /// rendered text otherwise.
    pub fn output_name(&self) -> String {
        match self {
            Expr::ColumnRef { column_name, .. } => column_name.clone(),
            _ => self.to_sql(),
        }
    }

    /// A copy with all table qualifiers on `ColumnRef` nodes stripped, for
    /// rewriting references into an unqualified CTE/subquery scope.
    pub fn strip_qualifier(&self) -> Expr {
        match self {
            Expr::ColumnRef { column_name, .. } => Expr::ColumnRef {
                table_alias: None,
                column_name: column_name.clone(),
            },
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: op.clone(),
                left: Box::new(left.strip_qualifier()),
                right: Box::new(right.strip_qualifier()),
            },
            Expr::FuncCall { func_name, args } => Expr::FuncCall {
                func_name: func_name.clone(),
                args: args.iter().map(|a| a.strip_qualifier()).collect(),
            },
            other => other.clone(),
        }
    }

    /// A copy with `old_alias.col` rewritten to `new_alias.col`, used when a
    /// cached fragment's table alias changes on rewrite.
    pub fn rewrite_alias(&self, old_alias: &str, new_alias: &str) -> Expr {
        match self {
            Expr::ColumnRef {
                table_alias: Some(a),
                column_name,
            } if a == old_alias => Expr::ColumnRef {
                table_alias: Some(new_alias.to_string()),
                column_name: column_name.clone(),
            },
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: op.clone(),
                left: Box::new(left.rewrite_alias(old_alias, new_alias)),
                right: Box::new(right.rewrite_alias(old_alias, new_alias)),
            },
            Expr::FuncCall { func_name, args } => Expr::FuncCall {
                func_name: func_name.clone(),
                args: args
                    .iter()
                    .map(|a| a.rewrite_alias(old_alias, new_alias))
                    .collect(),
            },
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn parse_expr(text: &str) -> ast::Expr {
        let sql = format!("SELECT {text}");
        let stmts = Parser::parse_sql(&GenericDialect {}, &sql).unwrap();
        match &stmts[0] {
            ast::Statement::Query(q) => match q.body.as_ref() {
                ast::SetExpr::Select(s) => match &s.projection[0] {
                    ast::SelectItem::UnnamedExpr(e) => e.clone(),
                    ast::SelectItem::ExprWithAlias { expr, .. } => expr.clone(),
                    _ => panic!("unexpected projection"),
                },
                _ => panic!("expected select"),
            },
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn column_ref_round_trips() {
        let e = Expr::from_ast(&parse_expr("t.a"));
        assert_eq!(
            e,
            Expr::ColumnRef {
                table_alias: Some("t".to_string()),
                column_name: "a".to_string()
            }
        );
        assert_eq!(e.to_sql(), "t.a");
    }

    #[test]
    fn strip_qualifier_drops_table_alias() {
        let e = Expr::from_ast(&parse_expr("t.a"));
        assert_eq!(e.strip_qualifier().to_sql(), "a");
    }

    #[test]
    fn rewrite_alias_only_touches_matching_alias() {
        let e = Expr::from_ast(&parse_expr("t.a"));
        assert_eq!(e.rewrite_alias("t", "tmp_1").to_sql(), "tmp_1.a");
        assert_eq!(e.rewrite_alias("u", "tmp_1").to_sql(), "t.a");
    }

    #[test]
    fn func_call_args_convert() {
        let e = Expr::from_ast(&parse_expr("count(t.a)"));
        match e {
            Expr::FuncCall { func_name, args } => {
                assert_eq!(func_name.to_lowercase(), "count");
                assert_eq!(args.len(), 1);
            }
            _ => panic!("expected func call"),
        }
    }
}
