use crate::core::{ProxyError, Result};
use crate::parser::ast::*;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Turns SQL text into the statement tree consumed by the router
///
/// Parsing is delegated to `sqlparser` with its PostgreSQL dialect. Every
/// node the router does not understand becomes an explicit `Unsupported`
/// variant rather than an error, so the router decides how to reject it.
pub struct SqlParserAdapter {
    dialect: PostgreSqlDialect,
}

impl SqlParserAdapter {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    /// Parse `sql` into one entry per statement
    ///
    /// A single statement keeps its original text for execution; when the
    /// text holds several statements each one is rendered back to SQL.
    pub fn parse(&self, sql: &str) -> Result<Vec<ParsedStatement>> {
        let external_stmts =
            Parser::parse_sql(&self.dialect, sql).map_err(|e| ProxyError::Parse(e.to_string()))?;

        let single = external_stmts.len() == 1;
        Ok(external_stmts
            .into_iter()
            .map(|stmt| {
                let text = if single {
                    sql.trim().trim_end_matches(';').trim_end().to_string()
                } else {
                    stmt.to_string()
                };
                ParsedStatement {
                    statement: convert_statement(stmt),
                    sql: text,
                }
            })
            .collect())
    }
}

impl Default for SqlParserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn convert_statement(stmt: sql_ast::Statement) -> Statement {
    match stmt {
        sql_ast::Statement::Insert(insert) => convert_insert(insert),
        sql_ast::Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            if from.is_some() {
                return Statement::Unsupported("UPDATE ... FROM".into());
            }
            convert_update(table, assignments, selection)
        }
        sql_ast::Statement::Delete(delete) => convert_delete(delete),
        sql_ast::Statement::Query(query) => convert_query(*query),
        other => Statement::Unsupported(statement_kind(&other)),
    }
}

fn convert_insert(insert: sql_ast::Insert) -> Statement {
    let table = extract_table_name(&insert.table_name);
    let columns = insert.columns.iter().map(normalize_ident).collect();

    let source = match insert.source {
        Some(query) if query.with.is_none() => match *query.body {
            sql_ast::SetExpr::Values(values) => InsertSource::Values(
                values
                    .rows
                    .into_iter()
                    .map(|row| row.into_iter().map(convert_expr).collect())
                    .collect(),
            ),
            _ => InsertSource::Unsupported("INSERT ... SELECT".into()),
        },
        Some(_) => InsertSource::Unsupported("INSERT with common table expressions".into()),
        None => InsertSource::Unsupported("INSERT ... DEFAULT VALUES".into()),
    };

    Statement::Insert(InsertStmt {
        table,
        columns,
        source,
    })
}

fn convert_update(
    table: sql_ast::TableWithJoins,
    assignments: Vec<sql_ast::Assignment>,
    selection: Option<sql_ast::Expr>,
) -> Statement {
    let (table, alias) = match single_table(&table) {
        Some(relation) => relation,
        None => return Statement::Unsupported("UPDATE of a joined or derived relation".into()),
    };

    let mut targets = Vec::new();
    for assignment in &assignments {
        match &assignment.target {
            sql_ast::AssignmentTarget::ColumnName(name) => targets.push(last_ident(name)),
            sql_ast::AssignmentTarget::Tuple(names) => targets.extend(names.iter().map(last_ident)),
        }
    }

    Statement::Update(UpdateStmt {
        table,
        alias,
        targets,
        selection: selection.map(convert_expr),
    })
}

fn convert_delete(delete: sql_ast::Delete) -> Statement {
    if delete.using.is_some() || !delete.tables.is_empty() {
        return Statement::Unsupported("multi-table DELETE".into());
    }

    let tables = match delete.from {
        sql_ast::FromTable::WithFromKeyword(tables) | sql_ast::FromTable::WithoutKeyword(tables) => {
            tables
        }
    };

    let table = match tables.as_slice() {
        [only] => single_table(only),
        _ => None,
    };

    match table {
        Some((table, alias)) => Statement::Delete(DeleteStmt {
            table,
            alias,
            selection: delete.selection.map(convert_expr),
        }),
        None => Statement::Unsupported("DELETE of a joined or derived relation".into()),
    }
}

fn convert_query(query: sql_ast::Query) -> Statement {
    if query.with.is_some() {
        return Statement::Unsupported("SELECT with common table expressions".into());
    }

    match *query.body {
        sql_ast::SetExpr::Select(select) => {
            let select = *select;
            Statement::Select(SelectStmt {
                from: select.from.iter().map(convert_table_with_joins).collect(),
                selection: select.selection.map(convert_expr),
            })
        }
        sql_ast::SetExpr::SetOperation { .. } => {
            Statement::Unsupported("set operation (UNION/INTERSECT/EXCEPT)".into())
        }
        sql_ast::SetExpr::Query(_) => Statement::Unsupported("parenthesized query".into()),
        sql_ast::SetExpr::Values(_) => Statement::Unsupported("VALUES list".into()),
        _ => Statement::Unsupported("query form".into()),
    }
}

fn convert_table_with_joins(twj: &sql_ast::TableWithJoins) -> FromItem {
    twj.joins
        .iter()
        .fold(convert_table_factor(&twj.relation), |left, join| FromItem::Join {
            left: Box::new(left),
            right: Box::new(convert_table_factor(&join.relation)),
        })
}

fn convert_table_factor(factor: &sql_ast::TableFactor) -> FromItem {
    match factor {
        sql_ast::TableFactor::Table {
            name, alias, args, ..
        } => {
            if args.is_some() {
                return FromItem::Unsupported(format!("table function {}", name));
            }
            FromItem::Table {
                name: extract_table_name(name),
                alias: alias.as_ref().map(|a| normalize_ident(&a.name)),
            }
        }
        sql_ast::TableFactor::NestedJoin {
            table_with_joins,
            alias: None,
        } => convert_table_with_joins(table_with_joins),
        sql_ast::TableFactor::Derived { .. } => FromItem::Unsupported("sub-select in FROM".into()),
        sql_ast::TableFactor::Function { .. } | sql_ast::TableFactor::TableFunction { .. } => {
            FromItem::Unsupported("function in FROM".into())
        }
        other => FromItem::Unsupported(other.to_string()),
    }
}

fn convert_expr(expr: sql_ast::Expr) -> Expr {
    match expr {
        sql_ast::Expr::Identifier(ident) => Expr::Column(ColumnRef {
            table: None,
            column: normalize_ident(&ident),
        }),
        sql_ast::Expr::CompoundIdentifier(idents) => match idents.as_slice() {
            [table, column] => Expr::Column(ColumnRef {
                table: Some(normalize_ident(table)),
                column: normalize_ident(column),
            }),
            [_schema, table, column] => Expr::Column(ColumnRef {
                table: Some(normalize_ident(table)),
                column: normalize_ident(column),
            }),
            _ => Expr::Unsupported(sql_ast::Expr::CompoundIdentifier(idents).to_string()),
        },
        sql_ast::Expr::Value(value) => Expr::Literal(convert_value(value)),
        sql_ast::Expr::Nested(inner) => convert_expr(*inner),
        sql_ast::Expr::BinaryOp { left, op, right } => {
            let compare = match op {
                sql_ast::BinaryOperator::Eq => Some(CompareOp::Eq),
                sql_ast::BinaryOperator::NotEq => Some(CompareOp::NotEq),
                sql_ast::BinaryOperator::Lt => Some(CompareOp::Lt),
                sql_ast::BinaryOperator::LtEq => Some(CompareOp::LtEq),
                sql_ast::BinaryOperator::Gt => Some(CompareOp::Gt),
                sql_ast::BinaryOperator::GtEq => Some(CompareOp::GtEq),
                _ => None,
            };
            if let Some(op) = compare {
                return Expr::Comparison {
                    left: Box::new(convert_expr(*left)),
                    op,
                    right: Box::new(convert_expr(*right)),
                };
            }
            let bool_op = match op {
                sql_ast::BinaryOperator::And => BoolOp::And,
                sql_ast::BinaryOperator::Or => BoolOp::Or,
                _ => {
                    return Expr::Unsupported(
                        sql_ast::Expr::BinaryOp { left, op, right }.to_string(),
                    );
                }
            };
            Expr::Bool {
                op: bool_op,
                args: vec![convert_expr(*left), convert_expr(*right)],
            }
        }
        sql_ast::Expr::UnaryOp { op, expr } => match (op, *expr) {
            (sql_ast::UnaryOperator::Not, inner) => Expr::Bool {
                op: BoolOp::Not,
                args: vec![convert_expr(inner)],
            },
            (sql_ast::UnaryOperator::Minus, sql_ast::Expr::Value(sql_ast::Value::Number(n, _))) => {
                Expr::Literal(number_literal(&format!("-{}", n)))
            }
            (sql_ast::UnaryOperator::Plus, sql_ast::Expr::Value(sql_ast::Value::Number(n, _))) => {
                Expr::Literal(number_literal(&n))
            }
            (op, inner) => Expr::Unsupported(
                sql_ast::Expr::UnaryOp {
                    op,
                    expr: Box::new(inner),
                }
                .to_string(),
            ),
        },
        other => Expr::Unsupported(other.to_string()),
    }
}

fn convert_value(value: sql_ast::Value) -> Literal {
    match value {
        sql_ast::Value::Number(n, _) => number_literal(&n),
        sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::EscapedStringLiteral(s) => {
            Literal::String(s)
        }
        sql_ast::Value::DollarQuotedString(s) => Literal::String(s.value),
        sql_ast::Value::Null => Literal::Null,
        other => Literal::Other(other.to_string()),
    }
}

/// Integers that fit in 64 bits; anything else is a numeric constant.
fn number_literal(text: &str) -> Literal {
    match text.parse::<i64>() {
        Ok(n) => Literal::Integer(n),
        Err(_) => Literal::Other(text.to_string()),
    }
}

/// Name and alias of a lone table
fn single_table(twj: &sql_ast::TableWithJoins) -> Option<(String, Option<String>)> {
    if !twj.joins.is_empty() {
        return None;
    }
    match &twj.relation {
        sql_ast::TableFactor::Table {
            name,
            alias,
            args: None,
            ..
        } => Some((
            extract_table_name(name),
            alias.as_ref().map(|a| normalize_ident(&a.name)),
        )),
        _ => None,
    }
}

/// Unqualified table name; unquoted identifiers fold to lower case
fn extract_table_name(name: &sql_ast::ObjectName) -> String {
    last_ident(name)
}

fn last_ident(name: &sql_ast::ObjectName) -> String {
    name.0.last().map(normalize_ident).unwrap_or_default()
}

fn normalize_ident(ident: &sql_ast::Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

fn statement_kind(stmt: &sql_ast::Statement) -> String {
    let text = stmt.to_string();
    let words: Vec<&str> = text.split_whitespace().take(2).collect();
    match words.as_slice() {
        [first, second] if first.eq_ignore_ascii_case("CREATE")
            || first.eq_ignore_ascii_case("DROP")
            || first.eq_ignore_ascii_case("ALTER") =>
        {
            format!("{} {}", first.to_uppercase(), second.to_uppercase())
        }
        [first, ..] => first.to_uppercase(),
        [] => "empty statement".to_string(),
    }
}
