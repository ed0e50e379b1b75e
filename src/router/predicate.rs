use crate::core::{ProxyError, Result};
use crate::parser::ast::{BoolOp, ColumnRef, CompareOp, Expr, Literal};

/// Separator between vindex column values in a routing key
pub const KEY_SEPARATOR: &str = "&";

/// A `column = literal` predicate found in a WHERE clause
#[derive(Debug, Clone, PartialEq)]
pub struct Binding<'a> {
    pub column: &'a ColumnRef,
    pub value: &'a Literal,
}

/// Walk a WHERE tree and collect its equality predicates
///
/// Accepts a single `column = literal` comparison or any AND-only nesting of
/// them. Every other node is rejected: OR, NOT, non-equality operators,
/// column-to-column comparisons and bare expressions.
pub fn collect_equalities(expr: &Expr) -> Result<Vec<Binding<'_>>> {
    let mut bindings = Vec::new();
    walk(expr, &mut bindings)?;
    Ok(bindings)
}

fn walk<'a>(expr: &'a Expr, out: &mut Vec<Binding<'a>>) -> Result<()> {
    match expr {
        Expr::Bool {
            op: BoolOp::And,
            args,
        } => {
            for arg in args {
                walk(arg, out)?;
            }
            Ok(())
        }
        Expr::Bool { op, .. } => Err(ProxyError::validation(format!(
            "{} is not supported in WHERE clauses, only AND-combined equalities can be routed",
            op
        ))),
        Expr::Comparison {
            left,
            op: CompareOp::Eq,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expr::Column(column), Expr::Literal(value))
            | (Expr::Literal(value), Expr::Column(column)) => {
                out.push(Binding { column, value });
                Ok(())
            }
            (Expr::Column(a), Expr::Column(b)) => Err(ProxyError::validation(format!(
                "comparison between columns {} and {} cannot be routed",
                a.column, b.column
            ))),
            _ => Err(ProxyError::validation(
                "equality must compare a column with a constant",
            )),
        },
        Expr::Comparison { op, .. } => Err(ProxyError::validation(format!(
            "operator {} is not supported in WHERE clauses, only = can be routed",
            op
        ))),
        Expr::Column(column) => Err(ProxyError::validation(format!(
            "bare column {} is not a routable predicate",
            column.column
        ))),
        Expr::Literal(value) => Err(ProxyError::validation(format!(
            "constant {} is not a routable predicate",
            value
        ))),
        Expr::Unsupported(text) => Err(ProxyError::validation(format!(
            "expression {} is not supported in WHERE clauses",
            text
        ))),
    }
}

/// Text of a literal as it enters a routing key
pub fn routing_value(column: &str, value: &Literal) -> Result<String> {
    match value {
        Literal::Integer(n) => Ok(n.to_string()),
        Literal::String(s) => Ok(s.clone()),
        Literal::Null => Err(ProxyError::validation(format!(
            "primary vindex column {} cannot be NULL",
            column
        ))),
        Literal::Other(text) => Err(ProxyError::validation(format!(
            "value {} of primary vindex column {} must be an integer or string literal",
            text, column
        ))),
    }
}

/// Build the routing key from `bindings`, in vindex column order
///
/// Every vindex column must be bound, and bound to one value only.
pub fn key_from_bindings(
    table: &str,
    vindex_columns: &[String],
    bindings: &[Binding<'_>],
) -> Result<String> {
    let mut values = Vec::with_capacity(vindex_columns.len());

    for column in vindex_columns {
        let mut found: Option<String> = None;
        for binding in bindings.iter().filter(|b| &b.column.column == column) {
            let value = routing_value(column, binding.value)?;
            match &found {
                Some(existing) if *existing != value => {
                    return Err(ProxyError::validation(format!(
                        "primary vindex column {} of table {} is bound to conflicting values",
                        column, table
                    )));
                }
                Some(_) => {}
                None => found = Some(value),
            }
        }

        match found {
            Some(value) => values.push(value),
            None => {
                return Err(ProxyError::validation(format!(
                    "WHERE clause does not cover primary vindex column {} of table {}",
                    column, table
                )));
            }
        }
    }

    Ok(build_routing_key(values))
}

/// Join vindex values into a routing key
pub fn build_routing_key<I>(values: I) -> String
where
    I: IntoIterator<Item = String>,
{
    values
        .into_iter()
        .reduce(|mut acc, value| {
            acc.push_str(KEY_SEPARATOR);
            acc.push_str(&value);
            acc
        })
        .unwrap_or_default()
}
