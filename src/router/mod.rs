pub mod predicate;

use crate::cluster::{Cluster, Shard};
use crate::connection::ResultSet;
use crate::core::{ProxyError, Result};
use crate::parser::ast::{
    Command, DeleteStmt, Expr, FromItem, InsertSource, InsertStmt, ParsedStatement, SelectStmt,
    Statement, UpdateStmt,
};
use crate::vschema::{Table, TableKind, VSchema};
use predicate::{Binding, build_routing_key, collect_equalities, key_from_bindings, routing_value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Validates statements against the vschema and sends each one to the
/// single shard owning its rows
///
/// Validation happens entirely before a shard is contacted; any shape that
/// cannot be proven to live on exactly one shard is rejected.
pub struct QueryRouter {
    cluster: Arc<Cluster>,
    vschema: Arc<VSchema>,
}

/// Where a statement goes
#[derive(Debug)]
pub struct RoutePlan<'a> {
    pub command: Command,
    pub shard: &'a Shard,
    /// Routing key, absent for statements on reference tables
    pub key: Option<String>,
    pub sql: &'a str,
}

/// Outcome of a routed statement
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub command: Command,
    pub results: Vec<ResultSet>,
}

/// A relation named in a statement, with its optional alias
#[derive(Debug, Clone, Copy)]
struct Relation<'a> {
    name: &'a str,
    alias: Option<&'a str>,
}

impl Relation<'_> {
    fn answers_to(&self, qualifier: &str) -> bool {
        match self.alias {
            Some(alias) => alias == qualifier,
            None => self.name == qualifier,
        }
    }
}

impl QueryRouter {
    pub fn new(cluster: Arc<Cluster>, vschema: Arc<VSchema>) -> Self {
        Self { cluster, vschema }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn vschema(&self) -> &Arc<VSchema> {
        &self.vschema
    }

    /// Validate `parsed` and pick its target shard without executing it
    pub fn plan<'a>(&'a self, parsed: &'a ParsedStatement) -> Result<RoutePlan<'a>> {
        let (command, key) = match &parsed.statement {
            Statement::Insert(insert) => (Command::Insert, Some(self.insert_key(insert)?)),
            Statement::Update(update) => (Command::Update, Some(self.update_key(update)?)),
            Statement::Delete(delete) => (Command::Delete, Some(self.delete_key(delete)?)),
            Statement::Select(select) => (Command::Select, self.select_key(select)?),
            Statement::Unsupported(kind) => {
                return Err(ProxyError::validation(format!(
                    "{} statements cannot be routed",
                    kind
                )));
            }
        };

        let shard = match &key {
            Some(key) => self.cluster.shard_for_keyspace_id(key)?,
            None => self
                .cluster
                .shards()
                .first()
                .ok_or_else(|| ProxyError::validation("cluster has no shards"))?,
        };

        Ok(RoutePlan {
            command,
            shard,
            key,
            sql: &parsed.sql,
        })
    }

    /// Route `parsed` and run it on its shard
    pub async fn execute(
        &self,
        parsed: &ParsedStatement,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let plan = self.plan(parsed)?;
        debug!(
            shard = %plan.shard.name(),
            command = %plan.command,
            key = ?plan.key,
            "routing statement"
        );

        let results = plan.shard.pool.exec(plan.sql, cancel).await?;
        Ok(Execution {
            command: plan.command,
            results,
        })
    }

    fn resolve(&self, name: &str) -> Result<&Table> {
        self.vschema.table(name).ok_or_else(|| {
            ProxyError::validation(format!("table {} is not part of the vschema", name))
        })
    }

    /// Resolve the target of a write, which must be a sharded table
    fn resolve_sharded(&self, name: &str, command: Command) -> Result<(&Table, &[String])> {
        let table = self.resolve(name)?;
        if table.kind == TableKind::Reference {
            return Err(ProxyError::validation(format!(
                "{} on reference table {} would have to reach every shard",
                command, name
            )));
        }
        let vindex = table.primary_vindex().ok_or_else(|| {
            ProxyError::validation(format!("table {} has no primary vindex", name))
        })?;
        Ok((table, &vindex.columns))
    }

    fn insert_key(&self, insert: &InsertStmt) -> Result<String> {
        let (table, vindex_columns) = self.resolve_sharded(&insert.table, Command::Insert)?;

        if insert.columns.is_empty() {
            return Err(ProxyError::validation(format!(
                "INSERT into {} must list its columns",
                table.name
            )));
        }

        let positions = vindex_columns
            .iter()
            .map(|column| {
                insert
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .ok_or_else(|| {
                        ProxyError::validation(format!(
                            "INSERT into {} does not provide primary vindex column {}",
                            table.name, column
                        ))
                    })
            })
            .collect::<Result<Vec<usize>>>()?;

        let rows = match &insert.source {
            InsertSource::Values(rows) => rows,
            InsertSource::Unsupported(kind) => {
                return Err(ProxyError::validation(format!("{} cannot be routed", kind)));
            }
        };

        let mut routed: Option<(String, u64)> = None;
        for row in rows {
            if row.len() != insert.columns.len() {
                return Err(ProxyError::validation(format!(
                    "VALUES row has {} values for {} columns",
                    row.len(),
                    insert.columns.len()
                )));
            }

            let values = positions
                .iter()
                .zip(vindex_columns)
                .map(|(&i, column)| match &row[i] {
                    Expr::Literal(value) => routing_value(column, value),
                    _ => Err(ProxyError::validation(format!(
                        "primary vindex column {} must be an integer or string literal",
                        column
                    ))),
                })
                .collect::<Result<Vec<String>>>()?;
            let key = build_routing_key(values);
            let shard = self.cluster.shard_for_keyspace_id(&key)?;

            match &routed {
                None => routed = Some((key, shard.spec.keyspace_start)),
                Some((_, start)) if *start == shard.spec.keyspace_start => {}
                Some(_) => {
                    return Err(ProxyError::validation(format!(
                        "INSERT rows for {} belong to more than one shard",
                        table.name
                    )));
                }
            }
        }

        routed
            .map(|(key, _)| key)
            .ok_or_else(|| ProxyError::validation("INSERT without rows cannot be routed"))
    }

    fn update_key(&self, update: &UpdateStmt) -> Result<String> {
        let (table, vindex_columns) = self.resolve_sharded(&update.table, Command::Update)?;

        if let Some(column) = update
            .targets
            .iter()
            .find(|target| table.is_vindex_column(target))
        {
            return Err(ProxyError::validation(format!(
                "cannot update primary vindex column {} of table {}",
                column, table.name
            )));
        }

        let relation = Relation {
            name: &update.table,
            alias: update.alias.as_deref(),
        };
        self.write_key(
            table,
            relation,
            vindex_columns,
            update.selection.as_ref(),
            Command::Update,
        )
    }

    fn delete_key(&self, delete: &DeleteStmt) -> Result<String> {
        let (table, vindex_columns) = self.resolve_sharded(&delete.table, Command::Delete)?;
        let relation = Relation {
            name: &delete.table,
            alias: delete.alias.as_deref(),
        };
        self.write_key(
            table,
            relation,
            vindex_columns,
            delete.selection.as_ref(),
            Command::Delete,
        )
    }

    fn write_key(
        &self,
        table: &Table,
        relation: Relation<'_>,
        vindex_columns: &[String],
        selection: Option<&Expr>,
        command: Command,
    ) -> Result<String> {
        let selection = selection.ok_or_else(|| {
            ProxyError::validation(format!(
                "{} on {} requires a WHERE clause on its primary vindex",
                command, table.name
            ))
        })?;

        let bindings = collect_equalities(selection)?;
        for binding in &bindings {
            if let Some(qualifier) = &binding.column.table {
                if !relation.answers_to(qualifier) {
                    return Err(ProxyError::validation(format!(
                        "column {}.{} does not belong to table {}",
                        qualifier, binding.column.column, table.name
                    )));
                }
            }
        }

        key_from_bindings(&table.name, vindex_columns, &bindings)
    }

    /// Routing key of a SELECT, `None` when it reads reference tables only
    fn select_key(&self, select: &SelectStmt) -> Result<Option<String>> {
        let from = match select.from.as_slice() {
            [] => return Err(ProxyError::validation("SELECT without FROM cannot be routed")),
            [only] => only,
            _ => {
                return Err(ProxyError::validation(
                    "comma-separated FROM lists cannot be routed, use JOIN",
                ));
            }
        };

        let mut relations = Vec::new();
        collect_relations(from, &mut relations)?;

        let tables = relations
            .iter()
            .map(|r| self.resolve(r.name))
            .collect::<Result<Vec<&Table>>>()?;
        let first = tables[0];

        if first.kind == TableKind::Reference {
            if let Some(sharded) = tables.iter().find(|t| t.kind == TableKind::Sharded) {
                return Err(ProxyError::validation(format!(
                    "sharded table {} must be the first relation when joined with reference table {}",
                    sharded.name, first.name
                )));
            }
            return Ok(None);
        }

        let vindex_columns = &first
            .primary_vindex()
            .ok_or_else(|| {
                ProxyError::validation(format!("table {} has no primary vindex", first.name))
            })?
            .columns;

        let selection = select.selection.as_ref().ok_or_else(|| {
            ProxyError::validation(format!(
                "SELECT on {} requires a WHERE clause on its primary vindex",
                first.name
            ))
        })?;

        let mut own: Vec<Binding<'_>> = Vec::new();
        for binding in collect_equalities(selection)? {
            let relation = match &binding.column.table {
                None => 0,
                Some(qualifier) => relations
                    .iter()
                    .position(|r| r.answers_to(qualifier))
                    .ok_or_else(|| {
                        ProxyError::validation(format!(
                            "relation {} is not part of the FROM clause",
                            qualifier
                        ))
                    })?,
            };
            if relation == 0 {
                own.push(binding);
            }
        }

        key_from_bindings(&first.name, vindex_columns, &own).map(Some)
    }
}

/// Flatten a JOIN tree into its base tables, leftmost first
fn collect_relations<'a>(item: &'a FromItem, out: &mut Vec<Relation<'a>>) -> Result<()> {
    match item {
        FromItem::Table { name, alias } => {
            out.push(Relation {
                name,
                alias: alias.as_deref(),
            });
            Ok(())
        }
        FromItem::Join { left, right } => {
            collect_relations(left, out)?;
            collect_relations(right, out)
        }
        FromItem::Unsupported(kind) => Err(ProxyError::validation(format!(
            "{} cannot be routed, only base tables and joins are supported",
            kind
        ))),
    }
}
