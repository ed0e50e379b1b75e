use crate::core::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Declarative description of the keyspace: which tables exist and which
/// columns place their rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSchema {
    pub keyspace: String,
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Sharded,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: TableKind,
    #[serde(rename = "VIndexes", default)]
    pub vindexes: Vec<VIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VIndexKind {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VIndex {
    #[serde(rename = "Columns")]
    pub columns: Vec<String>,
    #[serde(rename = "Type")]
    pub kind: VIndexKind,
}

impl VSchema {
    /// Read and validate a vschema document
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::VSchema(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let vschema: VSchema = serde_json::from_str(raw)
            .map_err(|e| ProxyError::VSchema(format!("invalid vschema document: {}", e)))?;
        vschema.validate()?;
        Ok(vschema)
    }

    /// Check the structural invariants the router relies on
    pub fn validate(&self) -> Result<()> {
        if self.keyspace.trim().is_empty() {
            return Err(ProxyError::VSchema("keyspace name cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(ProxyError::VSchema(format!(
                    "table {} is declared more than once",
                    table.name
                )));
            }

            let primaries: Vec<&VIndex> = table
                .vindexes
                .iter()
                .filter(|v| v.kind == VIndexKind::Primary)
                .collect();

            match table.kind {
                TableKind::Sharded => {
                    if primaries.len() != 1 {
                        return Err(ProxyError::VSchema(format!(
                            "sharded table {} must have exactly one primary vindex, found {}",
                            table.name,
                            primaries.len()
                        )));
                    }
                    if primaries[0].columns.is_empty() {
                        return Err(ProxyError::VSchema(format!(
                            "primary vindex of table {} has no columns",
                            table.name
                        )));
                    }
                }
                TableKind::Reference => {
                    if !primaries.is_empty() {
                        return Err(ProxyError::VSchema(format!(
                            "reference table {} cannot have a primary vindex",
                            table.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

impl Table {
    pub fn primary_vindex(&self) -> Option<&VIndex> {
        self.vindexes.iter().find(|v| v.kind == VIndexKind::Primary)
    }

    pub fn is_vindex_column(&self, column: &str) -> bool {
        self.primary_vindex()
            .is_some_and(|v| v.columns.iter().any(|c| c == column))
    }
}
