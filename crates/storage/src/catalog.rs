use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use arrow_schema::SchemaRef;
use lfq_common::{LfqError, Result};
use lfq_execution::{SourceProvider, TableSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parquet_provider::ParquetTable;

/// Serializable description of a file-backed table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// A file path, or a directory whose `*.parquet` files form the table.
    pub uri: String,
    pub format: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl TableDef {
    /// Open the source described by this definition.
    pub fn open(&self) -> Result<Arc<dyn TableSource>> {
        match self.format.to_ascii_lowercase().as_str() {
            "parquet" => Ok(Arc::new(ParquetTable::try_from_path(&self.uri)?)),
            other => Err(LfqError::Unsupported(format!(
                "table '{}' has unsupported format '{other}'",
                self.name
            ))),
        }
    }
}

/// Thread-safe name to source registry.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<BTreeMap<String, Arc<dyn TableSource>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `name`, returning the source it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        source: Arc<dyn TableSource>,
    ) -> Result<Option<Arc<dyn TableSource>>> {
        let name = name.into();
        if name.is_empty() {
            return Err(LfqError::BuilderArgument(
                "table name must not be empty".to_string(),
            ));
        }
        debug!(table = %name, "registering table");
        Ok(self
            .tables
            .write()
            .expect("catalog lock poisoned")
            .insert(name, source))
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<dyn TableSource>> {
        self.tables
            .write()
            .expect("catalog lock poisoned")
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TableSource>> {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| LfqError::Schema(format!("unknown table: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn schema(&self, name: &str) -> Result<SchemaRef> {
        Ok(self.get(name)?.schema())
    }

    /// Build a catalog from a JSON array of [`TableDef`]s.
    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let defs: Vec<TableDef> =
            serde_json::from_str(&s).map_err(|e| LfqError::InvalidConfig(e.to_string()))?;
        let cat = Catalog::new();
        for def in defs {
            cat.register(def.name.clone(), def.open()?)?;
        }
        Ok(cat)
    }
}

impl SourceProvider for Catalog {
    fn source(&self, table: &str) -> Result<Arc<dyn TableSource>> {
        self.get(table)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema};

    use super::*;
    use crate::memory::MemTable;

    fn table() -> Arc<dyn TableSource> {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        Arc::new(MemTable::try_new(schema, vec![]).expect("table"))
    }

    #[test]
    fn register_replace_and_deregister() {
        let cat = Catalog::new();
        assert!(cat.register("t", table()).expect("register").is_none());
        assert!(cat.register("t", table()).expect("register").is_some());
        cat.register("a", table()).expect("register");
        assert_eq!(cat.table_names(), vec!["a".to_string(), "t".to_string()]);
        assert!(cat.deregister("t").is_some());
        assert!(matches!(cat.source("t"), Err(LfqError::Schema(_))));
        assert!(cat.register("", table()).is_err());
    }

    #[test]
    fn unknown_format_is_unsupported() {
        let def = TableDef {
            name: "x".to_string(),
            uri: "/nowhere".to_string(),
            format: "orc".to_string(),
            options: HashMap::new(),
        };
        assert!(matches!(def.open(), Err(LfqError::Unsupported(_))));
    }
}
