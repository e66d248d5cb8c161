//! Database catalog.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use crate::error::OptimizerError;

pub type CatalogRef = Arc<dyn Catalog>;
pub type TableRef = Arc<Table>;
pub type IndexRef = Arc<Index>;
pub type ColumnRef = Arc<Column>;

/// Provides access to database objects used by the optimizer.
pub trait Catalog: Debug + Sync + Send {
    /// Returns a table with the given name.
    fn get_table(&self, name: &str) -> Option<TableRef>;

    /// Returns all indexes of the given table.
    fn get_indexes(&self, table: &str) -> Vec<IndexRef>;
}

/// Represents a database table.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Vec<ColumnRef>,
    statistics: Option<TableStatistics>,
}

impl Table {
    /// The name of this table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The columns of this table.
    pub fn columns(&self) -> &[ColumnRef] {
        &self.columns
    }

    /// Returns a column with the given name.
    pub fn get_column(&self, name: &str) -> Option<ColumnRef> {
        self.columns.iter().find(|c| c.name == name).cloned()
    }

    /// Returns statistics available for this table.
    pub fn statistics(&self) -> Option<&TableStatistics> {
        self.statistics.as_ref()
    }
}

/// Statistics for a database table.
#[derive(Debug, Clone)]
pub struct TableStatistics {
    row_count: Option<usize>,
}

impl TableStatistics {
    /// Creates a new table statistics object.
    pub fn new(row_count: usize) -> Self {
        TableStatistics {
            row_count: Some(row_count),
        }
    }

    /// The total number of rows in a table.
    pub fn row_count(&self) -> Option<usize> {
        self.row_count
    }
}

/// Represents a column of a database table.
#[derive(Debug, Clone)]
pub struct Column {
    name: String,
}

impl Column {
    /// The name of this column.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a secondary index of a database table. The columns of an index
/// are sorted in ascending order.
#[derive(Debug, Clone)]
pub struct Index {
    name: String,
    table: String,
    columns: Vec<String>,
}

impl Index {
    /// The name of this index.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the table this index belongs to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The names of the columns covered by this index, in index order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// A builder to create instances of a [Table].
pub struct TableBuilder {
    name: String,
    columns: Vec<String>,
    row_count: Option<usize>,
}

impl TableBuilder {
    /// Creates a builder for a table with the given name.
    pub fn new(name: &str) -> Self {
        TableBuilder {
            name: name.into(),
            columns: Vec::new(),
            row_count: None,
        }
    }

    /// Adds a column to the table.
    pub fn add_column(mut self, name: &str) -> TableBuilder {
        self.columns.push(name.into());
        self
    }

    /// Sets the number of rows in the table.
    pub fn add_row_count(mut self, row_count: usize) -> TableBuilder {
        self.row_count = Some(row_count);
        self
    }

    /// Builds the table.
    pub fn build(self) -> Result<Table, OptimizerError> {
        if self.columns.is_empty() {
            return Err(OptimizerError::argument(format!("Table has no columns: {}", self.name)));
        }
        Ok(Table {
            name: self.name,
            columns: self.columns.into_iter().map(|name| Arc::new(Column { name })).collect(),
            statistics: self.row_count.map(TableStatistics::new),
        })
    }
}

/// A builder to create instances of an [Index].
pub struct IndexBuilder {
    name: String,
    table: String,
    columns: Vec<String>,
}

impl IndexBuilder {
    /// Creates a builder for an index with the given name on the given table.
    pub fn new(table: &str, name: &str) -> Self {
        IndexBuilder {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a column to the index.
    pub fn add_column(mut self, column: &str) -> IndexBuilder {
        self.columns.push(column.into());
        self
    }

    /// Builds the index.
    pub fn build(self) -> Result<Index, OptimizerError> {
        if self.columns.is_empty() {
            return Err(OptimizerError::argument(format!("Index has no columns: {}", self.name)));
        }
        Ok(Index {
            name: self.name,
            table: self.table,
            columns: self.columns,
        })
    }
}

/// A [database catalog](Catalog) that stores database objects in memory
/// and provides operations to add tables and indexes.
#[derive(Debug, Default)]
pub struct MutableCatalog {
    tables: RwLock<HashMap<String, TableRef>>,
    indexes: RwLock<HashMap<String, Vec<IndexRef>>>,
}

impl MutableCatalog {
    /// Creates an instance of [MutableCatalog].
    pub fn new() -> Self {
        MutableCatalog::default()
    }

    /// Adds the given table to this catalog.
    /// If a table with the same name already exists this method returns an error.
    pub fn add_table(&self, table: Table) -> Result<(), OptimizerError> {
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(table.name()) {
            return Err(OptimizerError::argument(format!("Table already exists: {}", table.name())));
        }
        tables.insert(table.name().into(), Arc::new(table));
        Ok(())
    }

    /// Adds the given index to this catalog.
    /// If the table the index refers to does not exist this method returns an error.
    pub fn add_index(&self, index: Index) -> Result<(), OptimizerError> {
        let tables = self.tables.read().unwrap();
        let table = tables
            .get(index.table())
            .ok_or_else(|| OptimizerError::argument(format!("Table does not exist: {}", index.table())))?;
        for column in index.columns() {
            if table.get_column(column).is_none() {
                return Err(OptimizerError::argument(format!(
                    "Index {} uses an unknown column: {}.{}",
                    index.name(),
                    index.table(),
                    column
                )));
            }
        }
        let mut indexes = self.indexes.write().unwrap();
        indexes.entry(index.table().into()).or_default().push(Arc::new(index));
        Ok(())
    }
}

impl Catalog for MutableCatalog {
    fn get_table(&self, name: &str) -> Option<TableRef> {
        let tables = self.tables.read().unwrap();
        tables.get(name).cloned()
    }

    fn get_indexes(&self, table: &str) -> Vec<IndexRef> {
        let indexes = self.indexes.read().unwrap();
        indexes.get(table).cloned().unwrap_or_default()
    }
}
