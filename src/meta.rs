//! Query metadata: column identifiers and column sets.

use bit_set::BitSet;
use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// Uniquely identifies a column within a query.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ColumnId(pub usize);

impl Display for ColumnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of column identifiers.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ColumnSet {
    columns: BitSet,
}

impl ColumnSet {
    /// Creates an empty column set.
    pub fn new() -> Self {
        ColumnSet { columns: BitSet::new() }
    }

    /// Adds the given column to this set.
    pub fn insert(&mut self, id: ColumnId) {
        self.columns.insert(id.0);
    }

    /// Returns `true` if this set contains the given column.
    pub fn contains(&self, id: ColumnId) -> bool {
        self.columns.contains(id.0)
    }

    /// Returns `true` if every column of this set is present in `other`.
    pub fn is_subset(&self, other: &ColumnSet) -> bool {
        self.columns.is_subset(&other.columns)
    }

    /// Adds all columns from `other` to this set.
    pub fn union_with(&mut self, other: &ColumnSet) {
        self.columns.union_with(&other.columns);
    }

    /// Removes all columns of `other` from this set.
    pub fn subtract(&mut self, other: &ColumnSet) {
        self.columns.difference_with(&other.columns);
    }

    /// Returns `true` if this set has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the number of columns in this set.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns an iterator over the columns of this set in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ColumnId> + '_ {
        self.columns.iter().map(ColumnId)
    }
}

impl FromIterator<ColumnId> for ColumnSet {
    fn from_iter<T: IntoIterator<Item = ColumnId>>(iter: T) -> Self {
        let mut set = ColumnSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl Display for ColumnSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.iter().join(", "))
    }
}

/// A column registered in the query metadata.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    name: String,
    table: Option<String>,
}

impl ColumnMeta {
    /// The name of this column.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the table this column belongs to, if any.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }
}

/// Stores a mapping between columns and their identifiers that are globally unique within a query.
/// Identifiers are assigned sequentially starting from `1`.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    columns: Vec<ColumnMeta>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata { columns: Vec::new() }
    }

    /// Registers a new column and returns its identifier.
    pub fn add_column<T>(&mut self, name: T, table: Option<String>) -> ColumnId
    where
        T: Into<String>,
    {
        self.columns.push(ColumnMeta {
            name: name.into(),
            table,
        });
        ColumnId(self.columns.len())
    }

    /// Retrieves a column by the given column id.
    ///
    /// # Panics
    ///
    /// This method panics if no column with the given id has been registered.
    pub fn get_column(&self, column_id: &ColumnId) -> &ColumnMeta {
        assert!(column_id.0 >= 1, "Column ids start at 1 but got: {:?}", column_id);
        self.columns
            .get(column_id.0 - 1)
            .unwrap_or_else(|| panic!("Unknown or unexpected column id: {:?}", column_id))
    }

    /// Returns the identifier of the column with the given table and name.
    pub fn find_column(&self, table: &str, name: &str) -> Option<ColumnId> {
        self.columns
            .iter()
            .position(|c| c.table.as_deref() == Some(table) && c.name == name)
            .map(|p| ColumnId(p + 1))
    }

    /// Returns the number of registered columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}
