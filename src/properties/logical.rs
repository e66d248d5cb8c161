//! Relational and scalar properties.

use crate::meta::{ColumnId, ColumnSet};
use crate::statistics::Statistics;

/// Functional dependencies of a relational expression. Currently only tracks
/// columns that are held constant by an equality predicate.
#[derive(Debug, Clone, Default)]
pub struct FuncDeps {
    constants: ColumnSet,
}

impl FuncDeps {
    /// Creates functional dependencies with no known facts.
    pub fn new() -> Self {
        FuncDeps::default()
    }

    /// Records that the given column has a constant value.
    pub fn add_constant(&mut self, id: ColumnId) {
        self.constants.insert(id);
    }

    /// Returns `true` if the given column is known to be constant.
    pub fn is_constant(&self, id: ColumnId) -> bool {
        self.constants.contains(id)
    }

    /// Returns `true` if no facts are known.
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Adds all facts known by `other` to this set of dependencies.
    pub fn union_with(&mut self, other: &FuncDeps) {
        self.constants.union_with(&other.constants);
    }
}

/// Properties that are identical across all expressions within a memo group.
#[derive(Debug, Clone, Default)]
pub struct RelationalProps {
    /// The columns produced by the expression.
    pub output_columns: ColumnSet,
    /// Columns referenced by the expression that are produced outside of it.
    pub outer_columns: ColumnSet,
    /// Functional dependencies of the expression.
    pub func_deps: FuncDeps,
    /// Statistics of the expression.
    pub statistics: Option<Statistics>,
}

impl RelationalProps {
    /// Returns statistics for the expression.
    pub fn statistics(&self) -> Option<&Statistics> {
        self.statistics.as_ref()
    }
}

/// Properties of a scalar expression.
#[derive(Debug, Clone, Default)]
pub struct ScalarProps {
    /// Whether any descendant of the expression is a relational subquery.
    /// A scalar expression without a subquery has exactly one plan and costs nothing.
    pub has_subquery: bool,
}

#[cfg(test)]
mod test {
    use crate::meta::ColumnId;
    use crate::properties::logical::FuncDeps;

    #[test]
    fn constants() {
        let mut fds = FuncDeps::new();
        assert!(fds.is_empty(), "no facts");

        fds.add_constant(ColumnId(1));
        assert!(fds.is_constant(ColumnId(1)), "col:1 is constant");
        assert!(!fds.is_constant(ColumnId(2)), "col:2 is not constant");
    }
}
