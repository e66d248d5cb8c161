//! Ordering. Describes how columns are sorted.

use itertools::Itertools;
use std::fmt::{Display, Formatter};

use crate::catalog::Catalog;
use crate::memo::{ExprId, Memo};
use crate::meta::{ColumnId, ColumnSet};
use crate::operators::{Expr, RelExpr};
use crate::properties::logical::FuncDeps;

/// Specifies how a column is sorted.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash, Ord, PartialOrd)]
pub struct OrderingColumn(i32);

impl OrderingColumn {
    /// Creates an ordering for the given column.
    pub fn ord(id: ColumnId, descending: bool) -> Self {
        if descending {
            OrderingColumn::desc(id)
        } else {
            OrderingColumn::asc(id)
        }
    }

    /// Ordering in ascending order for the given column.
    pub fn asc(id: ColumnId) -> Self {
        OrderingColumn(id.0 as i32)
    }

    /// Ordering in descending order for the given column.
    pub fn desc(id: ColumnId) -> Self {
        OrderingColumn(-(id.0 as i32))
    }

    /// Returns the column.
    pub fn column(&self) -> ColumnId {
        ColumnId(self.0.unsigned_abs() as usize)
    }

    /// Returns `true` if the column is sorted in descending order.
    pub fn descending(&self) -> bool {
        self.0 < 0
    }

    /// Returns `true` if the column is sorted in ascending order.
    pub fn ascending(&self) -> bool {
        self.0 > 0
    }
}

impl Display for OrderingColumn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.descending() {
            // if ordering is descending then the column id has a negative sign.
            write!(f, "{}", self.0)
        } else {
            write!(f, "+{}", self.0)
        }
    }
}

/// Ordering. Describes how columns are sorted. An empty ordering places no
/// constraint on how rows are sorted.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct OrderingChoice {
    columns: Vec<OrderingColumn>,
}

impl OrderingChoice {
    /// Creates an ordering from the given ordering columns.
    ///
    /// # Panics
    ///
    /// This method panics if the ordering columns are empty.
    pub fn new(columns: Vec<OrderingColumn>) -> Self {
        assert!(!columns.is_empty(), "columns are not specified");
        OrderingChoice { columns }
    }

    /// Returns an ordering that places no constraint on how rows are sorted.
    pub fn any() -> Self {
        OrderingChoice { columns: Vec::new() }
    }

    /// Creates an ordering from the given columns.
    /// Returns an ordering where all columns are ordered in ascending order.
    pub fn from_columns(columns: Vec<ColumnId>) -> Self {
        OrderingChoice::new(columns.into_iter().map(OrderingColumn::asc).collect())
    }

    /// Returns `true` if this ordering places no constraint on how rows are sorted.
    pub fn is_any(&self) -> bool {
        self.columns.is_empty()
    }

    /// A reference to the ordering columns.
    pub fn columns(&self) -> &[OrderingColumn] {
        &self.columns
    }

    /// Returns `true` if this ordering is a prefix of the given ordering.
    pub fn prefix_of(&self, other: &OrderingChoice) -> bool {
        if self.columns.len() > other.columns.len() {
            return false;
        }
        self.columns.iter().zip(other.columns.iter()).all(|(l, r)| l == r)
    }

    /// Returns the number of leading columns shared by this ordering and the given ordering.
    pub fn common_prefix_len(&self, other: &OrderingChoice) -> usize {
        self.columns.iter().zip(other.columns.iter()).take_while(|(l, r)| l == r).count()
    }

    /// Returns `true` if [simplify](Self::simplify) would remove at least one column.
    pub fn can_simplify(&self, fds: &FuncDeps) -> bool {
        self.columns.iter().any(|c| fds.is_constant(c.column()))
    }

    /// Removes columns that are held constant by the given functional dependencies.
    /// Sorting by a constant column does not affect the order of rows.
    pub fn simplify(&mut self, fds: &FuncDeps) {
        self.columns.retain(|c| !fds.is_constant(c.column()));
    }

    /// Restricts this ordering to the given columns. The ordering is truncated
    /// at the first column outside of the set because the remaining columns no
    /// longer describe a sort the expression can produce.
    pub fn project_cols(&mut self, cols: &ColumnSet) {
        if let Some(p) = self.columns.iter().position(|c| !cols.contains(c.column())) {
            self.columns.truncate(p);
        }
    }

    /// Returns `true` if every column of this ordering is present in the given set.
    pub fn subset_of_cols(&self, cols: &ColumnSet) -> bool {
        self.columns.iter().all(|c| cols.contains(c.column()))
    }

    /// Returns the set of columns used by this ordering.
    pub fn col_set(&self) -> ColumnSet {
        self.columns.iter().map(|c| c.column()).collect()
    }
}

impl Display for OrderingChoice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.columns.iter().join(", "))
    }
}

/// Orderings an expression can produce without extra work.
/// Used to pick inputs for partial sorts.
#[derive(Debug, Clone, Default)]
pub struct InterestingOrderings {
    orderings: Vec<OrderingChoice>,
}

impl InterestingOrderings {
    pub fn new(orderings: Vec<OrderingChoice>) -> Self {
        InterestingOrderings { orderings }
    }

    /// A reference to the orderings.
    pub fn orderings(&self) -> &[OrderingChoice] {
        &self.orderings
    }

    /// Returns the longest common prefix between the required ordering and any
    /// of the interesting orderings. Returns `None` if there is no common
    /// prefix, or if the required ordering is already implied by one of the
    /// interesting orderings (in which case no partial sort is needed).
    pub fn longest_common_prefix(&self, required: &OrderingChoice) -> Option<OrderingChoice> {
        let mut longest = 0;
        for ordering in &self.orderings {
            let len = required.common_prefix_len(ordering);
            if len == required.columns().len() {
                return None;
            }
            longest = longest.max(len);
        }
        if longest == 0 {
            None
        } else {
            Some(OrderingChoice::new(required.columns()[..longest].to_vec()))
        }
    }
}

/// Derives the orderings the given expression can produce cheaply: index
/// orderings for scans and pass-through orderings for operators that do not
/// change the order of rows of their input.
pub fn derive_interesting_orderings(memo: &Memo, catalog: &dyn Catalog, expr: ExprId) -> InterestingOrderings {
    match memo.expr(expr) {
        Expr::Relational(RelExpr::Scan { table, columns }) => {
            let mut orderings = Vec::new();
            for index in catalog.get_indexes(table) {
                if let Some(ordering) = index_ordering(memo, index.columns(), columns) {
                    orderings.push(ordering);
                }
            }
            InterestingOrderings::new(orderings)
        }
        Expr::Relational(RelExpr::IndexScan { ordering, .. }) => InterestingOrderings::new(vec![ordering.clone()]),
        Expr::Relational(RelExpr::Select { input, .. }) => derive_interesting_orderings(memo, catalog, *input),
        Expr::Relational(RelExpr::Project { input, columns }) => {
            let inner = derive_interesting_orderings(memo, catalog, *input);
            let cols: ColumnSet = columns.iter().copied().collect();
            let orderings = inner.orderings.into_iter().filter(|ord| ord.subset_of_cols(&cols)).collect();
            InterestingOrderings::new(orderings)
        }
        Expr::Relational(RelExpr::HashJoin { left, .. }) => derive_interesting_orderings(memo, catalog, *left),
        _ => InterestingOrderings::default(),
    }
}

/// Maps the columns of an index to the column ids produced by a scan.
/// Returns `None` if not even the leading index column is produced by the scan.
pub(crate) fn index_ordering(memo: &Memo, index_columns: &[String], scan_columns: &[ColumnId]) -> Option<OrderingChoice> {
    let metadata = memo.metadata();
    let mut columns = Vec::with_capacity(index_columns.len());
    for name in index_columns {
        let id = scan_columns.iter().find(|id| metadata.get_column(id).name() == name);
        match id {
            Some(id) => columns.push(OrderingColumn::asc(*id)),
            // The scan does not produce the column: the remaining index columns
            // cannot contribute to an ordering prefix.
            None => break,
        }
    }
    if columns.is_empty() {
        None
    } else {
        Some(OrderingChoice::new(columns))
    }
}

/// Returns the ordering actually supplied by the given expression for the
/// required ordering. Relies on the provided orderings of child expressions
/// having been recorded already, so it must be called bottom-up.
pub fn build_provided(memo: &Memo, expr: ExprId, required: &OrderingChoice) -> OrderingChoice {
    if required.is_any() {
        return OrderingChoice::any();
    }
    match memo.expr(expr) {
        Expr::Relational(RelExpr::Sort { .. }) => required.clone(),
        Expr::Relational(RelExpr::IndexScan { ordering, .. }) => ordering.clone(),
        Expr::Relational(RelExpr::Select { input, .. }) | Expr::Relational(RelExpr::Project { input, .. }) => {
            match memo.best_props(*input) {
                Some(best) => best.provided.clone(),
                None => required.clone(),
            }
        }
        _ => required.clone(),
    }
}
