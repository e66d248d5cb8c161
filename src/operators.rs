//! Relational and scalar operators.

use itertools::Itertools;
use std::fmt::{Display, Formatter};

use crate::memo::ExprId;
use crate::meta::ColumnId;
use crate::properties::OrderingChoice;

/// A relational expression. Produces a multiset of tuples. Child expressions
/// are referenced by [expression handles](ExprId) stored in the memo.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RelExpr {
    /// Full scan of a table.
    Scan { table: String, columns: Vec<ColumnId> },
    /// Scan of a table through a secondary index. Produces rows sorted by the
    /// index columns.
    IndexScan {
        table: String,
        index: String,
        columns: Vec<ColumnId>,
        ordering: OrderingChoice,
    },
    /// Filters rows of the input expression.
    Select { input: ExprId, filter: ExprId },
    /// Restricts the input expression to the given columns.
    Project { input: ExprId, columns: Vec<ColumnId> },
    /// Joins two expressions by building a hash table from the left input.
    HashJoin {
        left: ExprId,
        right: ExprId,
        condition: ExprId,
    },
    /// Sort enforcer. Produces the ordering required of it by the optimization
    /// context. `input_ordering` is the part of that ordering the input is
    /// required to provide: empty for a full sort, a proper prefix for a
    /// partial sort.
    Sort {
        input: ExprId,
        input_ordering: OrderingChoice,
    },
}

/// A scalar expression. Computes a value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ScalarExpr {
    /// A reference to a column.
    Column(ColumnId),
    /// A literal value.
    Scalar(ScalarValue),
    /// A binary expression.
    BinaryExpr { lhs: ExprId, op: BinaryOp, rhs: ExprId },
    /// A relational subquery used as a value.
    SubQuery(ExprId),
    /// A conjunction of scalar expressions. Carries no cached scalar
    /// properties; its children are inspected directly.
    ExprList(Vec<ExprId>),
}

/// Supported binary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Eq,
    Gt,
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "="),
            BinaryOp::Gt => write!(f, ">"),
        }
    }
}

/// Supported literal values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ScalarValue {
    Int32(i32),
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Int32(value) => write!(f, "{}", value),
        }
    }
}

/// An expression stored in the memo: either relational or scalar.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Expr {
    Relational(RelExpr),
    Scalar(ScalarExpr),
}

impl Expr {
    /// Returns `true` if this is a relational expression.
    pub fn is_relational(&self) -> bool {
        matches!(self, Expr::Relational(_))
    }

    /// Returns `true` if this is a scalar expression.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Expr::Scalar(_))
    }

    /// Returns the relational expression.
    ///
    /// # Panics
    ///
    /// This method panics if this expression is not relational.
    pub fn relational(&self) -> &RelExpr {
        match self {
            Expr::Relational(rel) => rel,
            Expr::Scalar(scalar) => panic!("Expected a relational expression but got: {:?}", scalar),
        }
    }

    /// The number of child expressions.
    pub fn child_count(&self) -> usize {
        match self {
            Expr::Relational(rel) => match rel {
                RelExpr::Scan { .. } | RelExpr::IndexScan { .. } => 0,
                RelExpr::Select { .. } => 2,
                RelExpr::Project { .. } | RelExpr::Sort { .. } => 1,
                RelExpr::HashJoin { .. } => 3,
            },
            Expr::Scalar(scalar) => match scalar {
                ScalarExpr::Column(_) | ScalarExpr::Scalar(_) => 0,
                ScalarExpr::BinaryExpr { .. } => 2,
                ScalarExpr::SubQuery(_) => 1,
                ScalarExpr::ExprList(exprs) => exprs.len(),
            },
        }
    }

    /// Returns the `i`-th child expression.
    ///
    /// # Panics
    ///
    /// This method panics if `i` is out of bounds.
    pub fn child(&self, i: usize) -> ExprId {
        let child = match self {
            Expr::Relational(rel) => match (rel, i) {
                (RelExpr::Select { input, .. }, 0) => Some(*input),
                (RelExpr::Select { filter, .. }, 1) => Some(*filter),
                (RelExpr::Project { input, .. }, 0) => Some(*input),
                (RelExpr::Sort { input, .. }, 0) => Some(*input),
                (RelExpr::HashJoin { left, .. }, 0) => Some(*left),
                (RelExpr::HashJoin { right, .. }, 1) => Some(*right),
                (RelExpr::HashJoin { condition, .. }, 2) => Some(*condition),
                _ => None,
            },
            Expr::Scalar(scalar) => match (scalar, i) {
                (ScalarExpr::BinaryExpr { lhs, .. }, 0) => Some(*lhs),
                (ScalarExpr::BinaryExpr { rhs, .. }, 1) => Some(*rhs),
                (ScalarExpr::SubQuery(input), 0) => Some(*input),
                (ScalarExpr::ExprList(exprs), _) => exprs.get(i).copied(),
                _ => None,
            },
        };
        child.unwrap_or_else(|| panic!("No child expression {} in {:?}", i, self))
    }

    /// Replaces the `i`-th child expression. Used when the memo is rewritten
    /// to point at the lowest cost plan.
    ///
    /// # Panics
    ///
    /// This method panics if `i` is out of bounds.
    pub fn set_child(&mut self, i: usize, child: ExprId) {
        let slot = match self {
            Expr::Relational(rel) => match (rel, i) {
                (RelExpr::Select { input, .. }, 0) => Some(input),
                (RelExpr::Select { filter, .. }, 1) => Some(filter),
                (RelExpr::Project { input, .. }, 0) => Some(input),
                (RelExpr::Sort { input, .. }, 0) => Some(input),
                (RelExpr::HashJoin { left, .. }, 0) => Some(left),
                (RelExpr::HashJoin { right, .. }, 1) => Some(right),
                (RelExpr::HashJoin { condition, .. }, 2) => Some(condition),
                _ => None,
            },
            Expr::Scalar(scalar) => match (scalar, i) {
                (ScalarExpr::BinaryExpr { lhs, .. }, 0) => Some(lhs),
                (ScalarExpr::BinaryExpr { rhs, .. }, 1) => Some(rhs),
                (ScalarExpr::SubQuery(input), 0) => Some(input),
                (ScalarExpr::ExprList(exprs), _) => exprs.get_mut(i),
                _ => None,
            },
        };
        match slot {
            Some(slot) => *slot = child,
            None => panic!("No child expression {}", i),
        }
    }

    /// A short name of the operator, for logs and plan formatting.
    pub fn name(&self) -> &'static str {
        match self {
            Expr::Relational(rel) => match rel {
                RelExpr::Scan { .. } => "Scan",
                RelExpr::IndexScan { .. } => "IndexScan",
                RelExpr::Select { .. } => "Select",
                RelExpr::Project { .. } => "Project",
                RelExpr::HashJoin { .. } => "HashJoin",
                RelExpr::Sort { .. } => "Sort",
            },
            Expr::Scalar(scalar) => match scalar {
                ScalarExpr::Column(_) => "Column",
                ScalarExpr::Scalar(_) => "Scalar",
                ScalarExpr::BinaryExpr { .. } => "BinaryExpr",
                ScalarExpr::SubQuery(_) => "SubQuery",
                ScalarExpr::ExprList(_) => "ExprList",
            },
        }
    }
}

impl From<RelExpr> for Expr {
    fn from(expr: RelExpr) -> Self {
        Expr::Relational(expr)
    }
}

impl From<ScalarExpr> for Expr {
    fn from(expr: ScalarExpr) -> Self {
        Expr::Scalar(expr)
    }
}

/// Formats the columns of a scan or a projection.
pub(crate) fn format_columns(columns: &[ColumnId]) -> String {
    format!("[{}]", columns.iter().join(", "))
}
