//! Physical properties required from an operator.

use itertools::Itertools;
use std::fmt::{Display, Formatter};

use crate::memo::{ExprId, Memo, PropsId};
use crate::meta::{ColumnId, ColumnSet};
use crate::operators::{Expr, RelExpr};
use crate::properties::OrderingChoice;

/// The required output column layout.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Presentation {
    columns: Vec<ColumnId>,
}

impl Presentation {
    /// Creates a presentation with the given columns.
    pub fn new(columns: Vec<ColumnId>) -> Self {
        Presentation { columns }
    }

    /// The columns of this presentation.
    pub fn columns(&self) -> &[ColumnId] {
        &self.columns
    }
}

impl Display for Presentation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.columns.iter().join(", "))
    }
}

/// Physical properties required from an operator: a possibly empty column
/// ordering and an optional output column layout. Required properties are
/// interned by the memo and compared by identity (see [Memo::intern_props]).
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct PhysicalProps {
    ordering: OrderingChoice,
    presentation: Option<Presentation>,
}

impl PhysicalProps {
    /// Returns physical properties that place no requirements on an operator.
    pub fn none() -> Self {
        PhysicalProps::default()
    }

    /// Creates physical properties with the given ordering and presentation.
    pub fn new(ordering: OrderingChoice, presentation: Option<Presentation>) -> Self {
        PhysicalProps { ordering, presentation }
    }

    /// Creates physical properties that only require the given ordering.
    pub fn from_ordering(ordering: OrderingChoice) -> Self {
        PhysicalProps {
            ordering,
            presentation: None,
        }
    }

    /// Returns `true` if these properties place no requirements on an operator.
    pub fn is_empty(&self) -> bool {
        self.ordering.is_any() && self.presentation.is_none()
    }

    /// The required ordering.
    pub fn ordering(&self) -> &OrderingChoice {
        &self.ordering
    }

    /// A mutable reference to the required ordering.
    pub fn ordering_mut(&mut self) -> &mut OrderingChoice {
        &mut self.ordering
    }

    /// The required output column layout.
    pub fn presentation(&self) -> Option<&Presentation> {
        self.presentation.as_ref()
    }

    /// Returns the set of columns used by the ordering and the presentation.
    pub fn col_set(&self) -> ColumnSet {
        let mut cols = self.ordering.col_set();
        if let Some(presentation) = &self.presentation {
            for id in presentation.columns() {
                cols.insert(*id);
            }
        }
        cols
    }
}

impl Display for PhysicalProps {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        if !self.ordering.is_any() {
            write!(f, " ordering: {}", self.ordering)?;
        }
        if let Some(presentation) = &self.presentation {
            write!(f, " presentation: {}", presentation)?;
        }
        write!(f, " }}")
    }
}

/// Returns `true` if the given expression can provide the required physical
/// properties without the help of an enforcer. A presentation can be provided
/// by any operator, so only the ordering matters.
pub fn can_provide_physical_props(memo: &Memo, expr: ExprId, required: &PhysicalProps) -> bool {
    if required.ordering().is_any() {
        return true;
    }
    match memo.expr(expr) {
        Expr::Relational(rel) => match rel {
            // A sort produces whatever ordering is asked of it.
            RelExpr::Sort { .. } => true,
            RelExpr::IndexScan { ordering, .. } => required.ordering().prefix_of(ordering),
            // Selection does not disturb the order of its input rows.
            RelExpr::Select { .. } => true,
            RelExpr::Project { columns, .. } => {
                let cols: ColumnSet = columns.iter().copied().collect();
                required.ordering().subset_of_cols(&cols)
            }
            RelExpr::Scan { .. } | RelExpr::HashJoin { .. } => false,
        },
        Expr::Scalar(_) => false,
    }
}

/// Given the properties required of a parent expression, returns the properties
/// required of its `child_idx`-th child. Presentation is a root-only concern
/// and is never passed down.
pub fn build_child_physical_props(memo: &mut Memo, parent: ExprId, child_idx: usize, parent_props: PropsId) -> PropsId {
    let required_ordering = memo.props(parent_props).ordering().clone();
    let child_props = match memo.expr(parent) {
        Expr::Relational(rel) => match rel {
            // A sort asks its input for the part of the ordering it does not
            // produce itself: nothing for a full sort, the common prefix for a
            // partial sort.
            RelExpr::Sort { input_ordering, .. } => PhysicalProps::from_ordering(input_ordering.clone()),
            RelExpr::Select { .. } if child_idx == 0 => PhysicalProps::from_ordering(required_ordering),
            RelExpr::Project { .. } if child_idx == 0 => PhysicalProps::from_ordering(required_ordering),
            _ => PhysicalProps::none(),
        },
        Expr::Scalar(_) => PhysicalProps::none(),
    };
    memo.intern_props(child_props)
}

/// Returns the properties required of the `child_idx`-th child of a scalar
/// expression. Scalar expressions never require anything from their children.
pub fn build_child_physical_props_scalar(memo: &Memo, _parent: ExprId, _child_idx: usize) -> PropsId {
    memo.none_props()
}

#[cfg(test)]
mod test {
    use crate::meta::ColumnId;
    use crate::properties::physical::{PhysicalProps, Presentation};
    use crate::properties::{OrderingChoice, OrderingColumn};

    #[test]
    fn none_props_are_empty() {
        let props = PhysicalProps::none();
        assert!(props.is_empty(), "empty");
        assert!(props.ordering().is_any(), "no ordering");
        assert!(props.presentation().is_none(), "no presentation");
    }

    #[test]
    fn col_set_combines_ordering_and_presentation() {
        let ordering = OrderingChoice::new(vec![OrderingColumn::asc(ColumnId(2))]);
        let presentation = Presentation::new(vec![ColumnId(1), ColumnId(2)]);
        let props = PhysicalProps::new(ordering, Some(presentation));

        let cols = props.col_set();
        assert!(cols.contains(ColumnId(1)), "presentation column");
        assert!(cols.contains(ColumnId(2)), "ordering column");
        assert_eq!(cols.len(), 2, "no duplicates");
    }

    #[test]
    fn display() {
        let ordering = OrderingChoice::new(vec![OrderingColumn::desc(ColumnId(1))]);
        let props = PhysicalProps::from_ordering(ordering);
        assert_eq!(format!("{}", props), "{ ordering: [-1] }");
        assert_eq!(format!("{}", PhysicalProps::none()), "{ }");
    }
}
