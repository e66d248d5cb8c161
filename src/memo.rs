//! A compact, deduplicated forest of logically equivalent expression groups.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::cost::Cost;
use crate::error::OptimizerError;
use crate::meta::Metadata;
use crate::operators::{format_columns, Expr, RelExpr, ScalarExpr};
use crate::properties::logical::{RelationalProps, ScalarProps};
use crate::properties::physical::PhysicalProps;
use crate::properties::OrderingChoice;

/// A stable handle of an expression stored in a memo.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ExprId(pub usize);

impl Display for ExprId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Uniquely identifies a memo group.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GroupId(pub usize);

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// A handle of an interned required-properties value. Two required-properties
/// values are equal iff their handles are equal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PropsId(usize);

/// Properties of the plan chosen for an expression: the properties that were
/// required of it, the ordering it actually provides, and its cost.
#[derive(Debug, Clone)]
pub struct BestProps {
    pub required: PropsId,
    pub provided: OrderingChoice,
    pub cost: Cost,
}

#[derive(Debug)]
struct MemoNode {
    expr: Expr,
    /// The group a relational expression belongs to. `None` for scalar expressions.
    group: Option<GroupId>,
    /// The next member in the group chain. Always `None` for scalar expressions
    /// and enforcers.
    next: Option<ExprId>,
    scalar_props: Option<ScalarProps>,
    best_props: Option<BestProps>,
}

#[derive(Debug)]
struct MemoGroup {
    first: ExprId,
    last: ExprId,
    props: RelationalProps,
}

/// The memo data structure. Stores expressions in an arena addressed by stable
/// [handles](ExprId). Logically equivalent relational expressions form groups:
/// linked member chains in insertion order. Required physical properties are
/// interned here so they can be compared by identity.
#[derive(Debug, Default)]
pub struct Memo {
    nodes: Vec<MemoNode>,
    groups: Vec<MemoGroup>,
    exprs: HashMap<Expr, ExprId>,
    props: Vec<PhysicalProps>,
    props_index: HashMap<PhysicalProps, PropsId>,
    root: Option<(ExprId, PropsId)>,
    optimized: bool,
    metadata: Metadata,
}

impl Memo {
    /// Creates an empty memo.
    pub fn new() -> Self {
        let mut memo = Memo::default();
        // Empty required properties are used constantly: intern them up front
        // so `none_props` does not need mutable access.
        let id = memo.intern_props(PhysicalProps::none());
        assert_eq!(id, PropsId(0), "empty properties must get the reserved handle");
        memo
    }

    /// Returns the metadata of the query stored in this memo.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Adds a relational expression to this memo, creating a new group for it.
    /// If an equal expression has already been added, returns the existing
    /// handle instead.
    pub fn add_group(&mut self, expr: RelExpr, props: RelationalProps) -> ExprId {
        let expr = Expr::Relational(expr);
        if let Some(id) = self.exprs.get(&expr) {
            return *id;
        }
        let id = ExprId(self.nodes.len());
        let group = GroupId(self.groups.len());
        self.nodes.push(MemoNode {
            expr: expr.clone(),
            group: Some(group),
            next: None,
            scalar_props: None,
            best_props: None,
        });
        self.groups.push(MemoGroup {
            first: id,
            last: id,
            props,
        });
        self.exprs.insert(expr, id);
        log::debug!("memo: new group {} with expression {}", group, id);
        id
    }

    /// Appends a logically equivalent expression to the given group. Returns
    /// `None` if an equal expression is already a member of the group.
    pub fn add_group_member(&mut self, group: GroupId, expr: RelExpr) -> Result<Option<ExprId>, OptimizerError> {
        let expr = Expr::Relational(expr);
        if let Some(existing) = self.exprs.get(&expr) {
            let existing_group = self.nodes[existing.0].group;
            if existing_group == Some(group) {
                return Ok(None);
            }
            return Err(OptimizerError::internal(format!(
                "Expression {} already belongs to group {:?} and cannot be added to group {}",
                existing,
                existing_group,
                group
            )));
        }
        let id = ExprId(self.nodes.len());
        self.nodes.push(MemoNode {
            expr: expr.clone(),
            group: Some(group),
            next: None,
            scalar_props: None,
            best_props: None,
        });
        let last = self.groups[group.0].last;
        self.nodes[last.0].next = Some(id);
        self.groups[group.0].last = id;
        self.exprs.insert(expr, id);
        log::debug!("memo: new member {} in group {}", id, group);
        Ok(Some(id))
    }

    /// Adds a scalar expression to this memo. Expressions without a subquery
    /// carry scalar properties; plain expression lists pass `None`.
    pub fn add_scalar(&mut self, expr: ScalarExpr, props: Option<ScalarProps>) -> ExprId {
        let expr = Expr::Scalar(expr);
        if let Some(id) = self.exprs.get(&expr) {
            return *id;
        }
        let id = ExprId(self.nodes.len());
        self.nodes.push(MemoNode {
            expr: expr.clone(),
            group: None,
            next: None,
            scalar_props: props,
            best_props: None,
        });
        self.exprs.insert(expr, id);
        id
    }

    /// Adds an enforcer expression. The enforcer shares the relational
    /// properties of the given group but is never linked into the member
    /// chain: the member loop and the final plan walk must not see the
    /// enforcer as an alternative of its own input group.
    pub fn add_enforcer(&mut self, expr: RelExpr, group: GroupId) -> ExprId {
        let expr = Expr::Relational(expr);
        if let Some(id) = self.exprs.get(&expr) {
            return *id;
        }
        let id = ExprId(self.nodes.len());
        self.nodes.push(MemoNode {
            expr: expr.clone(),
            group: Some(group),
            next: None,
            scalar_props: None,
            best_props: None,
        });
        self.exprs.insert(expr, id);
        id
    }

    /// Returns the expression stored under the given handle.
    ///
    /// # Panics
    ///
    /// This method panics if the handle is unknown.
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.node(id).expr
    }

    /// Returns scalar properties of the given expression, if it carries any.
    pub fn scalar_props(&self, id: ExprId) -> Option<&ScalarProps> {
        self.node(id).scalar_props.as_ref()
    }

    /// Returns the group the given relational expression belongs to.
    ///
    /// # Panics
    ///
    /// This method panics if the expression is scalar.
    pub fn group_of(&self, id: ExprId) -> GroupId {
        self.node(id)
            .group
            .unwrap_or_else(|| panic!("Expression {} does not belong to a group", id))
    }

    /// The first member of the given group.
    pub fn first_expr(&self, group: GroupId) -> ExprId {
        self.groups[group.0].first
    }

    /// The member that follows the given one in its group chain.
    pub fn next_expr(&self, id: ExprId) -> Option<ExprId> {
        self.node(id).next
    }

    /// Returns an iterator over the members of the given group, in insertion order.
    pub fn group_members(&self, group: GroupId) -> MemberIter<'_> {
        MemberIter {
            memo: self,
            next: Some(self.first_expr(group)),
        }
    }

    /// Returns relational properties of the given group.
    pub fn group_props(&self, group: GroupId) -> &RelationalProps {
        &self.groups[group.0].props
    }

    /// Returns relational properties of the group the given expression belongs to.
    pub fn rel_props(&self, id: ExprId) -> &RelationalProps {
        self.group_props(self.group_of(id))
    }

    /// Interns the given required properties and returns their handle.
    pub fn intern_props(&mut self, props: PhysicalProps) -> PropsId {
        match self.props_index.entry(props) {
            Entry::Occupied(o) => *o.get(),
            Entry::Vacant(v) => {
                let id = PropsId(self.props.len());
                self.props.push(v.key().clone());
                v.insert(id);
                id
            }
        }
    }

    /// Returns the required properties stored under the given handle.
    pub fn props(&self, id: PropsId) -> &PhysicalProps {
        &self.props[id.0]
    }

    /// Returns the handle of the empty required properties.
    pub fn none_props(&self) -> PropsId {
        PropsId(0)
    }

    /// Sets the root expression of this memo and the properties required of it.
    pub fn set_root(&mut self, expr: ExprId, props: PropsId) {
        self.root = Some((expr, props));
    }

    /// The root expression and its required properties.
    pub fn root(&self) -> Option<(ExprId, PropsId)> {
        self.root
    }

    /// Returns `true` if this memo has been optimized.
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub(crate) fn mark_optimized(&mut self) {
        self.optimized = true;
    }

    /// Records the plan chosen for the given expression. Recording the same
    /// values again is a no-op; recording different values is an error.
    pub fn set_best_props(
        &mut self,
        expr: ExprId,
        required: PropsId,
        provided: OrderingChoice,
        cost: Cost,
    ) -> Result<(), OptimizerError> {
        let node = self.node_mut(expr);
        match &node.best_props {
            Some(best) if best.required == required && best.provided == provided && best.cost == cost => Ok(()),
            Some(best) => Err(OptimizerError::internal(format!(
                "Best properties of expression {} are already set: {:?}",
                expr, best
            ))),
            None => {
                node.best_props = Some(BestProps {
                    required,
                    provided,
                    cost,
                });
                Ok(())
            }
        }
    }

    /// Returns the recorded best properties of the given expression.
    pub fn best_props(&self, expr: ExprId) -> Option<&BestProps> {
        self.node(expr).best_props.as_ref()
    }

    /// Overwrites the recorded cost of the given expression.
    pub fn reset_cost(&mut self, expr: ExprId, cost: Cost) -> Result<(), OptimizerError> {
        let node = self.node_mut(expr);
        match node.best_props.as_mut() {
            Some(best) => {
                best.cost = cost;
                Ok(())
            }
            None => Err(OptimizerError::internal(format!(
                "Cannot reset the cost of expression {}: no best properties",
                expr
            ))),
        }
    }

    /// Replaces the `i`-th child of the given expression. Used when the memo
    /// is rewritten to point at the lowest cost plan.
    pub fn set_child(&mut self, expr: ExprId, i: usize, child: ExprId) {
        self.node_mut(expr).expr.set_child(i, child);
    }

    /// The total number of expressions stored in this memo.
    pub fn num_exprs(&self) -> usize {
        self.nodes.len()
    }

    /// The total number of groups in this memo.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn node(&self, id: ExprId) -> &MemoNode {
        self.nodes.get(id.0).unwrap_or_else(|| panic!("Unknown expression id: {}", id))
    }

    fn node_mut(&mut self, id: ExprId) -> &mut MemoNode {
        self.nodes.get_mut(id.0).unwrap_or_else(|| panic!("Unknown expression id: {}", id))
    }
}

/// An iterator over the members of a group.
pub struct MemberIter<'a> {
    memo: &'a Memo,
    next: Option<ExprId>,
}

impl Iterator for MemberIter<'_> {
    type Item = ExprId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.memo.next_expr(current);
        Some(current)
    }
}

/// Builds a string representation of the memo for testing and debugging.
pub fn format_memo(memo: &Memo) -> String {
    use itertools::Itertools;
    let mut buf = String::new();
    for group in (0..memo.num_groups()).map(GroupId) {
        let members = memo.group_members(group).map(|m| format!("{} {}", m, memo.expr(m).name())).join(", ");
        buf.push_str(&format!("G{}: {}\n", group, members));
    }
    buf
}

/// Builds a string representation of the plan rooted at the given expression.
/// Child expressions are indented under their parent.
pub fn format_plan(memo: &Memo, root: ExprId) -> String {
    let mut buf = String::new();
    format_expr(memo, root, 0, &mut buf);
    buf.trim_end().to_string()
}

fn format_expr(memo: &Memo, id: ExprId, depth: usize, buf: &mut String) {
    let pad = "  ".repeat(depth);
    match memo.expr(id) {
        Expr::Relational(rel) => {
            let line = match rel {
                RelExpr::Scan { table, columns } => format!("Scan {} cols={}", table, format_columns(columns)),
                RelExpr::IndexScan {
                    table,
                    index,
                    columns,
                    ordering,
                } => format!("IndexScan {}.{} cols={} {}", table, index, format_columns(columns), ordering),
                RelExpr::Select { .. } => "Select".to_string(),
                RelExpr::Project { columns, .. } => format!("Project cols={}", format_columns(columns)),
                RelExpr::HashJoin { .. } => "HashJoin".to_string(),
                RelExpr::Sort { input_ordering, .. } => {
                    let mut line = "Sort".to_string();
                    if let Some(best) = memo.best_props(id) {
                        line.push_str(&format!(" {}", memo.props(best.required).ordering()));
                    }
                    if !input_ordering.is_any() {
                        line.push_str(&format!(" input={}", input_ordering));
                    }
                    line
                }
            };
            buf.push_str(&format!("{}{}\n", pad, line));
            let expr = memo.expr(id);
            for i in 0..expr.child_count() {
                format_expr(memo, expr.child(i), depth + 1, buf);
            }
        }
        Expr::Scalar(_) => {
            buf.push_str(&format!("{}{}\n", pad, format_scalar(memo, id)));
            let mut subqueries = Vec::new();
            collect_subqueries(memo, id, &mut subqueries);
            for subquery in subqueries {
                format_expr(memo, subquery, depth + 1, buf);
            }
        }
    }
}

fn format_scalar(memo: &Memo, id: ExprId) -> String {
    use itertools::Itertools;
    match memo.expr(id) {
        Expr::Scalar(scalar) => match scalar {
            ScalarExpr::Column(id) => format!("col:{}", id),
            ScalarExpr::Scalar(value) => format!("{}", value),
            ScalarExpr::BinaryExpr { lhs, op, rhs } => {
                format!("{} {} {}", format_scalar(memo, *lhs), op, format_scalar(memo, *rhs))
            }
            ScalarExpr::SubQuery(_) => "SubQuery".to_string(),
            ScalarExpr::ExprList(exprs) => exprs.iter().map(|e| format_scalar(memo, *e)).join(" AND "),
        },
        Expr::Relational(_) => panic!("Expected a scalar expression: {}", id),
    }
}

fn collect_subqueries(memo: &Memo, id: ExprId, out: &mut Vec<ExprId>) {
    match memo.expr(id) {
        Expr::Scalar(ScalarExpr::SubQuery(input)) => out.push(*input),
        Expr::Scalar(_) => {
            let expr = memo.expr(id);
            for i in 0..expr.child_count() {
                collect_subqueries(memo, expr.child(i), out);
            }
        }
        Expr::Relational(_) => {}
    }
}

#[cfg(test)]
mod test {
    use crate::memo::Memo;
    use crate::meta::ColumnId;
    use crate::operators::RelExpr;
    use crate::properties::logical::RelationalProps;
    use crate::properties::physical::PhysicalProps;
    use crate::properties::{OrderingChoice, OrderingColumn};

    fn scan(table: &str) -> RelExpr {
        RelExpr::Scan {
            table: table.into(),
            columns: vec![ColumnId(1)],
        }
    }

    #[test]
    fn add_group_deduplicates() {
        let mut memo = Memo::new();
        let id1 = memo.add_group(scan("a"), RelationalProps::default());
        let id2 = memo.add_group(scan("a"), RelationalProps::default());

        assert_eq!(id1, id2, "same fingerprint");
        assert_eq!(memo.num_groups(), 1, "one group");
    }

    #[test]
    fn members_are_iterated_in_insertion_order() {
        let mut memo = Memo::new();
        let first = memo.add_group(scan("a"), RelationalProps::default());
        let group = memo.group_of(first);

        let second = memo.add_group_member(group, scan("b")).unwrap().expect("new member");
        let third = memo.add_group_member(group, scan("c")).unwrap().expect("new member");

        let members: Vec<_> = memo.group_members(group).collect();
        assert_eq!(members, vec![first, second, third], "insertion order");
    }

    #[test]
    fn add_group_member_deduplicates_within_group() {
        let mut memo = Memo::new();
        let first = memo.add_group(scan("a"), RelationalProps::default());
        let group = memo.group_of(first);

        let duplicate = memo.add_group_member(group, scan("a")).unwrap();
        assert_eq!(duplicate, None, "duplicate member");
        assert_eq!(memo.group_members(group).count(), 1, "one member");
    }

    #[test]
    fn add_group_member_rejects_cross_group_fingerprints() {
        let mut memo = Memo::new();
        let a = memo.add_group(scan("a"), RelationalProps::default());
        let b = memo.add_group(scan("b"), RelationalProps::default());
        let group_b = memo.group_of(b);
        assert_ne!(memo.group_of(a), group_b, "different groups");

        let res = memo.add_group_member(group_b, scan("a"));
        assert!(res.is_err(), "same fingerprint cannot map to different groups");
    }

    #[test]
    fn enforcers_are_not_members() {
        let mut memo = Memo::new();
        let first = memo.add_group(scan("a"), RelationalProps::default());
        let group = memo.group_of(first);

        let ordering = OrderingChoice::new(vec![OrderingColumn::asc(ColumnId(1))]);
        let enforcer = memo.add_enforcer(
            RelExpr::Sort {
                input: first,
                input_ordering: ordering,
            },
            group,
        );

        assert_eq!(memo.group_of(enforcer), group, "enforcer shares the group");
        assert_eq!(memo.group_members(group).count(), 1, "enforcer is not a member");
    }

    #[test]
    fn props_are_interned_by_identity() {
        let mut memo = Memo::new();
        let ordering = OrderingChoice::new(vec![OrderingColumn::asc(ColumnId(1))]);

        let props1 = memo.intern_props(PhysicalProps::from_ordering(ordering.clone()));
        let props2 = memo.intern_props(PhysicalProps::from_ordering(ordering));
        let none = memo.intern_props(PhysicalProps::none());

        assert_eq!(props1, props2, "equal values intern to the same handle");
        assert_eq!(none, memo.none_props(), "empty properties are pre-interned");
    }
}
