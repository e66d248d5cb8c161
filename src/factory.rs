//! The expression factory. Builds the initial canonical expression tree into
//! the memo and derives the properties of every expression it constructs.

use std::rc::Rc;

use crate::catalog::CatalogRef;
use crate::error::OptimizerError;
use crate::memo::{ExprId, Memo, PropsId};
use crate::meta::{ColumnId, ColumnSet};
use crate::operators::{BinaryOp, Expr, RelExpr, ScalarExpr, ScalarValue};
use crate::properties::logical::{FuncDeps, RelationalProps, ScalarProps};
use crate::properties::physical::PhysicalProps;
use crate::rules::{AppliedRuleFn, MatchedRuleFn, RuleName};
use crate::statistics::Statistics;

/// The portion of input rows assumed to pass a filter.
const SELECT_SELECTIVITY: f64 = 0.1;

/// The portion of the cross product assumed to pass a join condition.
const JOIN_SELECTIVITY: f64 = 0.1;

/// The number of rows assumed for a table without statistics.
const UNKNOWN_TABLE_ROW_COUNT: usize = 1000;

/// Constructs expressions in the memo. Columns referenced by the expressions
/// are registered in the memo metadata, so every constructed scan gets its own
/// column identifiers.
///
/// The factory tracks the depth of nested constructor calls. After
/// optimization completes the depth must be zero; anything else means a
/// normalization rewrite exited a constructor abnormally.
pub struct Factory {
    memo: Memo,
    catalog: CatalogRef,
    depth: usize,
    matched_rule: Option<Rc<MatchedRuleFn>>,
    applied_rule: Option<Rc<AppliedRuleFn>>,
}

impl Factory {
    /// Creates a factory that builds expressions into a new, blank memo.
    pub fn new(catalog: CatalogRef) -> Self {
        Factory {
            memo: Memo::new(),
            catalog,
            depth: 0,
            matched_rule: None,
            applied_rule: None,
        }
    }

    /// The memo this factory builds expressions into.
    pub fn memo(&self) -> &Memo {
        &self.memo
    }

    pub fn memo_mut(&mut self) -> &mut Memo {
        &mut self.memo
    }

    /// Extracts the memo from this factory, leaving a blank one in its place.
    pub fn detach_memo(&mut self) -> Memo {
        self.depth = 0;
        std::mem::replace(&mut self.memo, Memo::new())
    }

    /// Sets the callback invoked each time a rule has been matched.
    /// When absent, all rules are applied.
    pub fn notify_on_matched_rule(&mut self, callback: Option<Rc<MatchedRuleFn>>) {
        self.matched_rule = callback;
    }

    /// Sets the callback invoked each time a rule has been applied.
    pub fn notify_on_applied_rule(&mut self, callback: Option<Rc<AppliedRuleFn>>) {
        self.applied_rule = callback;
    }

    /// Verifies that every constructor call has returned.
    pub fn check_constructor_stack_depth(&self) -> Result<(), OptimizerError> {
        if self.depth != 0 {
            return Err(OptimizerError::UnbalancedFactory(self.depth));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_constructor_stack_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Returns the identifier of a column registered for the given table.
    pub fn find_column(&self, table: &str, name: &str) -> Option<ColumnId> {
        self.memo.metadata().find_column(table, name)
    }

    /// Constructs a scan of all columns of the given table.
    pub fn scan(&mut self, table: &str) -> Result<ExprId, OptimizerError> {
        self.in_constructor(|f| {
            let table_def = f
                .catalog
                .get_table(table)
                .ok_or_else(|| OptimizerError::argument(format!("Table does not exist: {}", table)))?;
            let columns: Vec<ColumnId> = table_def
                .columns()
                .iter()
                .map(|c| f.memo.metadata_mut().add_column(c.name(), Some(table.into())))
                .collect();
            let row_count = table_def
                .statistics()
                .and_then(|s| s.row_count())
                .unwrap_or(UNKNOWN_TABLE_ROW_COUNT);

            let props = RelationalProps {
                output_columns: columns.iter().copied().collect(),
                statistics: Some(Statistics::from_row_count(row_count as f64)),
                ..RelationalProps::default()
            };
            Ok(f.memo.add_group(
                RelExpr::Scan {
                    table: table.into(),
                    columns,
                },
                props,
            ))
        })
    }

    /// Constructs a selection. A selection without a filter is normalized away
    /// by the `EliminateSelect` rule, subject to the matched-rule callback.
    pub fn select(&mut self, input: ExprId, filter: Option<ExprId>) -> Result<ExprId, OptimizerError> {
        self.in_constructor(|f| {
            if !f.memo.expr(input).is_relational() {
                return Err(OptimizerError::argument("Select input must be a relational expression"));
            }
            let filter = match filter {
                Some(filter) => {
                    if !f.memo.expr(filter).is_scalar() {
                        return Err(OptimizerError::argument("Select filter must be a scalar expression"));
                    }
                    filter
                }
                None => {
                    // [EliminateSelect]
                    if f.rule_matched(RuleName::EliminateSelect) {
                        f.rule_applied(RuleName::EliminateSelect, None, input);
                        return Ok(input);
                    }
                    f.memo.add_scalar(ScalarExpr::ExprList(Vec::new()), None)
                }
            };

            let input_props = f.memo.rel_props(input);
            let mut outer_columns = scalar_outer_refs(&f.memo, filter);
            outer_columns.subtract(&input_props.output_columns);
            outer_columns.union_with(&input_props.outer_columns);

            let mut func_deps = input_props.func_deps.clone();
            collect_constant_columns(&f.memo, filter, &mut func_deps);

            let row_count = input_props.statistics().map(|s| s.row_count()).unwrap_or(0.0);
            let props = RelationalProps {
                output_columns: input_props.output_columns.clone(),
                outer_columns,
                func_deps,
                statistics: Some(Statistics::new(row_count * SELECT_SELECTIVITY, SELECT_SELECTIVITY)),
            };
            Ok(f.memo.add_group(RelExpr::Select { input, filter }, props))
        })
    }

    /// Constructs a projection restricted to the given columns.
    pub fn project(&mut self, input: ExprId, columns: Vec<ColumnId>) -> Result<ExprId, OptimizerError> {
        self.in_constructor(|f| {
            let input_props = f.memo.rel_props(input);
            let output_columns: ColumnSet = columns.iter().copied().collect();
            if !output_columns.is_subset(&input_props.output_columns) {
                return Err(OptimizerError::argument(format!(
                    "Projection columns {} must be a subset of the input columns {}",
                    output_columns, input_props.output_columns
                )));
            }
            let props = RelationalProps {
                output_columns,
                outer_columns: input_props.outer_columns.clone(),
                func_deps: input_props.func_deps.clone(),
                statistics: input_props.statistics.clone(),
            };
            Ok(f.memo.add_group(RelExpr::Project { input, columns }, props))
        })
    }

    /// Constructs a join of two expressions.
    pub fn join(&mut self, left: ExprId, right: ExprId, condition: ExprId) -> Result<ExprId, OptimizerError> {
        self.in_constructor(|f| {
            let left_props = f.memo.rel_props(left);
            let right_props = f.memo.rel_props(right);

            let mut output_columns = left_props.output_columns.clone();
            output_columns.union_with(&right_props.output_columns);

            let mut outer_columns = scalar_outer_refs(&f.memo, condition);
            outer_columns.subtract(&output_columns);
            outer_columns.union_with(&left_props.outer_columns);
            outer_columns.union_with(&right_props.outer_columns);

            let mut func_deps = left_props.func_deps.clone();
            func_deps.union_with(&right_props.func_deps);

            let left_rows = left_props.statistics().map(|s| s.row_count()).unwrap_or(0.0);
            let right_rows = right_props.statistics().map(|s| s.row_count()).unwrap_or(0.0);
            let props = RelationalProps {
                output_columns,
                outer_columns,
                func_deps,
                statistics: Some(Statistics::from_row_count(left_rows * right_rows * JOIN_SELECTIVITY)),
            };
            Ok(f.memo.add_group(
                RelExpr::HashJoin {
                    left,
                    right,
                    condition,
                },
                props,
            ))
        })
    }

    /// Constructs a column reference.
    pub fn column(&mut self, id: ColumnId) -> ExprId {
        self.memo.add_scalar(ScalarExpr::Column(id), Some(ScalarProps { has_subquery: false }))
    }

    /// Constructs an integer literal.
    pub fn scalar(&mut self, value: i32) -> ExprId {
        self.memo.add_scalar(ScalarExpr::Scalar(ScalarValue::Int32(value)), Some(ScalarProps { has_subquery: false }))
    }

    /// Constructs a binary expression.
    pub fn binary_expr(&mut self, lhs: ExprId, op: BinaryOp, rhs: ExprId) -> Result<ExprId, OptimizerError> {
        if !self.memo.expr(lhs).is_scalar() || !self.memo.expr(rhs).is_scalar() {
            return Err(OptimizerError::argument("Binary expression operands must be scalar expressions"));
        }
        let has_subquery = scalar_has_subquery(&self.memo, lhs) || scalar_has_subquery(&self.memo, rhs);
        Ok(self.memo.add_scalar(ScalarExpr::BinaryExpr { lhs, op, rhs }, Some(ScalarProps { has_subquery })))
    }

    /// A shorthand that constructs a `column = value` filter.
    pub fn eq_int(&mut self, column: ColumnId, value: i32) -> Result<ExprId, OptimizerError> {
        let lhs = self.column(column);
        let rhs = self.scalar(value);
        self.binary_expr(lhs, BinaryOp::Eq, rhs)
    }

    /// Constructs a scalar subquery over the given relational expression.
    pub fn subquery(&mut self, input: ExprId) -> Result<ExprId, OptimizerError> {
        if !self.memo.expr(input).is_relational() {
            return Err(OptimizerError::argument("Subquery input must be a relational expression"));
        }
        Ok(self.memo.add_scalar(ScalarExpr::SubQuery(input), Some(ScalarProps { has_subquery: true })))
    }

    /// Constructs a conjunction of scalar expressions.
    pub fn expr_list(&mut self, exprs: Vec<ExprId>) -> Result<ExprId, OptimizerError> {
        if exprs.iter().any(|e| !self.memo.expr(*e).is_scalar()) {
            return Err(OptimizerError::argument("Expression list items must be scalar expressions"));
        }
        Ok(self.memo.add_scalar(ScalarExpr::ExprList(exprs), None))
    }

    /// Sets the root of the memo and the properties required of it.
    pub fn set_root(&mut self, expr: ExprId, props: PhysicalProps) -> PropsId {
        let props = self.memo.intern_props(props);
        self.memo.set_root(expr, props);
        props
    }

    /// Custom functions exposed to root-level rewrites.
    pub fn custom_funcs(&mut self) -> CustomFuncs<'_> {
        CustomFuncs { factory: self }
    }

    fn in_constructor<R>(
        &mut self,
        build: impl FnOnce(&mut Factory) -> Result<R, OptimizerError>,
    ) -> Result<R, OptimizerError> {
        self.depth += 1;
        let result = build(self);
        if result.is_ok() {
            self.depth -= 1;
        }
        result
    }

    fn rule_matched(&self, rule: RuleName) -> bool {
        self.matched_rule.as_ref().map_or(true, |f| f(rule))
    }

    fn rule_applied(&self, rule: RuleName, source: Option<ExprId>, target: ExprId) {
        if let Some(f) = self.applied_rule.as_ref() {
            f(rule, source, target)
        }
    }
}

/// Custom functions used by root-level rewrites.
pub struct CustomFuncs<'a> {
    factory: &'a mut Factory,
}

impl CustomFuncs<'_> {
    /// Returns `true` if the given expression can be replaced by a variant
    /// restricted to the needed columns. An empty needed set never prunes:
    /// that would leave a relation with no columns at all.
    pub fn can_prune_cols(&self, expr: ExprId, needed: &ColumnSet) -> bool {
        let output = &self.factory.memo.rel_props(expr).output_columns;
        if needed.is_empty() || !needed.is_subset(output) || needed.len() == output.len() {
            return false;
        }
        self.prunable(expr, needed)
    }

    /// Replaces the given expression by a variant restricted to the needed
    /// columns. The replacement becomes a new memo group.
    pub fn prune_cols(&mut self, expr: ExprId, needed: &ColumnSet) -> Result<ExprId, OptimizerError> {
        match self.factory.memo.expr(expr).clone() {
            Expr::Relational(RelExpr::Scan { table, columns }) => {
                let columns: Vec<ColumnId> = columns.into_iter().filter(|c| needed.contains(*c)).collect();
                let props = self.pruned_props(expr, &columns);
                Ok(self.factory.memo.add_group(RelExpr::Scan { table, columns }, props))
            }
            Expr::Relational(RelExpr::Project { input, columns }) => {
                let columns: Vec<ColumnId> = columns.into_iter().filter(|c| needed.contains(*c)).collect();
                let props = self.pruned_props(expr, &columns);
                Ok(self.factory.memo.add_group(RelExpr::Project { input, columns }, props))
            }
            Expr::Relational(RelExpr::Select { input, filter }) => {
                // The filter still has to see the columns it references.
                let mut input_needed = needed.clone();
                input_needed.union_with(&scalar_outer_refs(&self.factory.memo, filter));
                let input = self.prune_cols(input, &input_needed)?;

                let input_props = self.factory.memo.rel_props(input);
                let output_columns = input_props.output_columns.clone();
                let old_props = self.factory.memo.rel_props(expr);
                let props = RelationalProps {
                    output_columns,
                    outer_columns: old_props.outer_columns.clone(),
                    func_deps: old_props.func_deps.clone(),
                    statistics: old_props.statistics.clone(),
                };
                Ok(self.factory.memo.add_group(RelExpr::Select { input, filter }, props))
            }
            expr => Err(OptimizerError::internal(format!("Cannot prune columns of {}", expr.name()))),
        }
    }

    fn prunable(&self, expr: ExprId, needed: &ColumnSet) -> bool {
        match self.factory.memo.expr(expr) {
            Expr::Relational(RelExpr::Scan { .. }) | Expr::Relational(RelExpr::Project { .. }) => true,
            Expr::Relational(RelExpr::Select { input, filter }) => {
                let mut input_needed = needed.clone();
                input_needed.union_with(&scalar_outer_refs(&self.factory.memo, *filter));
                let input_output = &self.factory.memo.rel_props(*input).output_columns;
                if !input_needed.is_subset(input_output) || input_needed.len() == input_output.len() {
                    return false;
                }
                self.prunable(*input, &input_needed)
            }
            _ => false,
        }
    }

    fn pruned_props(&self, original: ExprId, columns: &[ColumnId]) -> RelationalProps {
        let old = self.factory.memo.rel_props(original);
        RelationalProps {
            output_columns: columns.iter().copied().collect(),
            outer_columns: old.outer_columns.clone(),
            func_deps: old.func_deps.clone(),
            statistics: old.statistics.clone(),
        }
    }
}

/// Returns the columns referenced by the given scalar expression. For a
/// subquery the references are the subquery's outer columns.
pub(crate) fn scalar_outer_refs(memo: &Memo, expr: ExprId) -> ColumnSet {
    let mut refs = ColumnSet::new();
    collect_scalar_refs(memo, expr, &mut refs);
    refs
}

fn collect_scalar_refs(memo: &Memo, expr: ExprId, refs: &mut ColumnSet) {
    match memo.expr(expr) {
        Expr::Scalar(ScalarExpr::Column(id)) => refs.insert(*id),
        Expr::Scalar(ScalarExpr::SubQuery(input)) => refs.union_with(&memo.rel_props(*input).outer_columns),
        Expr::Scalar(_) => {
            let expr = memo.expr(expr);
            for i in 0..expr.child_count() {
                collect_scalar_refs(memo, expr.child(i), refs);
            }
        }
        Expr::Relational(_) => {}
    }
}

fn scalar_has_subquery(memo: &Memo, expr: ExprId) -> bool {
    match memo.scalar_props(expr) {
        Some(props) => props.has_subquery,
        None => {
            let expr = memo.expr(expr);
            (0..expr.child_count()).any(|i| scalar_has_subquery(memo, expr.child(i)))
        }
    }
}

/// Records columns that are held constant by equality predicates in the filter.
fn collect_constant_columns(memo: &Memo, filter: ExprId, func_deps: &mut FuncDeps) {
    match memo.expr(filter) {
        Expr::Scalar(ScalarExpr::BinaryExpr { lhs, op: BinaryOp::Eq, rhs }) => {
            if let (Expr::Scalar(ScalarExpr::Column(id)), Expr::Scalar(ScalarExpr::Scalar(_))) =
                (memo.expr(*lhs), memo.expr(*rhs))
            {
                func_deps.add_constant(*id);
            }
        }
        Expr::Scalar(ScalarExpr::ExprList(exprs)) => {
            for expr in exprs {
                collect_constant_columns(memo, *expr, func_deps);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use crate::catalog::{MutableCatalog, TableBuilder};
    use crate::error::OptimizerError;
    use crate::factory::Factory;
    use crate::meta::ColumnSet;
    use crate::operators::{Expr, RelExpr};
    use crate::rules::RuleName;

    fn new_factory() -> Factory {
        let catalog = MutableCatalog::new();
        catalog
            .add_table(
                TableBuilder::new("a")
                    .add_column("x")
                    .add_column("y")
                    .add_column("z")
                    .add_row_count(100)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Factory::new(Arc::new(catalog))
    }

    #[test]
    fn scan_registers_columns() -> Result<(), OptimizerError> {
        let mut factory = Factory::new(Arc::new({
            let catalog = MutableCatalog::new();
            catalog.add_table(TableBuilder::new("a").add_column("x").add_row_count(10).build()?)?;
            catalog
        }));

        let scan = factory.scan("a")?;
        let x = factory.find_column("a", "x").expect("column x");

        let props = factory.memo().rel_props(scan);
        assert!(props.output_columns.contains(x), "output columns");
        assert_eq!(props.statistics().map(|s| s.row_count()), Some(10.0), "row count");
        Ok(())
    }

    #[test]
    fn scan_of_unknown_table_fails() {
        let mut factory = new_factory();
        let res = factory.scan("unknown");
        assert!(res.is_err(), "unknown table");
        factory.check_constructor_stack_depth().expect_err("failed constructor leaves the stack unbalanced");
    }

    #[test]
    fn select_derives_constants_from_the_filter() -> Result<(), OptimizerError> {
        let mut factory = new_factory();
        let scan = factory.scan("a")?;
        let x = factory.find_column("a", "x").unwrap();
        let filter = factory.eq_int(x, 1)?;
        let select = factory.select(scan, Some(filter))?;

        let props = factory.memo().rel_props(select);
        assert!(props.func_deps.is_constant(x), "x is constant");
        assert_eq!(props.statistics().map(|s| s.row_count()), Some(10.0), "filtered row count");
        assert!(props.outer_columns.is_empty(), "no outer columns");
        factory.check_constructor_stack_depth()?;
        Ok(())
    }

    #[test]
    fn select_without_filter_is_eliminated() -> Result<(), OptimizerError> {
        let applied = Rc::new(RefCell::new(Vec::new()));
        let log = applied.clone();

        let mut factory = new_factory();
        factory.notify_on_applied_rule(Some(Rc::new(move |rule, _, _| log.borrow_mut().push(rule))));

        let scan = factory.scan("a")?;
        let select = factory.select(scan, None)?;

        assert_eq!(select, scan, "select is replaced by its input");
        assert_eq!(applied.borrow().as_slice(), &[RuleName::EliminateSelect], "rule applied");
        Ok(())
    }

    #[test]
    fn select_without_filter_survives_when_the_rule_is_vetoed() -> Result<(), OptimizerError> {
        let mut factory = new_factory();
        factory.notify_on_matched_rule(Some(Rc::new(|_| false)));

        let scan = factory.scan("a")?;
        let select = factory.select(scan, None)?;

        assert_ne!(select, scan, "select is kept");
        assert!(
            matches!(factory.memo().expr(select), Expr::Relational(RelExpr::Select { .. })),
            "a select expression"
        );
        Ok(())
    }

    #[test]
    fn prune_cols_narrows_a_scan() -> Result<(), OptimizerError> {
        let mut factory = new_factory();
        let scan = factory.scan("a")?;
        let x = factory.find_column("a", "x").unwrap();

        let needed: ColumnSet = vec![x].into_iter().collect();
        assert!(factory.custom_funcs().can_prune_cols(scan, &needed), "can prune");

        let pruned = factory.custom_funcs().prune_cols(scan, &needed)?;
        let props = factory.memo().rel_props(pruned);
        assert_eq!(props.output_columns, needed, "pruned output");
        Ok(())
    }

    #[test]
    fn prune_cols_keeps_filter_columns() -> Result<(), OptimizerError> {
        let mut factory = new_factory();
        let scan = factory.scan("a")?;
        let x = factory.find_column("a", "x").unwrap();
        let y = factory.find_column("a", "y").unwrap();
        let filter = factory.eq_int(y, 1)?;
        let select = factory.select(scan, Some(filter))?;

        let needed: ColumnSet = vec![x].into_iter().collect();
        assert!(factory.custom_funcs().can_prune_cols(select, &needed), "can prune");

        let pruned = factory.custom_funcs().prune_cols(select, &needed)?;
        let props = factory.memo().rel_props(pruned);
        assert!(props.output_columns.contains(x), "needed column");
        assert!(props.output_columns.contains(y), "filter column survives");
        Ok(())
    }

    #[test]
    fn detach_memo_resets_the_factory() -> Result<(), OptimizerError> {
        let mut factory = new_factory();
        let _ = factory.scan("a")?;
        assert!(factory.memo().num_groups() > 0, "memo has groups");

        let detached = factory.detach_memo();
        assert!(detached.num_groups() > 0, "detached memo keeps the groups");
        assert_eq!(factory.memo().num_groups(), 0, "factory has a blank memo");
        Ok(())
    }
}
