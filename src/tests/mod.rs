use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::catalog::{MutableCatalog, TableBuilder};
use crate::cost::Cost;
use crate::error::OptimizerError;
use crate::memo::format_plan;
use crate::operators::BinaryOp;
use crate::optimizer::{Optimizer, OptimizerOptions};
use crate::properties::OrderingChoice;
use crate::rules::RuleName;
use crate::testing::{ordering, OptimizerTester};

/// `SELECT * FROM a WHERE x = 1 ORDER BY y`, no index on `y`.
///
/// The scan costs 100, the selection on top of it 110. A sort of the filtered
/// rows costs 1, so the enforcer on top of the selection wins at 111 against
/// the alternative that pushes the sort below the selection (100 + 50 + 10 =
/// 160).
#[test]
fn sort_enforcer_on_top_of_the_cheapest_plan() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    let filter = tester.factory_mut().eq_int(x, 1).unwrap();
    let select = tester.factory_mut().select(scan, Some(filter)).unwrap();
    tester.set_root(select, ordering(&[y]), &[x, y]);

    let root = tester.optimize(
        r#"
Sort [+2]
  Select
    Scan a cols=[1, 2]
    col:1 = 1
"#,
    );
    assert_eq!(tester.best_cost(), Cost::new(111.0), "total cost");

    // The enforcer provides the ordering; its input is optimized under
    // strictly weaker properties.
    let memo = tester.memo();
    let root_best = memo.best_props(root).expect("root best props");
    assert!(!memo.props(root_best.required).ordering().is_any(), "root requires the ordering");
    assert_eq!(root_best.provided, ordering(&[y]), "root provides the ordering");

    let input = memo.expr(root).child(0);
    let input_best = memo.best_props(input).expect("input best props");
    assert!(memo.props(input_best.required).ordering().is_any(), "input is ordering-free");
    assert_eq!(input_best.cost, Cost::new(110.0), "input cost");

    let stats = tester.optimizer().stats();
    assert!(stats.optimize_group >= 2, "both groups visited");
    assert!(stats.members_costed >= 2, "members costed");
    assert!(stats.enforcers_costed >= 2, "enforcers tried for both groups");
}

/// The search memoizes per (group, required properties): the query from the
/// previous test touches two groups, each under two property sets, and the
/// subquery-free filter never becomes a group state.
#[test]
fn scalar_expressions_without_subqueries_are_not_optimized() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    let filter = tester.factory_mut().eq_int(x, 1).unwrap();
    let select = tester.factory_mut().select(scan, Some(filter)).unwrap();
    tester.set_root(select, ordering(&[y]), &[x, y]);

    tester.optimizer_mut().optimize().unwrap();
    assert_eq!(tester.optimizer().num_group_states(), 4, "two groups, two property sets each");
}

/// `SELECT x FROM a` where `a` has columns `x, y, z`: the root is replaced by
/// a scan restricted to the needed column before the search begins.
#[test]
fn prune_root_cols_replaces_the_root() {
    let applied = Rc::new(RefCell::new(Vec::new()));
    let log = applied.clone();

    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y", "z"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    tester.optimizer_mut().notify_on_applied_rule(Some(Rc::new(move |rule, _, _| log.borrow_mut().push(rule))));
    tester.set_root(scan, OrderingChoice::any(), &[x]);

    tester.optimize("Scan a cols=[1]");
    assert_eq!(tester.best_cost(), Cost::new(100.0), "scan cost");
    assert!(applied.borrow().contains(&RuleName::PruneRootCols), "rule applied");
}

/// `SELECT * FROM a ORDER BY y` with an index on `y`: the index scan provides
/// the ordering natively at cost 100 and beats a sort on top of the table
/// scan at cost 150. No enforcer appears in the final plan.
#[test]
fn index_scan_beats_the_sort_enforcer() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);
    tester.add_index("a", "a_y", &["y"]);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    tester.set_root(scan, ordering(&[y]), &[x, y]);

    tester.optimize("IndexScan a.a_y cols=[1, 2] [+2]");
    assert_eq!(tester.best_cost(), Cost::new(100.0), "index scan cost");
}

/// An ordering required on two columns with an index covering only the first:
/// a partial sort on top of the index scan orders the remainder at half the
/// cost of a full sort on top of the table scan.
#[test]
fn partial_sort_uses_the_longest_interesting_prefix() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);
    tester.add_index("a", "a_y", &["y"]);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    tester.set_root(scan, ordering(&[y, x]), &[x, y]);

    tester.optimize(
        r#"
Sort [+2, +1] input=[+2]
  IndexScan a.a_y cols=[1, 2] [+2]
"#,
    );
    assert_eq!(tester.best_cost(), Cost::new(125.0), "index scan plus partial sort");
}

/// Join reordering: exploration adds the commuted join, and the coster favors
/// building the hash table from the smaller input. The finalizer rewrites the
/// root group to the reordered join.
#[test]
fn exploration_commutes_the_join() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);
    tester.add_table("b", &["z"], 10);

    let scan_a = tester.factory_mut().scan("a").unwrap();
    let scan_b = tester.factory_mut().scan("b").unwrap();
    let x = tester.column("a", "x");
    let z = tester.column("b", "z");
    let lhs = tester.factory_mut().column(x);
    let rhs = tester.factory_mut().column(z);
    let condition = tester.factory_mut().binary_expr(lhs, BinaryOp::Eq, rhs).unwrap();
    let join = tester.factory_mut().join(scan_a, scan_b, condition).unwrap();
    tester.set_root(join, OrderingChoice::any(), &[]);

    tester.optimize(
        r#"
HashJoin
  Scan b cols=[3]
  Scan a cols=[1, 2]
  col:1 = col:3
"#,
    );
    // Children cost 100 + 10, the commuted join itself 2 * 10 + 100.
    assert_eq!(tester.best_cost(), Cost::new(230.0), "commuted join cost");
    assert!(tester.optimizer().stats().exploration_passes >= 2, "exploration ran");
}

/// A second optimization of the same memo must fail.
#[test]
fn optimize_twice_fails() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    tester.set_root(scan, OrderingChoice::any(), &[]);

    tester.optimizer_mut().optimize().unwrap();
    let err = tester.optimizer_mut().optimize().expect_err("second optimization");
    assert!(matches!(err, OptimizerError::AlreadyOptimized), "unexpected error: {}", err);
}

/// `SELECT * FROM a WHERE y = 1 ORDER BY y, x`: `y` is constant, so the
/// required ordering simplifies to `x` before the search begins.
#[test]
fn simplify_root_ordering_drops_constant_columns() {
    let applied = Rc::new(RefCell::new(Vec::new()));
    let log = applied.clone();

    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    let filter = tester.factory_mut().eq_int(y, 1).unwrap();
    let select = tester.factory_mut().select(scan, Some(filter)).unwrap();
    tester.optimizer_mut().notify_on_applied_rule(Some(Rc::new(move |rule, _, _| log.borrow_mut().push(rule))));
    tester.set_root(select, ordering(&[y, x]), &[x, y]);

    tester.optimize(
        r#"
Sort [+1]
  Select
    Scan a cols=[1, 2]
    col:2 = 1
"#,
    );
    assert_eq!(tester.best_cost(), Cost::new(111.0), "total cost");
    assert!(applied.borrow().contains(&RuleName::SimplifyRootOrdering), "rule applied");
}

/// A filter referencing a column produced outside of the query is reported
/// once the root is fully optimized.
#[test]
fn dangling_outer_columns_are_rejected() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x"], 100);
    tester.add_table("b", &["z"], 10);

    let scan_a = tester.factory_mut().scan("a").unwrap();
    let _scan_b = tester.factory_mut().scan("b").unwrap();
    let z = tester.column("b", "z");
    let filter = tester.factory_mut().eq_int(z, 1).unwrap();
    let select = tester.factory_mut().select(scan_a, Some(filter)).unwrap();
    tester.set_root(select, OrderingChoice::any(), &[]);

    let err = tester.optimizer_mut().optimize().expect_err("dangling reference");
    match err {
        OptimizerError::DanglingOuterColumns(cols) => {
            assert!(cols.contains(z), "the outer column is reported: {}", cols)
        }
        err => panic!("unexpected error: {}", err),
    }
}

/// A subquery inside the filter forces the scalar traversal to optimize the
/// nested relational tree.
#[test]
fn subqueries_are_optimized_through_scalar_expressions() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);
    tester.add_table("b", &["z"], 10);

    let scan_a = tester.factory_mut().scan("a").unwrap();
    let scan_b = tester.factory_mut().scan("b").unwrap();
    let subquery = tester.factory_mut().subquery(scan_b).unwrap();
    let one = tester.factory_mut().scalar(1);
    let filter = tester.factory_mut().binary_expr(subquery, BinaryOp::Gt, one).unwrap();
    let select = tester.factory_mut().select(scan_a, Some(filter)).unwrap();
    tester.set_root(select, OrderingChoice::any(), &[]);

    tester.optimize(
        r#"
Select
  Scan a cols=[1, 2]
  SubQuery > 1
    Scan b cols=[3]
"#,
    );
    // scan a + the subquery scan + the selection itself.
    assert_eq!(tester.best_cost(), Cost::new(120.0), "total cost");

    let best = tester.memo().best_props(scan_b).expect("subquery scan is costed");
    assert_eq!(best.cost, Cost::new(10.0), "subquery scan cost");
}

/// Running the finalization pass a second time must not change anything.
#[test]
fn finalization_is_idempotent() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    let filter = tester.factory_mut().eq_int(x, 1).unwrap();
    let select = tester.factory_mut().select(scan, Some(filter)).unwrap();
    tester.set_root(select, ordering(&[y]), &[x, y]);

    let root = tester.optimizer_mut().optimize().unwrap();
    let first = format_plan(tester.memo(), root);

    let (root, root_props) = tester.memo().root().unwrap();
    let root_again = tester.optimizer_mut().set_lowest_cost_tree(root, root_props).unwrap();
    let second = format_plan(tester.memo(), root_again);

    assert_eq!(root, root_again, "same root");
    assert_eq!(first, second, "same plan");
}

/// Two optimizations of the same query and cost model choose the same plan at
/// the same cost.
#[test]
fn optimization_is_deterministic() {
    fn run() -> (String, Cost) {
        let mut tester = OptimizerTester::new();
        tester.add_table("a", &["x", "y"], 100);
        tester.add_index("a", "a_y", &["y"]);

        let scan = tester.factory_mut().scan("a").unwrap();
        let x = tester.column("a", "x");
        let y = tester.column("a", "y");
        let filter = tester.factory_mut().eq_int(x, 1).unwrap();
        let select = tester.factory_mut().select(scan, Some(filter)).unwrap();
        tester.set_root(select, ordering(&[y]), &[x, y]);

        let root = tester.optimizer_mut().optimize().unwrap();
        (format_plan(tester.memo(), root), tester.best_cost())
    }

    let (first_plan, first_cost) = run();
    let (second_plan, second_cost) = run();
    assert_eq!(first_plan, second_plan, "same plan");
    assert_eq!(first_cost, second_cost, "same cost");
}

/// With all rules disabled the index scan alternative is never generated and
/// the enforcer is the only way to provide the ordering.
#[test]
fn disabled_optimizations_fall_back_to_the_enforcer() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);
    tester.add_index("a", "a_y", &["y"]);

    let scan = tester.factory_mut().scan("a").unwrap();
    let x = tester.column("a", "x");
    let y = tester.column("a", "y");
    tester.optimizer_mut().disable_optimizations();
    tester.set_root(scan, ordering(&[y]), &[x, y]);

    tester.optimize(
        r#"
Sort [+2]
  Scan a cols=[1, 2]
"#,
    );
    assert_eq!(tester.best_cost(), Cost::new(150.0), "scan plus full sort");
}

/// Detaching the memo keeps the optimized artifact intact and resets the
/// optimizer for reuse.
#[test]
fn detach_memo_resets_the_optimizer() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x", "y"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    tester.set_root(scan, OrderingChoice::any(), &[]);
    tester.optimizer_mut().optimize().unwrap();

    let detached = tester.optimizer_mut().detach_memo();
    assert!(detached.is_optimized(), "detached memo stays optimized");
    assert!(detached.root().is_some(), "detached memo keeps its root");
    assert_eq!(tester.memo().num_groups(), 0, "optimizer got a blank memo");

    // The optimizer is reusable. The default coster is back in place, so the
    // scan again costs its row count.
    let scan = tester.factory_mut().scan("a").unwrap();
    tester.set_root(scan, OrderingChoice::any(), &[]);
    tester.optimize("Scan a cols=[1, 2]");
    assert_eq!(tester.best_cost(), Cost::new(100.0), "scan cost");
}

/// A perturbed search can pick odd costs; recomputing restores the true ones.
#[test]
fn recompute_cost_restores_unperturbed_costs() {
    let catalog = MutableCatalog::new();
    catalog
        .add_table(TableBuilder::new("a").add_column("x").add_row_count(100).build().unwrap())
        .unwrap();

    let options = OptimizerOptions {
        cost_perturbation: 2.0,
        ..OptimizerOptions::default()
    };
    let mut optimizer = Optimizer::with_options(Arc::new(catalog), options);

    let scan = optimizer.factory_mut().scan("a").unwrap();
    optimizer.factory_mut().set_root(scan, crate::properties::physical::PhysicalProps::none());

    let root = optimizer.optimize().unwrap();
    optimizer.recompute_cost().unwrap();

    let best = optimizer.memo().best_props(root).expect("root best props");
    assert_eq!(best.cost, Cost::new(100.0), "true scan cost");
}

/// An unbalanced factory stack indicates a buggy rewrite and fails the
/// optimization.
#[test]
fn unbalanced_factory_is_reported() {
    let mut tester = OptimizerTester::new();
    tester.add_table("a", &["x"], 100);

    let scan = tester.factory_mut().scan("a").unwrap();
    tester.set_root(scan, OrderingChoice::any(), &[]);
    tester.factory_mut().set_constructor_stack_depth(3);

    let err = tester.optimizer_mut().optimize().expect_err("unbalanced factory");
    assert!(matches!(err, OptimizerError::UnbalancedFactory(3)), "unexpected error: {}", err);
}
