//! Test setup for the optimizer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Once};

use crate::catalog::{IndexBuilder, MutableCatalog, TableBuilder};
use crate::cost::{Cost, Coster};
use crate::factory::Factory;
use crate::memo::{format_plan, ExprId, Memo};
use crate::meta::ColumnId;
use crate::operators::RelExpr;
use crate::optimizer::Optimizer;
use crate::properties::physical::{PhysicalProps, Presentation};
use crate::properties::{OrderingChoice, OrderingColumn};

static INIT_LOG: Once = Once::new();

/// A coster with simple, predictable formulas: a table access costs its row
/// count (unless overridden), a selection costs a tenth of its input rows, a
/// sort costs a quadratic function of its input rows with partial sorts at
/// half price, and a hash join pays double for its build side.
#[derive(Debug, Default)]
pub struct TestCoster {
    table_access_cost: RefCell<HashMap<String, f64>>,
}

impl TestCoster {
    pub fn new() -> Self {
        TestCoster::default()
    }

    /// Overrides the cost of accessing the given table.
    pub fn set_table_access_cost(&self, table: &str, cost: f64) {
        self.table_access_cost.borrow_mut().insert(table.into(), cost);
    }

    fn access_cost(&self, table: &str, memo: &Memo, expr: ExprId) -> f64 {
        self.table_access_cost.borrow().get(table).copied().unwrap_or_else(|| rows(memo, expr))
    }
}

impl Coster for TestCoster {
    fn compute_cost(&self, memo: &Memo, expr: ExprId, _required: &PhysicalProps) -> Cost {
        let cost = match memo.expr(expr).relational() {
            RelExpr::Scan { table, .. } => self.access_cost(table, memo, expr),
            RelExpr::IndexScan { table, .. } => self.access_cost(table, memo, expr),
            RelExpr::Select { input, .. } => rows(memo, *input) * 0.1,
            RelExpr::Project { .. } => 1.0,
            RelExpr::HashJoin { left, right, .. } => 2.0 * rows(memo, *left) + rows(memo, *right),
            RelExpr::Sort { input, input_ordering } => {
                let input_rows = rows(memo, *input);
                let cost = (input_rows * input_rows * 0.005).max(1.0);
                if input_ordering.is_any() {
                    cost
                } else {
                    cost * 0.5
                }
            }
        };
        Cost::new(cost)
    }
}

fn rows(memo: &Memo, expr: ExprId) -> f64 {
    memo.rel_props(expr).statistics().map(|s| s.row_count()).unwrap_or(1000.0)
}

/// Provides a test setup for the [optimizer](crate::optimizer::Optimizer):
/// a mutable catalog, a predictable coster and plan comparison helpers.
pub struct OptimizerTester {
    optimizer: Optimizer,
    catalog: Arc<MutableCatalog>,
    coster: Rc<TestCoster>,
}

impl OptimizerTester {
    pub fn new() -> Self {
        INIT_LOG.call_once(pretty_env_logger::init);

        let catalog = Arc::new(MutableCatalog::new());
        let mut optimizer = Optimizer::new(catalog.clone());
        let coster = Rc::new(TestCoster::new());
        optimizer.set_coster(coster.clone());
        OptimizerTester {
            optimizer,
            catalog,
            coster,
        }
    }

    /// Registers a table with the given columns and row count.
    pub fn add_table(&self, name: &str, columns: &[&str], row_count: usize) {
        let mut builder = TableBuilder::new(name).add_row_count(row_count);
        for column in columns {
            builder = builder.add_column(column);
        }
        self.catalog.add_table(builder.build().expect("valid table")).expect("table added");
    }

    /// Registers an index of the given table.
    pub fn add_index(&self, table: &str, name: &str, columns: &[&str]) {
        let mut builder = IndexBuilder::new(table, name);
        for column in columns {
            builder = builder.add_column(column);
        }
        self.catalog.add_index(builder.build().expect("valid index")).expect("index added");
    }

    /// Overrides the cost of accessing the given table.
    pub fn set_table_access_cost(&self, table: &str, cost: f64) {
        self.coster.set_table_access_cost(table, cost);
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.optimizer
    }

    pub fn factory_mut(&mut self) -> &mut Factory {
        self.optimizer.factory_mut()
    }

    pub fn memo(&self) -> &Memo {
        self.optimizer.memo()
    }

    /// Returns the identifier of a column registered for the given table.
    ///
    /// # Panics
    ///
    /// This method panics if the column has not been registered by a scan.
    pub fn column(&self, table: &str, name: &str) -> ColumnId {
        self.optimizer
            .factory()
            .find_column(table, name)
            .unwrap_or_else(|| panic!("Unknown column: {}.{}", table, name))
    }

    /// Sets the memo root and the properties required of it.
    pub fn set_root(&mut self, expr: ExprId, ordering: OrderingChoice, presentation: &[ColumnId]) {
        let presentation = if presentation.is_empty() {
            None
        } else {
            Some(Presentation::new(presentation.to_vec()))
        };
        self.optimizer.factory_mut().set_root(expr, PhysicalProps::new(ordering, presentation));
    }

    /// Optimizes the query and compares the chosen plan with the expected one.
    /// Returns the root of the chosen plan.
    pub fn optimize(&mut self, expected_plan: &str) -> ExprId {
        let root = self.optimizer.optimize().expect("optimization failed");
        let actual = format_plan(self.optimizer.memo(), root);
        assert_eq!(actual.trim(), expected_plan.trim(), "chosen plan");
        root
    }

    /// The cost of the plan chosen for the root.
    pub fn best_cost(&self) -> Cost {
        let (root, _) = self.memo().root().expect("no root");
        self.memo().best_props(root).expect("root has no best properties").cost
    }
}

/// Creates an ascending ordering from the given columns.
pub fn ordering(columns: &[ColumnId]) -> OrderingChoice {
    OrderingChoice::new(columns.iter().copied().map(OrderingColumn::asc).collect())
}
