//! The default cost model.

use rand::Rng;

use crate::cost::{Cost, Coster};
use crate::memo::{ExprId, Memo};
use crate::operators::{Expr, RelExpr};
use crate::properties::physical::PhysicalProps;

/// The number of rows assumed for an expression without statistics.
const UNKNOWN_ROW_COUNT: f64 = 1000.0;

/// A statistics-driven implementation of a [Coster].
///
/// When `perturbation` is non-zero every computed cost is multiplied by a
/// random factor in `[1 - perturbation, 1 + perturbation]`. Perturbed search
/// results can be brought back to their true costs with
/// [recompute_cost](crate::optimizer::Optimizer::recompute_cost).
#[derive(Debug)]
pub struct BasicCoster {
    perturbation: f64,
}

impl BasicCoster {
    /// Creates a coster with the given cost perturbation factor.
    pub fn new(perturbation: f64) -> Self {
        assert!(perturbation >= 0.0, "perturbation must be non negative");
        BasicCoster { perturbation }
    }

    /// Creates a coster that computes exact costs.
    pub fn unperturbed() -> Self {
        BasicCoster::new(0.0)
    }

    fn perturb(&self, cost: f64) -> f64 {
        if self.perturbation == 0.0 {
            return cost;
        }
        // Multiply by a random factor from [1 - perturbation, 1 + perturbation].
        let noise = 1.0 + self.perturbation * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        (cost * noise).max(0.0)
    }
}

impl Coster for BasicCoster {
    fn compute_cost(&self, memo: &Memo, expr: ExprId, _required: &PhysicalProps) -> Cost {
        let cost = match memo.expr(expr).relational() {
            RelExpr::Scan { .. } => row_count(memo, expr),
            RelExpr::IndexScan { .. } => row_count(memo, expr) * 0.5,
            RelExpr::Select { input, .. } => row_count(memo, *input) * 0.1,
            RelExpr::Project { input, .. } => row_count(memo, *input) * 0.05,
            RelExpr::HashJoin { left, right, .. } => {
                // The hash table is built from the left input.
                2.0 * row_count(memo, *left) + row_count(memo, *right)
            }
            RelExpr::Sort { input, input_ordering } => {
                let rows = row_count(memo, *input);
                let cost = (rows * rows.max(2.0).log2() * 0.1).max(1.0);
                if input_ordering.is_any() {
                    cost
                } else {
                    // A partial sort only has to order rows within groups that
                    // agree on the already sorted prefix.
                    cost * 0.5
                }
            }
        };
        Cost::new(self.perturb(cost))
    }
}

fn row_count(memo: &Memo, expr: ExprId) -> f64 {
    match memo.expr(expr) {
        Expr::Relational(_) => {
            memo.rel_props(expr).statistics().map(|s| s.row_count()).unwrap_or(UNKNOWN_ROW_COUNT)
        }
        Expr::Scalar(_) => 0.0,
    }
}
