//! Cost model.

use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};
use std::rc::Rc;

use crate::memo::{ExprId, Memo};
use crate::properties::physical::PhysicalProps;

pub mod basic;

/// The estimated cost of executing an expression.
#[derive(Debug, Copy, Clone, Default, PartialEq, PartialOrd)]
pub struct Cost(f64);

impl Cost {
    /// A cost of zero.
    pub const ZERO: Cost = Cost(0.0);

    /// Creates a cost from the given value.
    ///
    /// # Panics
    ///
    /// This method panics if the value is negative or not finite.
    pub fn new(value: f64) -> Self {
        assert!(value.is_finite(), "cost must be finite but got: {}", value);
        assert!(value >= 0.0, "cost must be non negative but got: {}", value);
        Cost(value)
    }

    /// Returns the cost value.
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Returns `true` if this cost is strictly lower than the given cost.
    /// The comparison is strict so that the first of two equally cheap
    /// candidates wins.
    pub fn less(&self, other: Cost) -> bool {
        self.0 < other.0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, other: Cost) -> Cost {
        Cost(self.0 + other.0)
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, other: Cost) {
        self.0 += other.0;
    }
}

impl Display for Cost {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Estimates the cost of executing a single expression, exclusive of the cost
/// of its children.
pub trait Coster {
    fn compute_cost(&self, memo: &Memo, expr: ExprId, required: &PhysicalProps) -> Cost;
}

pub type CosterRef = Rc<dyn Coster>;

#[cfg(test)]
mod test {
    use crate::cost::Cost;

    #[test]
    fn strict_comparison() {
        let cheap = Cost::new(1.0);
        let expensive = Cost::new(2.0);

        assert!(cheap.less(expensive), "1 < 2");
        assert!(!expensive.less(cheap), "2 < 1");
        assert!(!cheap.less(cheap), "ties are not lower");
    }

    #[test]
    fn addition() {
        let mut cost = Cost::new(1.5);
        cost += Cost::new(2.5);
        assert_eq!(cost, Cost::new(4.0), "sum");
        assert_eq!(format!("{}", cost), "4.00", "display");
    }

    #[test]
    #[should_panic(expected = "cost must be non negative")]
    fn negative_cost() {
        let _ = Cost::new(-1.0);
    }
}
