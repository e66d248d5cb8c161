//! Optimization rules and rule observers.

use bit_set::BitSet;
use rand::Rng;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use crate::memo::ExprId;

pub mod explore;

/// Names of the optimization rules known to the optimizer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RuleName {
    /// Replaces a selection without a filter by its input. Applied by the
    /// factory while the canonical form is being built.
    EliminateSelect,
    /// Removes redundant columns from the ordering required of the root.
    SimplifyRootOrdering,
    /// Discards root output columns that are not needed by the root's
    /// ordering or presentation.
    PruneRootCols,
    /// Swaps the inputs of a join.
    CommuteJoin,
    /// Generates index scan alternatives for a table scan.
    GenerateIndexScans,
}

impl RuleName {
    /// All rules, in a fixed order.
    pub fn all() -> [RuleName; 5] {
        [
            RuleName::EliminateSelect,
            RuleName::SimplifyRootOrdering,
            RuleName::PruneRootCols,
            RuleName::CommuteJoin,
            RuleName::GenerateIndexScans,
        ]
    }

    /// A dense index of this rule, used by [DisabledRules].
    pub fn index(&self) -> usize {
        match self {
            RuleName::EliminateSelect => 0,
            RuleName::SimplifyRootOrdering => 1,
            RuleName::PruneRootCols => 2,
            RuleName::CommuteJoin => 3,
            RuleName::GenerateIndexScans => 4,
        }
    }

    /// Essential rules must never be disabled, even by probabilistic rule
    /// disablement.
    pub fn is_essential(&self) -> bool {
        match self {
            // Needed to keep the canonical form free of selections without a
            // filter, which the cost model cannot price.
            RuleName::EliminateSelect => true,
            _ => false,
        }
    }
}

impl Display for RuleName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuleName::EliminateSelect => "EliminateSelect",
            RuleName::SimplifyRootOrdering => "SimplifyRootOrdering",
            RuleName::PruneRootCols => "PruneRootCols",
            RuleName::CommuteJoin => "CommuteJoin",
            RuleName::GenerateIndexScans => "GenerateIndexScans",
        };
        write!(f, "{}", name)
    }
}

/// A callback invoked each time a rule has been matched. If the callback
/// returns `false` the rule is not applied.
pub type MatchedRuleFn = dyn Fn(RuleName) -> bool;

/// A callback invoked each time a rule has been applied. `source` is the
/// expression the rule matched, when one exists; `target` is the expression
/// the rule produced.
pub type AppliedRuleFn = dyn Fn(RuleName, Option<ExprId>, ExprId);

/// Bundles the matched-rule and applied-rule callbacks. When a callback is
/// absent the corresponding notification short-circuits: all rules match and
/// applications go unreported.
#[derive(Clone, Default)]
pub struct RuleNotifier {
    matched: Option<Rc<MatchedRuleFn>>,
    applied: Option<Rc<AppliedRuleFn>>,
}

impl RuleNotifier {
    pub fn new(matched: Option<Rc<MatchedRuleFn>>, applied: Option<Rc<AppliedRuleFn>>) -> Self {
        RuleNotifier { matched, applied }
    }

    /// Reports a rule match. Returns `true` if the rule is allowed to run.
    pub fn rule_matched(&self, rule: RuleName) -> bool {
        self.matched.as_ref().map_or(true, |f| f(rule))
    }

    /// Reports a rule application.
    pub fn rule_applied(&self, rule: RuleName, source: Option<ExprId>, target: ExprId) {
        if let Some(f) = self.applied.as_ref() {
            f(rule, source, target)
        }
    }
}

/// A compact set of rules that are not allowed to run. Used for testing.
#[derive(Debug, Clone, Default)]
pub struct DisabledRules {
    rules: BitSet,
}

impl DisabledRules {
    pub fn new() -> Self {
        DisabledRules::default()
    }

    /// Disables each non-essential rule with the given probability.
    pub fn random(probability: f64) -> Self {
        let mut disabled = DisabledRules::new();
        let mut rng = rand::thread_rng();
        for rule in RuleName::all() {
            if !rule.is_essential() && rng.gen::<f64>() < probability {
                disabled.add(rule);
            }
        }
        disabled
    }

    /// Adds the given rule to this set.
    pub fn add(&mut self, rule: RuleName) {
        self.rules.insert(rule.index());
    }

    /// Returns `true` if the given rule is disabled.
    pub fn contains(&self, rule: RuleName) -> bool {
        self.rules.contains(rule.index())
    }
}

#[cfg(test)]
mod test {
    use crate::rules::{DisabledRules, RuleName, RuleNotifier};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn absent_callbacks_allow_everything() {
        let notifier = RuleNotifier::default();
        for rule in RuleName::all() {
            assert!(notifier.rule_matched(rule), "rule {} must be allowed", rule);
        }
    }

    #[test]
    fn matched_callback_filters_rules() {
        let notifier = RuleNotifier::new(Some(Rc::new(|rule| rule != RuleName::CommuteJoin)), None);

        assert!(!notifier.rule_matched(RuleName::CommuteJoin), "filtered out");
        assert!(notifier.rule_matched(RuleName::GenerateIndexScans), "allowed");
    }

    #[test]
    fn applied_callback_observes_applications() {
        let applied = Rc::new(RefCell::new(Vec::new()));
        let log = applied.clone();
        let notifier = RuleNotifier::new(
            None,
            Some(Rc::new(move |rule, _, _| log.borrow_mut().push(rule))),
        );

        notifier.rule_applied(RuleName::CommuteJoin, None, crate::memo::ExprId(1));
        assert_eq!(applied.borrow().as_slice(), &[RuleName::CommuteJoin], "one application");
    }

    #[test]
    fn random_disablement_never_disables_essential_rules() {
        // Probability 1.0 disables every rule that is allowed to be disabled.
        let disabled = DisabledRules::random(1.0);
        for rule in RuleName::all() {
            assert_eq!(disabled.contains(rule), !rule.is_essential(), "rule {}", rule);
        }
    }

    #[test]
    fn random_disablement_with_zero_probability_is_empty() {
        let disabled = DisabledRules::random(0.0);
        for rule in RuleName::all() {
            assert!(!disabled.contains(rule), "rule {}", rule);
        }
    }
}
