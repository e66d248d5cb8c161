//! On-demand generation of logically equivalent expressions.

use crate::catalog::Catalog;
use crate::error::OptimizerError;
use crate::memo::{ExprId, GroupId, Memo};
use crate::operators::{Expr, RelExpr};
use crate::properties::ordering::index_ordering;
use crate::rules::{RuleName, RuleNotifier};

/// The result of exploring a group.
#[derive(Debug)]
pub struct ExploreResult {
    /// `true` when another exploration pass cannot add new members to the group.
    pub fully_explored: bool,
}

/// Per-group exploration scratch owned by the explorer. Members below the
/// watermark have had every transformation rule applied to them.
#[derive(Debug, Default)]
pub struct ExploreState {
    next_member: usize,
}

/// A rule that produces logically equivalent alternatives of an expression.
pub trait TransformationRule {
    /// The name of this rule.
    fn name(&self) -> RuleName;

    /// Returns the alternatives this rule derives from the given expression.
    /// An empty result means the rule does not match.
    fn apply(&self, memo: &Memo, catalog: &dyn Catalog, expr: ExprId) -> Vec<RelExpr>;
}

/// Swaps the inputs of a join. The hash table is built from the left input,
/// so the swapped form can be substantially cheaper.
pub struct CommuteJoin;

impl TransformationRule for CommuteJoin {
    fn name(&self) -> RuleName {
        RuleName::CommuteJoin
    }

    fn apply(&self, memo: &Memo, _catalog: &dyn Catalog, expr: ExprId) -> Vec<RelExpr> {
        match memo.expr(expr) {
            Expr::Relational(RelExpr::HashJoin { left, right, condition }) => vec![RelExpr::HashJoin {
                left: *right,
                right: *left,
                condition: *condition,
            }],
            _ => Vec::new(),
        }
    }
}

/// Generates an index scan alternative for every index that covers a prefix
/// of its table scan's columns. An index scan produces rows sorted by the
/// index columns, which can make a sort enforcer unnecessary.
pub struct GenerateIndexScans;

impl TransformationRule for GenerateIndexScans {
    fn name(&self) -> RuleName {
        RuleName::GenerateIndexScans
    }

    fn apply(&self, memo: &Memo, catalog: &dyn Catalog, expr: ExprId) -> Vec<RelExpr> {
        match memo.expr(expr) {
            Expr::Relational(RelExpr::Scan { table, columns }) => {
                let mut alternatives = Vec::new();
                for index in catalog.get_indexes(table) {
                    if let Some(ordering) = index_ordering(memo, index.columns(), columns) {
                        alternatives.push(RelExpr::IndexScan {
                            table: table.clone(),
                            index: index.name().into(),
                            columns: columns.clone(),
                            ordering,
                        });
                    }
                }
                alternatives
            }
            _ => Vec::new(),
        }
    }
}

/// Generates alternative, logically equivalent expressions and stores them in
/// the memo. Exploration is incremental: each call processes the members that
/// have not been explored yet, and members appended by a call are picked up by
/// the next one.
pub struct Explorer {
    rules: Vec<Box<dyn TransformationRule>>,
}

impl Explorer {
    /// Creates an explorer with the default transformation rules.
    pub fn new() -> Self {
        Explorer {
            rules: vec![Box::new(CommuteJoin), Box::new(GenerateIndexScans)],
        }
    }

    /// Creates an explorer with the given transformation rules.
    pub fn with_rules(rules: Vec<Box<dyn TransformationRule>>) -> Self {
        Explorer { rules }
    }

    /// Runs one exploration pass over the given group. Reports
    /// `fully_explored = false` when the pass appended new members, because
    /// those members have not been explored themselves yet.
    pub fn explore_group(
        &self,
        memo: &mut Memo,
        catalog: &dyn Catalog,
        group: GroupId,
        state: &mut ExploreState,
        notifier: &RuleNotifier,
    ) -> Result<ExploreResult, OptimizerError> {
        let members: Vec<ExprId> = memo.group_members(group).collect();
        let mut appended = false;

        for member in members.iter().skip(state.next_member) {
            for rule in &self.rules {
                if !notifier.rule_matched(rule.name()) {
                    continue;
                }
                let alternatives = rule.apply(memo, catalog, *member);
                for alternative in alternatives {
                    if let Some(new_member) = memo.add_group_member(group, alternative)? {
                        log::debug!("explore: rule {} added member {} to group {}", rule.name(), new_member, group);
                        notifier.rule_applied(rule.name(), Some(*member), new_member);
                        appended = true;
                    }
                }
            }
        }
        state.next_member = members.len();

        Ok(ExploreResult {
            fully_explored: !appended,
        })
    }
}

impl Default for Explorer {
    fn default() -> Self {
        Explorer::new()
    }
}
