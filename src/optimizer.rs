//! Cost-based optimizer.
//!
//! The optimizer selects, out of a memoized forest of logically equivalent
//! expressions, the physical plan that satisfies the properties required of
//! the root at the lowest estimated cost. The search is a top-down recursion
//! over groups: each group is optimized with respect to a set of required
//! physical properties, enforcers are added for properties no member can
//! provide natively, and exploration generates new alternatives on demand.
//! A final pass rewrites child pointers so the memo root points at the chosen
//! plan.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use bit_set::BitSet;

use crate::catalog::CatalogRef;
use crate::cost::basic::BasicCoster;
use crate::cost::{Cost, Coster, CosterRef};
use crate::error::OptimizerError;
use crate::factory::Factory;
use crate::memo::{format_memo, ExprId, GroupId, Memo, PropsId};
use crate::operators::{Expr, RelExpr};
use crate::properties::ordering::{build_provided, derive_interesting_orderings};
use crate::properties::physical::{
    build_child_physical_props, build_child_physical_props_scalar, can_provide_physical_props,
};
use crate::properties::OrderingChoice;
use crate::rules::explore::{ExploreResult, ExploreState, Explorer};
use crate::rules::{AppliedRuleFn, DisabledRules, MatchedRuleFn, RuleName, RuleNotifier};

/// The number of group states per allocation page.
const STATE_PAGE_SIZE: usize = 8;

/// Knobs that alter the behaviour of the optimizer, used for testing.
#[derive(Debug, Clone, Default)]
pub struct OptimizerOptions {
    /// When non-zero, every cost computed by the default coster is perturbed
    /// by a random factor of at most this magnitude.
    pub cost_perturbation: f64,
    /// When non-zero, each non-essential rule is disabled with this probability.
    pub disable_rule_probability: f64,
}

/// Cost-based optimizer. Construct the input expression tree through the
/// [factory](Optimizer::factory_mut), set the memo root together with the
/// properties required of it, and call [optimize](Optimizer::optimize) to
/// obtain the lowest cost plan.
pub struct Optimizer {
    factory: Factory,
    catalog: CatalogRef,
    options: OptimizerOptions,
    explorer: Explorer,
    coster: CosterRef,
    state_map: HashMap<GroupStateKey, StateId>,
    states: StatePool,
    matched_rule: Option<Rc<MatchedRuleFn>>,
    applied_rule: Option<Rc<AppliedRuleFn>>,
    stats: Stats,
}

impl Optimizer {
    /// Creates a new optimizer with default options.
    pub fn new(catalog: CatalogRef) -> Self {
        Optimizer::with_options(catalog, OptimizerOptions::default())
    }

    /// Creates a new optimizer with the given options.
    pub fn with_options(catalog: CatalogRef, options: OptimizerOptions) -> Self {
        let mut optimizer = Optimizer {
            factory: Factory::new(catalog.clone()),
            catalog,
            coster: Rc::new(BasicCoster::new(options.cost_perturbation)),
            options,
            explorer: Explorer::new(),
            state_map: HashMap::new(),
            states: StatePool::new(STATE_PAGE_SIZE),
            matched_rule: None,
            applied_rule: None,
            stats: Stats::default(),
        };
        if optimizer.options.disable_rule_probability > 0.0 {
            optimizer.disable_rules(optimizer.options.disable_rule_probability);
        }
        optimizer
    }

    /// The factory used to construct the input expression tree.
    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut Factory {
        &mut self.factory
    }

    /// The memoized forest of expressions.
    pub fn memo(&self) -> &Memo {
        self.factory.memo()
    }

    /// The coster the optimizer currently uses.
    pub fn coster(&self) -> &CosterRef {
        &self.coster
    }

    /// Overrides the default coster.
    pub fn set_coster(&mut self, coster: CosterRef) {
        self.coster = coster;
    }

    /// Sets the callback invoked each time an optimization rule has been
    /// matched. When the callback returns `false` the rule is not applied;
    /// when no callback is installed, all rules run. The callback is also
    /// forwarded to the factory so normalization honors the same filter.
    pub fn notify_on_matched_rule(&mut self, callback: Option<Rc<MatchedRuleFn>>) {
        self.matched_rule = callback.clone();
        self.factory.notify_on_matched_rule(callback);
    }

    /// Sets the callback invoked each time an optimization rule has been
    /// applied. The callback is also forwarded to the factory.
    pub fn notify_on_applied_rule(&mut self, callback: Option<Rc<AppliedRuleFn>>) {
        self.applied_rule = callback.clone();
        self.factory.notify_on_applied_rule(callback);
    }

    /// Disables all optimization rules. The unaltered input expression tree
    /// becomes the output expression tree.
    pub fn disable_optimizations(&mut self) {
        self.notify_on_matched_rule(Some(Rc::new(|_| false)));
    }

    /// Disables each non-essential rule with the given probability.
    pub fn disable_rules(&mut self, probability: f64) {
        let disabled = Rc::new(DisabledRules::random(probability));
        self.notify_on_matched_rule(Some(Rc::new(move |rule| {
            if disabled.contains(rule) {
                log::info!("disabled rule matched: {}", rule);
                false
            } else {
                true
            }
        })));
    }

    /// Extracts the memo from the optimizer as an immutable artifact and
    /// resets the optimizer so that its reuse does not affect the detached
    /// memo.
    pub fn detach_memo(&mut self) -> Memo {
        let memo = self.factory.detach_memo();
        self.reset();
        memo
    }

    /// Returns the expression that satisfies the properties required of the
    /// root at the lowest estimated cost. In case of a cost tie the expression
    /// costed first wins.
    pub fn optimize(&mut self) -> Result<ExprId, OptimizerError> {
        if self.factory.memo().is_optimized() {
            return Err(OptimizerError::AlreadyOptimized);
        }
        let start_time = Instant::now();

        // Simplify the root operator based on the properties required of it.
        self.optimize_root_with_props()?;

        // Optimize the entire expression tree.
        let (root, root_props) = self.root()?;
        log::debug!("optimize: root {} required: {}", root, self.factory.memo().props(root_props));
        self.optimize_group(root, root_props)?;

        // Walk the tree from the root, updating child pointers so that the
        // memo root points to the lowest cost tree (rather than to the
        // normalized tree).
        let root = self.set_lowest_cost_tree(root, root_props)?;
        self.factory.memo_mut().set_root(root, root_props);

        // There must be no dangling references left.
        let outer_columns = self.factory.memo().rel_props(root).outer_columns.clone();
        if !outer_columns.is_empty() {
            return Err(OptimizerError::DanglingOuterColumns(outer_columns));
        }

        // Every constructor invoked by the rewrites must have returned.
        self.factory.check_constructor_stack_depth()?;

        self.factory.memo_mut().mark_optimized();
        log::debug!("optimize: final memo:\n{}", format_memo(self.factory.memo()));
        log::debug!("optimize: finished in {:?}, stats: {:?}", start_time.elapsed(), self.stats);
        Ok(root)
    }

    /// Recomputes the cost of each expression in the chosen plan with an
    /// unperturbed coster, overwriting the costs stored in the memo. Used to
    /// obtain true costs after a perturbed search.
    pub fn recompute_cost(&mut self) -> Result<(), OptimizerError> {
        let (root, root_props) = self.root()?;
        let coster = BasicCoster::unperturbed();
        self.recompute_cost_impl(root, root_props, &coster)?;
        Ok(())
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn num_group_states(&self) -> usize {
        self.states.len()
    }

    fn reset(&mut self) {
        self.state_map.clear();
        self.states = StatePool::new(STATE_PAGE_SIZE);
        self.stats = Stats::default();
        self.coster = Rc::new(BasicCoster::new(self.options.cost_perturbation));
        self.notify_on_matched_rule(None);
        self.notify_on_applied_rule(None);
        if self.options.disable_rule_probability > 0.0 {
            self.disable_rules(self.options.disable_rule_probability);
        }
    }

    fn root(&self) -> Result<(ExprId, PropsId), OptimizerError> {
        let (root, props) = self
            .factory
            .memo()
            .root()
            .ok_or_else(|| OptimizerError::internal("Root expression has not been set"))?;
        if !self.factory.memo().expr(root).is_relational() {
            return Err(OptimizerError::internal("Optimize can only be called on relational root expressions"));
        }
        Ok((root, props))
    }

    /// Calls either `optimize_group` or `optimize_scalar_expr` depending on
    /// the kind of the expression.
    fn optimize_expr(&mut self, expr: ExprId, required: PropsId) -> Result<(Cost, bool), OptimizerError> {
        match self.factory.memo().expr(expr) {
            Expr::Relational(_) => {
                let state_id = self.optimize_group(expr, required)?;
                let state = self.states.get(state_id);
                Ok((state.cost, state.fully_optimized))
            }
            Expr::Scalar(_) => {
                // Short-circuit traversal of scalar expressions with no nested
                // subquery, since there is only one possible tree.
                if let Some(props) = self.factory.memo().scalar_props(expr) {
                    if !props.has_subquery {
                        return Ok((Cost::ZERO, true));
                    }
                }
                self.optimize_scalar_expr(expr)
            }
        }
    }

    /// Enumerates expression trees rooted in the given memo group and finds
    /// the lowest cost tree that provides the required physical properties.
    /// Enforcers are added as needed to provide the required properties.
    fn optimize_group(&mut self, expr: ExprId, required: PropsId) -> Result<StateId, OptimizerError> {
        // Always start with the first expression in the group.
        let group = self.factory.memo().group_of(expr);

        // If this group is already fully optimized, then return the already
        // prepared best expression (it will never get better than this).
        let state_id = self.ensure_state(group, required);
        if self.states.get(state_id).fully_optimized {
            return Ok(state_id);
        }
        self.stats.optimize_group += 1;
        log::debug!("optimize_group: group {} required: {}", group, self.factory.memo().props(required));

        // Iterate until the group has been fully optimized.
        loop {
            let mut fully_optimized = true;

            let mut ord = 0;
            let mut member = Some(self.factory.memo().first_expr(group));
            while let Some(m) = member {
                // If this group member has already been fully optimized for
                // the given required properties, then skip it, since it will
                // not get better.
                if !self.states.get(state_id).is_member_fully_optimized(ord) {
                    let member_optimized = self.optimize_group_member(state_id, m, required)?;

                    // If any of the group members have not yet been fully
                    // optimized, then the group is not yet fully optimized.
                    if member_optimized {
                        self.states.get_mut(state_id).mark_member_fully_optimized(ord)?;
                    } else {
                        fully_optimized = false;
                    }
                }
                ord += 1;
                // The next pointer is read after the member has been
                // optimized: members appended to the chain while this member
                // was being processed are visited in the same pass.
                member = self.factory.memo().next_expr(m);
            }

            // Now try to generate new expressions that are logically
            // equivalent to other expressions in this group. Members appended
            // here are visited by the next iteration of the loop.
            if self.should_explore(required) && !self.explore_group(group, state_id)?.fully_explored {
                fully_optimized = false;
            }

            if fully_optimized {
                self.states.get_mut(state_id).fully_optimized = true;
                break;
            }
        }

        Ok(state_id)
    }

    /// Determines whether the member expression can provide the required
    /// properties. If so, recursively optimizes the expression's child groups
    /// and computes the cost of the expression. In addition, checks whether
    /// enforcers can provide the required properties at a lower cost. The
    /// lowest cost expression is saved into the group state.
    fn optimize_group_member(
        &mut self,
        state_id: StateId,
        member: ExprId,
        required: PropsId,
    ) -> Result<bool, OptimizerError> {
        // Compute the cost for enforcers to provide the required properties.
        // This may be lower than the expression providing the properties
        // itself: sorting the output of a hash join can beat a merge join
        // that requires one of its children to be sorted.
        let mut fully_optimized = self.enforce_props(state_id, member, required)?;

        // If the expression cannot provide the required properties, then do
        // not continue. The case where the expression provides a subset of the
        // properties is taken care of by enforce_props, which recursively
        // optimizes the group with property subsets and then adds enforcers to
        // provide the remainder.
        let provides = {
            let memo = self.factory.memo();
            can_provide_physical_props(memo, member, memo.props(required))
        };
        if provides {
            let mut cost = Cost::ZERO;
            let num_children = self.factory.memo().expr(member).child_count();
            for i in 0..num_children {
                let child = self.factory.memo().expr(member).child(i);

                // Given the properties required of the parent, get the
                // properties required of the i-th child.
                let child_required = build_child_physical_props(self.factory.memo_mut(), member, i, required);

                // Optimize the child with respect to those properties.
                let (child_cost, child_optimized) = self.optimize_expr(child, child_required)?;

                // Accumulate the cost of the children.
                cost += child_cost;

                // If any child expression is not fully optimized, then the
                // parent expression is also not fully optimized.
                if !child_optimized {
                    fully_optimized = false;
                }
            }

            // Check whether this is the new lowest cost expression.
            let member_cost = {
                let memo = self.factory.memo();
                self.coster.compute_cost(memo, member, memo.props(required))
            };
            cost += member_cost;
            self.stats.members_costed += 1;
            self.ratchet_cost(state_id, member, cost);
        }

        Ok(fully_optimized)
    }

    /// Recursively optimizes the children of a scalar expression. This is
    /// only necessary when the scalar expression contains a subquery, since
    /// scalar expressions otherwise always have zero cost and only one
    /// possible plan.
    fn optimize_scalar_expr(&mut self, scalar: ExprId) -> Result<(Cost, bool), OptimizerError> {
        let mut cost = Cost::ZERO;
        let mut fully_optimized = true;
        let num_children = self.factory.memo().expr(scalar).child_count();
        for i in 0..num_children {
            let child = self.factory.memo().expr(scalar).child(i);
            let child_props = build_child_physical_props_scalar(self.factory.memo(), scalar, i);
            let (child_cost, child_optimized) = self.optimize_expr(child, child_props)?;
            cost += child_cost;
            if !child_optimized {
                fully_optimized = false;
            }
        }
        Ok((cost, fully_optimized))
    }

    /// Costs plans where the required ordering is provided by a sort enforcer
    /// on top of the member rather than by the member itself. The member group
    /// is recursively optimized with the ordering stripped off; the recursion
    /// eventually makes its way back here, at which point another property is
    /// stripped, until the group has a lowest cost expression for every
    /// sublist of the required properties.
    fn enforce_props(&mut self, state_id: StateId, member: ExprId, required: PropsId) -> Result<bool, OptimizerError> {
        let required_ordering = self.factory.memo().props(required).ordering().clone();
        if required_ordering.is_any() {
            // Ordering is the only enforceable property.
            return Ok(true);
        }
        let group = self.factory.memo().group_of(member);

        // Try a sort enforcer that requires no ordering from its input.
        let enforcer = RelExpr::Sort {
            input: member,
            input_ordering: OrderingChoice::any(),
        };
        let enforcer_id = self.factory.memo_mut().add_enforcer(enforcer, group);
        let member_props = build_child_physical_props(self.factory.memo_mut(), enforcer_id, 0, required);
        let mut fully_optimized = self.optimize_enforcer(state_id, enforcer_id, required, member, member_props)?;

        // Try a sort enforcer that requires a partial ordering from its input:
        // the interesting ordering that forms the longest common prefix with
        // the required ordering. No enforcer is needed when the required
        // ordering is already implied by the input ordering (in which case the
        // prefix is absent).
        let interesting = derive_interesting_orderings(self.factory.memo(), self.catalog.as_ref(), member);
        if let Some(prefix) = interesting.longest_common_prefix(&required_ordering) {
            let enforcer = RelExpr::Sort {
                input: member,
                input_ordering: prefix,
            };
            let enforcer_id = self.factory.memo_mut().add_enforcer(enforcer, group);
            let member_props = build_child_physical_props(self.factory.memo_mut(), enforcer_id, 0, required);
            if self.optimize_enforcer(state_id, enforcer_id, required, member, member_props)? {
                fully_optimized = true;
            }
        }

        Ok(fully_optimized)
    }

    /// Optimizes and costs the enforcer. The enforcer is fully optimized when
    /// its input expression is fully optimized.
    fn optimize_enforcer(
        &mut self,
        state_id: StateId,
        enforcer: ExprId,
        enforcer_props: PropsId,
        member: ExprId,
        member_props: PropsId,
    ) -> Result<bool, OptimizerError> {
        // Recursively optimize the member group with respect to a subset of
        // the enforcer properties.
        let inner_id = self.optimize_group(member, member_props)?;
        let (inner_cost, inner_fully_optimized, inner_best) = {
            let inner = self.states.get(inner_id);
            (inner.cost, inner.fully_optimized, inner.best)
        };
        if inner_best.is_none() {
            return Err(OptimizerError::internal(format!(
                "Enforcer input group has no best expression: member {}",
                member
            )));
        }

        // Check whether this is the new lowest cost expression with the
        // enforcer added.
        let enforcer_cost = {
            let memo = self.factory.memo();
            self.coster.compute_cost(memo, enforcer, memo.props(enforcer_props))
        };
        self.stats.enforcers_costed += 1;
        self.ratchet_cost(state_id, enforcer, inner_cost + enforcer_cost);

        Ok(inner_fully_optimized)
    }

    /// Exploration is triggered only for optimize_group calls that will not
    /// recurse via enforce_props: exploring a group that will be revisited
    /// with fewer required properties would be redundant work.
    fn should_explore(&self, required: PropsId) -> bool {
        self.factory.memo().props(required).ordering().is_any()
    }

    fn explore_group(&mut self, group: GroupId, state_id: StateId) -> Result<ExploreResult, OptimizerError> {
        let Optimizer {
            factory,
            catalog,
            explorer,
            states,
            matched_rule,
            applied_rule,
            stats,
            ..
        } = self;
        let state = states.get_mut(state_id);
        if state.fully_optimized {
            return Err(OptimizerError::internal(format!(
                "Cannot explore group {}: the state is already fully optimized",
                group
            )));
        }
        stats.exploration_passes += 1;
        let notifier = RuleNotifier::new(matched_rule.clone(), applied_rule.clone());
        explorer.explore_group(factory.memo_mut(), catalog.as_ref(), group, &mut state.explore, &notifier)
    }

    /// Checks whether the candidate expression has a lower cost than the
    /// existing best expression in the group state. If so, the candidate
    /// becomes the new lowest cost expression.
    fn ratchet_cost(&mut self, state_id: StateId, candidate: ExprId, cost: Cost) {
        let state = self.states.get_mut(state_id);
        if state.best.is_none() || cost.less(state.cost) {
            log::debug!("ratchet_cost: candidate {} cost {}", candidate, cost);
            state.best = Some(candidate);
            state.cost = cost;
        }
    }

    /// Traverses the memo and recursively updates child pointers so that they
    /// point to the lowest cost expression tree rather than to the normalized
    /// expression tree. Each expression on the chosen tree is annotated with
    /// the properties required of it, the ordering it provides and its cost.
    pub(crate) fn set_lowest_cost_tree(
        &mut self,
        parent: ExprId,
        parent_props: PropsId,
    ) -> Result<ExprId, OptimizerError> {
        let mut parent = parent;
        let mut best: Option<(ExprId, Cost)> = None;

        match self.factory.memo().expr(parent) {
            Expr::Relational(_) => {
                let group = self.factory.memo().group_of(parent);
                let state_id = self.lookup_state(group, parent_props).ok_or_else(|| {
                    OptimizerError::internal(format!("Group {} has not been optimized", group))
                })?;
                let state = self.states.get(state_id);
                let chosen = state.best.ok_or_else(|| {
                    OptimizerError::internal(format!("Group {} has no best expression", group))
                })?;
                best = Some((chosen, state.cost));
                parent = chosen;
            }
            Expr::Scalar(_) => {
                // Short-circuit traversal of scalar expressions with no nested
                // subquery, since there is only one possible tree.
                if let Some(props) = self.factory.memo().scalar_props(parent) {
                    if !props.has_subquery {
                        return Ok(parent);
                    }
                }
            }
        }

        // Replace any child that has a lower cost alternative.
        let num_children = self.factory.memo().expr(parent).child_count();
        for i in 0..num_children {
            let before = self.factory.memo().expr(parent).child(i);
            let child_props = if best.is_some() {
                build_child_physical_props(self.factory.memo_mut(), parent, i, parent_props)
            } else {
                build_child_physical_props_scalar(self.factory.memo(), parent, i)
            };
            let after = self.set_lowest_cost_tree(before, child_props)?;
            if after != before {
                self.factory.memo_mut().set_child(parent, i, after);
            }
        }

        if let Some((chosen, cost)) = best {
            // The provided ordering depends on the provided orderings of the
            // children, so it must be computed after the recursive calls.
            let memo = self.factory.memo();
            let provided = build_provided(memo, chosen, memo.props(parent_props).ordering());
            self.factory.memo_mut().set_best_props(chosen, parent_props, provided, cost)?;
        }

        Ok(parent)
    }

    /// Tries to simplify the root operator based on the properties required of
    /// it. This may produce a new root and new root properties. The root
    /// properties are re-read from the memo before each rule so no rule can
    /// observe a stale value.
    fn optimize_root_with_props(&mut self) -> Result<(), OptimizerError> {
        let _ = self.root()?;

        // [SimplifyRootOrdering]
        // Removes redundant columns from the root properties, based on the
        // operator's functional dependencies.
        {
            let memo = self.factory.memo();
            let (root, root_props_id) = memo.root().expect("Root has been validated");
            let root_props = memo.props(root_props_id).clone();
            let func_deps = memo.rel_props(root).func_deps.clone();
            if root_props.ordering().can_simplify(&func_deps) && self.rule_matched(RuleName::SimplifyRootOrdering) {
                let mut simplified = root_props;
                simplified.ordering_mut().simplify(&func_deps);
                let memo = self.factory.memo_mut();
                let props_id = memo.intern_props(simplified);
                memo.set_root(root, props_id);
                self.rule_applied(RuleName::SimplifyRootOrdering, None, root);
            }
        }

        // [PruneRootCols]
        // Discards columns that are not needed by the root's ordering or
        // presentation properties.
        {
            let memo = self.factory.memo();
            let (root, root_props_id) = memo.root().expect("Root has been validated");
            let needed = memo.props(root_props_id).col_set();
            let output_columns = memo.rel_props(root).output_columns.clone();
            if !needed.is_subset(&output_columns) {
                return Err(OptimizerError::internal(format!(
                    "Columns required of the root {} must be a subset of its output columns {}",
                    needed, output_columns
                )));
            }
            if self.factory.custom_funcs().can_prune_cols(root, &needed) && self.rule_matched(RuleName::PruneRootCols) {
                let new_root = self.factory.custom_funcs().prune_cols(root, &needed)?;

                // Pruning may have removed a column that the required ordering
                // references.
                let memo = self.factory.memo();
                let root_columns = memo.rel_props(new_root).output_columns.clone();
                let root_props = memo.props(root_props_id).clone();
                if !root_props.ordering().subset_of_cols(&root_columns) {
                    let mut new_props = root_props;
                    new_props.ordering_mut().project_cols(&root_columns);
                    let memo = self.factory.memo_mut();
                    let props_id = memo.intern_props(new_props);
                    memo.set_root(new_root, props_id);
                } else {
                    self.factory.memo_mut().set_root(new_root, root_props_id);
                }
                self.rule_applied(RuleName::PruneRootCols, None, new_root);
            }
        }

        Ok(())
    }

    fn recompute_cost_impl(
        &mut self,
        parent: ExprId,
        parent_props: PropsId,
        coster: &dyn Coster,
    ) -> Result<Cost, OptimizerError> {
        let mut cost = Cost::ZERO;
        let num_children = self.factory.memo().expr(parent).child_count();
        for i in 0..num_children {
            let child = self.factory.memo().expr(parent).child(i);
            let child_props = match self.factory.memo().expr(child) {
                Expr::Relational(_) => match self.factory.memo().best_props(child) {
                    Some(best) => best.required,
                    None => {
                        return Err(OptimizerError::internal(format!(
                            "Expression {} on the chosen plan has no best properties",
                            child
                        )))
                    }
                },
                Expr::Scalar(_) => self.factory.memo().none_props(),
            };
            cost += self.recompute_cost_impl(child, child_props, coster)?;
        }

        if self.factory.memo().expr(parent).is_relational() {
            let parent_cost = {
                let memo = self.factory.memo();
                coster.compute_cost(memo, parent, memo.props(parent_props))
            };
            cost += parent_cost;
            self.factory.memo_mut().reset_cost(parent, cost)?;
        }

        Ok(cost)
    }

    /// Looks up the state associated with the given group and properties.
    fn lookup_state(&self, group: GroupId, required: PropsId) -> Option<StateId> {
        self.state_map.get(&GroupStateKey { group, required }).copied()
    }

    /// Looks up the state associated with the given group and properties,
    /// allocating a new one when none is associated yet.
    fn ensure_state(&mut self, group: GroupId, required: PropsId) -> StateId {
        match self.state_map.entry(GroupStateKey { group, required }) {
            Entry::Occupied(o) => *o.get(),
            Entry::Vacant(v) => {
                let state_id = self.states.allocate(required);
                v.insert(state_id);
                state_id
            }
        }
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

/// Counters kept during one optimization, reported at debug level when the
/// search completes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stats {
    pub optimize_group: usize,
    pub members_costed: usize,
    pub enforcers_costed: usize,
    pub exploration_passes: usize,
}

/// Associates a [GroupState] with a group that is being optimized with respect
/// to a set of required physical properties.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
struct GroupStateKey {
    group: GroupId,
    required: PropsId,
}

/// A stable handle of a [GroupState] in the [StatePool].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct StateId(usize);

/// Temporary storage associated with each `(group, required properties)` pair
/// visited by the search. Stores the running lowest cost expression and the
/// completion flags that let the search short-circuit already traversed parts
/// of the expression tree.
#[derive(Debug)]
pub(crate) struct GroupState {
    /// The lowest cost member (or enforcer on top of a member) found so far
    /// that meets the required properties.
    best: Option<ExprId>,
    /// The cost of `best`. Only meaningful when `best` is present.
    cost: Cost,
    /// The properties that must be provided by the best expression.
    required: PropsId,
    /// Set once the lowest cost expression has been found. A lower cost
    /// expression will never be found, no matter how many additional passes
    /// are made.
    fully_optimized: bool,
    /// Ordinal positions of the group members that are individually known to
    /// be complete for the required properties. These are never recosted.
    fully_optimized_members: BitSet,
    /// Exploration scratch owned by the explorer.
    explore: ExploreState,
}

impl GroupState {
    fn new(required: PropsId) -> Self {
        GroupState {
            best: None,
            cost: Cost::ZERO,
            required,
            fully_optimized: false,
            fully_optimized_members: BitSet::new(),
            explore: ExploreState::default(),
        }
    }

    pub(crate) fn best(&self) -> Option<ExprId> {
        self.best
    }

    pub(crate) fn cost(&self) -> Cost {
        self.cost
    }

    pub(crate) fn required(&self) -> PropsId {
        self.required
    }

    fn is_member_fully_optimized(&self, ord: usize) -> bool {
        self.fully_optimized_members.contains(ord)
    }

    fn mark_member_fully_optimized(&mut self, ord: usize) -> Result<(), OptimizerError> {
        if self.fully_optimized {
            return Err(OptimizerError::internal("Best expression is already fully optimized"));
        }
        if self.is_member_fully_optimized(ord) {
            return Err(OptimizerError::internal(format!(
                "Member {} is already fully optimized for the required properties",
                ord
            )));
        }
        self.fully_optimized_members.insert(ord);
        Ok(())
    }
}

/// Allocates pages of [GroupState] values. Pages have a fixed capacity and are
/// only ever appended, so a state never moves once allocated: references held
/// across recursive calls stay valid while new states are allocated.
pub(crate) struct StatePool {
    pages: Vec<Vec<GroupState>>,
    page_size: usize,
}

impl StatePool {
    fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "page_size must be positive");
        StatePool {
            pages: Vec::new(),
            page_size,
        }
    }

    fn allocate(&mut self, required: PropsId) -> StateId {
        let needs_page = self.pages.last().map_or(true, |p| p.len() == self.page_size);
        if needs_page {
            self.pages.push(Vec::with_capacity(self.page_size));
        }
        let page_index = self.pages.len() - 1;
        let page = &mut self.pages[page_index];
        page.push(GroupState::new(required));
        StateId(page_index * self.page_size + page.len() - 1)
    }

    fn get(&self, id: StateId) -> &GroupState {
        &self.pages[id.0 / self.page_size][id.0 % self.page_size]
    }

    fn get_mut(&mut self, id: StateId) -> &mut GroupState {
        &mut self.pages[id.0 / self.page_size][id.0 % self.page_size]
    }

    fn len(&self) -> usize {
        self.pages.iter().map(|p| p.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::catalog::MutableCatalog;
    use crate::cost::Cost;
    use crate::memo::{ExprId, GroupId};
    use crate::optimizer::{Optimizer, StatePool, STATE_PAGE_SIZE};

    fn new_optimizer() -> Optimizer {
        Optimizer::new(Arc::new(MutableCatalog::new()))
    }

    #[test]
    fn state_pool_allocates_pages() {
        let mut pool = StatePool::new(4);
        let none = crate::memo::Memo::new().none_props();

        let ids: Vec<_> = (0..10).map(|_| pool.allocate(none)).collect();
        assert_eq!(pool.len(), 10, "ten states");
        assert_eq!(pool.pages.len(), 3, "three pages of four");

        for id in ids {
            assert_eq!(pool.get(id).required(), none, "state is reachable");
        }
    }

    #[test]
    fn state_pool_addresses_are_stable() {
        let mut pool = StatePool::new(STATE_PAGE_SIZE);
        let none = crate::memo::Memo::new().none_props();

        let first = pool.allocate(none);
        let address_before = pool.get(first) as *const _;

        for _ in 0..100 {
            pool.allocate(none);
        }
        let address_after = pool.get(first) as *const _;
        assert_eq!(address_before, address_after, "allocations must not move existing states");
    }

    #[test]
    fn mark_member_fully_optimized_twice_fails() {
        let mut pool = StatePool::new(STATE_PAGE_SIZE);
        let none = crate::memo::Memo::new().none_props();
        let id = pool.allocate(none);

        pool.get_mut(id).mark_member_fully_optimized(0).unwrap();
        assert!(pool.get(id).is_member_fully_optimized(0), "marked");

        let res = pool.get_mut(id).mark_member_fully_optimized(0);
        assert!(res.is_err(), "double marking");
    }

    #[test]
    fn mark_member_after_full_optimization_fails() {
        let mut pool = StatePool::new(STATE_PAGE_SIZE);
        let none = crate::memo::Memo::new().none_props();
        let id = pool.allocate(none);

        pool.get_mut(id).fully_optimized = true;
        let res = pool.get_mut(id).mark_member_fully_optimized(0);
        assert!(res.is_err(), "state is complete");
    }

    #[test]
    fn ratchet_cost_is_monotone_and_strict() {
        let mut optimizer = new_optimizer();
        let none = optimizer.memo().none_props();
        let state_id = optimizer.ensure_state(GroupId(0), none);

        let first = ExprId(1);
        let second = ExprId(2);

        optimizer.ratchet_cost(state_id, first, Cost::new(10.0));
        assert_eq!(optimizer.states.get(state_id).best(), Some(first), "first candidate");

        // A more expensive candidate is rejected.
        optimizer.ratchet_cost(state_id, second, Cost::new(12.0));
        assert_eq!(optimizer.states.get(state_id).best(), Some(first), "still the first");

        // A tie is rejected: the first candidate seen wins.
        optimizer.ratchet_cost(state_id, second, Cost::new(10.0));
        assert_eq!(optimizer.states.get(state_id).best(), Some(first), "ties preserve the first");

        // A strictly cheaper candidate wins.
        optimizer.ratchet_cost(state_id, second, Cost::new(9.0));
        assert_eq!(optimizer.states.get(state_id).best(), Some(second), "cheaper candidate");
        assert_eq!(optimizer.states.get(state_id).cost(), Cost::new(9.0), "cost updated");
    }

    #[test]
    fn ensure_state_is_idempotent() {
        let mut optimizer = new_optimizer();
        let none = optimizer.memo().none_props();

        let first = optimizer.ensure_state(GroupId(0), none);
        let second = optimizer.ensure_state(GroupId(0), none);
        assert_eq!(first, second, "one state per key");
        assert_eq!(optimizer.num_group_states(), 1, "single allocation");
    }
}
