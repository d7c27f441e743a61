use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use lfq_common::{LfqError, Result};
use tracing::debug;

use crate::expr::{Expr, Operator, UnaryOp, conjunction, split_conjunction};
use crate::logical_plan::{JoinType, LogicalPlan, Partitioning};
use crate::scalar::ScalarValue;

/// Configuration knobs for rule-based optimization.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    /// Passes over the rule list when no fixpoint is reached earlier.
    pub max_passes: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_passes: 3 }
    }
}

/// One rewrite pass over a logical plan.
///
/// A rule must return a plan producing the same multiset of rows with the
/// same output schema, and must return its input unchanged whenever a
/// precondition for its rewrite does not hold.
pub trait OptimizerRule: Send + Sync {
    /// Stable rule name used by registry and logs.
    fn name(&self) -> &str;
    /// Rewrite input plan and return transformed plan.
    fn rewrite(&self, plan: Arc<LogicalPlan>, cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>>;
}

/// Rule-based optimizer.
///
/// Built-in rules run in a fixed order, followed by user-registered rules in
/// name order. The whole sequence repeats until the plan stops changing or
/// `max_passes` is reached.
pub struct Optimizer {
    rules: Vec<Arc<dyn OptimizerRule>>,
    custom_rules: RwLock<HashMap<String, Arc<dyn OptimizerRule>>>,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .custom_rules
            .read()
            .map(|m| m.len())
            .unwrap_or_default();
        f.debug_struct("Optimizer")
            .field(
                "rules",
                &self.rules.iter().map(|r| r.name().to_string()).collect::<Vec<_>>(),
            )
            .field("custom_rules", &count)
            .finish()
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Optimizer with the built-in rule list.
    ///
    /// Pass order:
    /// 1. expression simplification (constant folding)
    /// 2. filter merge
    /// 3. join key extraction
    /// 4. predicate pushdown
    /// 5. limit pushdown
    /// 6. common subexpression elimination
    /// 7. projection pushdown
    pub fn new() -> Self {
        Self::with_rules(vec![
            Arc::new(SimplifyExpressions),
            Arc::new(MergeFilters),
            Arc::new(ExtractJoinKeys),
            Arc::new(PushDownFilter),
            Arc::new(PushDownLimit),
            Arc::new(CommonSubexprEliminate),
            Arc::new(PushDownProjection),
        ])
    }

    /// Optimizer running exactly `rules` (plus registered custom rules).
    pub fn with_rules(rules: Vec<Arc<dyn OptimizerRule>>) -> Self {
        Self {
            rules,
            custom_rules: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a custom optimizer rule.
    ///
    /// Returns `true` when an existing rule with the same name was replaced.
    pub fn register_rule(&self, rule: Arc<dyn OptimizerRule>) -> bool {
        self.custom_rules
            .write()
            .expect("optimizer rule lock poisoned")
            .insert(rule.name().to_string(), rule)
            .is_some()
    }

    /// Deregister a custom optimizer rule by name.
    ///
    /// Returns `true` when an existing rule was removed.
    pub fn deregister_rule(&self, name: &str) -> bool {
        self.custom_rules
            .write()
            .expect("optimizer rule lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Run the rule list until fixpoint or `cfg.max_passes`.
    ///
    /// Fails with `OptimizationInvariant` if any rule changes the output
    /// column names or types of the plan it was given.
    pub fn optimize(&self, plan: Arc<LogicalPlan>, cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        let mut custom = self
            .custom_rules
            .read()
            .expect("optimizer rule lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect::<Vec<_>>();
        custom.sort_by(|a, b| a.0.cmp(&b.0));
        let rules: Vec<Arc<dyn OptimizerRule>> = self
            .rules
            .iter()
            .cloned()
            .chain(custom.into_iter().map(|(_, r)| r))
            .collect();

        let mut plan = plan;
        for pass in 0..cfg.max_passes.max(1) {
            let before = Arc::clone(&plan);
            for rule in &rules {
                let next = rule.rewrite(Arc::clone(&plan), cfg)?;
                check_schema_preserved(rule.name(), &plan, &next)?;
                if !Arc::ptr_eq(&next, &plan) && next != plan {
                    debug!(rule = rule.name(), pass, "optimizer rule rewrote plan");
                }
                plan = next;
            }
            if Arc::ptr_eq(&before, &plan) || before == plan {
                debug!(passes = pass + 1, "optimizer reached fixpoint");
                break;
            }
        }
        Ok(plan)
    }
}

fn check_schema_preserved(rule: &str, before: &LogicalPlan, after: &LogicalPlan) -> Result<()> {
    let a = before.schema();
    let b = after.schema();
    let same = a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type());
    if same {
        Ok(())
    } else {
        Err(LfqError::OptimizationInvariant(format!(
            "rule '{rule}' changed the output schema from {a:?} to {b:?}"
        )))
    }
}

// -----------------------------
// Tree helpers
// -----------------------------

/// Rebuild `plan` with each input passed through `f`; returns `plan` itself
/// when no input changed.
fn map_inputs(
    plan: &Arc<LogicalPlan>,
    f: &mut dyn FnMut(&Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>>,
) -> Result<Arc<LogicalPlan>> {
    let inputs = plan.inputs();
    if inputs.is_empty() {
        return Ok(Arc::clone(plan));
    }
    let mut changed = false;
    let mut new_inputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let next = f(input)?;
        changed |= !Arc::ptr_eq(&next, input);
        new_inputs.push(next);
    }
    if !changed {
        return Ok(Arc::clone(plan));
    }
    Ok(Arc::new(plan.with_new_inputs(new_inputs)?))
}

/// Rebuild `plan` with each of its own expressions rewritten by `f`.
fn map_exprs(plan: &Arc<LogicalPlan>, f: &dyn Fn(&Expr) -> Result<Expr>) -> Result<Arc<LogicalPlan>> {
    let map_all = |v: &[Expr]| v.iter().map(f).collect::<Result<Vec<_>>>();
    let rebuilt = match plan.as_ref() {
        LogicalPlan::TableScan {
            table,
            source_schema,
            projection,
            filters,
            fetch,
            ..
        } => LogicalPlan::table_scan(
            table.clone(),
            Arc::clone(source_schema),
            projection.clone(),
            filters
                .iter()
                .map(|e| Ok(f(e)?.unalias()))
                .collect::<Result<Vec<_>>>()?,
            *fetch,
        )?,
        LogicalPlan::Projection { exprs, input, .. } => {
            LogicalPlan::projection(Arc::clone(input), map_all(exprs)?)?
        }
        LogicalPlan::Filter { predicate, input } => {
            LogicalPlan::filter(Arc::clone(input), f(predicate)?.unalias())?
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
            ..
        } => LogicalPlan::aggregate(Arc::clone(input), map_all(group_exprs)?, map_all(aggr_exprs)?)?,
        LogicalPlan::Sort { exprs, input } => LogicalPlan::sort(
            Arc::clone(input),
            exprs
                .iter()
                .map(|s| {
                    Ok(crate::expr::SortExpr::new(
                        f(&s.expr)?.unalias(),
                        s.asc,
                        s.nulls_first,
                    ))
                })
                .collect::<Result<Vec<_>>>()?,
        )?,
        LogicalPlan::Join {
            left,
            right,
            on,
            filter,
            join_type,
            ..
        } => LogicalPlan::join(
            Arc::clone(left),
            Arc::clone(right),
            on.iter()
                .map(|(l, r)| Ok((f(l)?.unalias(), f(r)?.unalias())))
                .collect::<Result<Vec<_>>>()?,
            filter.as_ref().map(|e| Ok::<_, LfqError>(f(e)?.unalias())).transpose()?,
            *join_type,
        )?,
        LogicalPlan::Window {
            window_exprs,
            input,
            ..
        } => LogicalPlan::window(Arc::clone(input), map_all(window_exprs)?)?,
        LogicalPlan::Repartition {
            partitioning: Partitioning::Hash(exprs, n),
            input,
        } => LogicalPlan::repartition(
            Arc::clone(input),
            Partitioning::Hash(
                exprs
                    .iter()
                    .map(|e| Ok(f(e)?.unalias()))
                    .collect::<Result<Vec<_>>>()?,
                *n,
            ),
        )?,
        _ => return Ok(Arc::clone(plan)),
    };
    if rebuilt == **plan {
        return Ok(Arc::clone(plan));
    }
    Ok(Arc::new(rebuilt))
}

/// Keep the display name of `original` on a rewritten expression.
fn preserve_name(original: &Expr, rewritten: Expr) -> Expr {
    let name = original.display_name();
    if rewritten.display_name() == name {
        rewritten
    } else {
        rewritten.alias(name)
    }
}

fn dedup_exprs(exprs: Vec<Expr>) -> Vec<Expr> {
    let mut out: Vec<Expr> = Vec::with_capacity(exprs.len());
    for e in exprs {
        if !out.contains(&e) {
            out.push(e);
        }
    }
    out
}

fn with_filter(input: Arc<LogicalPlan>, preds: Vec<Expr>) -> Result<Arc<LogicalPlan>> {
    match conjunction(dedup_exprs(preds)) {
        Some(p) => Ok(Arc::new(LogicalPlan::filter(input, p)?)),
        None => Ok(input),
    }
}

fn rename_columns(e: &Expr, map: &HashMap<String, String>) -> Result<Expr> {
    e.transform_up(&mut |node| {
        Ok(match node {
            Expr::Column(c) => Expr::Column(map.get(&c).cloned().unwrap_or(c)),
            other => other,
        })
    })
}

fn substitute_columns(e: &Expr, map: &HashMap<String, Expr>) -> Result<Expr> {
    e.transform_up(&mut |node| {
        Ok(match node {
            Expr::Column(c) => match map.get(&c) {
                Some(replacement) => replacement.clone(),
                None => Expr::Column(c),
            },
            other => other,
        })
    })
}

/// Map output column names of `plan` to the names of input `i` by position.
fn positional_renames(plan: &LogicalPlan, input: &LogicalPlan) -> HashMap<String, String> {
    plan.schema()
        .fields()
        .iter()
        .zip(input.schema().fields().iter())
        .map(|(o, i)| (o.name().clone(), i.name().clone()))
        .collect()
}

/// Which join input a joined-schema column comes from, with its input name.
enum JoinSide {
    Left,
    Right,
    Both,
    Neither,
}

struct JoinColumns {
    /// Joined output name -> (is_right, name in its input).
    names: HashMap<String, (bool, String)>,
}

impl JoinColumns {
    fn new(left: &LogicalPlan, right: &LogicalPlan) -> Self {
        let fields = crate::logical_plan::join_output_fields(
            left.schema(),
            right.schema(),
            JoinType::Inner,
        );
        let left_width = left.schema().fields().len();
        let names = fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let entry = if i < left_width {
                    (false, left.schema().field(i).name().clone())
                } else {
                    (true, right.schema().field(i - left_width).name().clone())
                };
                (f.name().clone(), entry)
            })
            .collect();
        Self { names }
    }

    fn side(&self, e: &Expr) -> JoinSide {
        let mut left = false;
        let mut right = false;
        for c in e.column_refs() {
            match self.names.get(&c) {
                Some((false, _)) => left = true,
                Some((true, _)) => right = true,
                None => {
                    left = true;
                    right = true;
                }
            }
        }
        match (left, right) {
            (true, false) => JoinSide::Left,
            (false, true) => JoinSide::Right,
            (true, true) => JoinSide::Both,
            (false, false) => JoinSide::Neither,
        }
    }

    /// Rewrite a single-side expression into that side's column names.
    fn localize(&self, e: &Expr) -> Result<Expr> {
        let map: HashMap<String, String> = self
            .names
            .iter()
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect();
        rename_columns(e, &map)
    }
}

// -----------------------------
// 1) Expression simplification
// -----------------------------

/// Folds literal-only subexpressions and trivial boolean identities.
#[derive(Debug, Default)]
pub struct SimplifyExpressions;

impl OptimizerRule for SimplifyExpressions {
    fn name(&self) -> &str {
        "simplify_expressions"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        simplify_plan(&plan)
    }
}

fn simplify_plan(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    let plan = map_inputs(plan, &mut |p| simplify_plan(p))?;
    map_exprs(&plan, &|e| {
        let folded = e.transform_up(&mut |node| Ok(fold_constants_expr(node)))?;
        Ok(preserve_name(e, folded))
    })
}

fn bool_lit(e: &Expr) -> Option<Option<bool>> {
    match e {
        Expr::Literal(ScalarValue::Boolean(b)) => Some(*b),
        _ => None,
    }
}

/// Fold one node whose children are already folded.
pub fn fold_constants_expr(e: Expr) -> Expr {
    match e {
        Expr::Unary { op, expr } => match (op, expr.as_ref()) {
            (UnaryOp::Not, Expr::Literal(ScalarValue::Boolean(b))) => {
                Expr::Literal(ScalarValue::Boolean(b.map(|v| !v)))
            }
            (
                UnaryOp::Not,
                Expr::Unary {
                    op: UnaryOp::Not,
                    expr: inner,
                },
            ) => Expr::clone(inner),
            (UnaryOp::IsNull, Expr::Literal(v)) => Expr::Literal(ScalarValue::Boolean(Some(v.is_null()))),
            (UnaryOp::IsNotNull, Expr::Literal(v)) => {
                Expr::Literal(ScalarValue::Boolean(Some(!v.is_null())))
            }
            (UnaryOp::Negative, Expr::Literal(ScalarValue::Int64(Some(v)))) if *v != i64::MIN => {
                Expr::Literal(ScalarValue::Int64(Some(-v)))
            }
            (UnaryOp::Negative, Expr::Literal(ScalarValue::Int32(Some(v)))) if *v != i32::MIN => {
                Expr::Literal(ScalarValue::Int32(Some(-v)))
            }
            (UnaryOp::Negative, Expr::Literal(ScalarValue::Float64(Some(v)))) => {
                Expr::Literal(ScalarValue::Float64(Some(-v)))
            }
            _ => Expr::Unary { op, expr },
        },
        Expr::BinaryExpr {
            left,
            op: Operator::And,
            right,
        } => match (bool_lit(&left), bool_lit(&right)) {
            (Some(Some(false)), _) | (_, Some(Some(false))) => {
                Expr::Literal(ScalarValue::Boolean(Some(false)))
            }
            (Some(Some(true)), _) => Expr::clone(&right),
            (_, Some(Some(true))) => Expr::clone(&left),
            _ => Expr::BinaryExpr {
                left,
                op: Operator::And,
                right,
            },
        },
        Expr::BinaryExpr {
            left,
            op: Operator::Or,
            right,
        } => match (bool_lit(&left), bool_lit(&right)) {
            (Some(Some(true)), _) | (_, Some(Some(true))) => {
                Expr::Literal(ScalarValue::Boolean(Some(true)))
            }
            (Some(Some(false)), _) => Expr::clone(&right),
            (_, Some(Some(false))) => Expr::clone(&left),
            _ => Expr::BinaryExpr {
                left,
                op: Operator::Or,
                right,
            },
        },
        Expr::BinaryExpr { left, op, right } => {
            if let (Expr::Literal(lv), Expr::Literal(rv)) = (left.as_ref(), right.as_ref()) {
                if let Some(out) = eval_binary(lv, op, rv) {
                    return Expr::Literal(out);
                }
            }
            Expr::BinaryExpr { left, op, right }
        }
        other => other,
    }
}

fn eval_binary(l: &ScalarValue, op: Operator, r: &ScalarValue) -> Option<ScalarValue> {
    use ScalarValue::*;
    if op.is_comparison() {
        if l.data_type() != r.data_type() {
            return None;
        }
        if l.is_null() || r.is_null() {
            return Some(Boolean(None));
        }
        let ord = l.partial_cmp(r)?;
        let b = match op {
            Operator::Eq => ord.is_eq(),
            Operator::NotEq => !ord.is_eq(),
            Operator::Lt => ord.is_lt(),
            Operator::LtEq => ord.is_le(),
            Operator::Gt => ord.is_gt(),
            Operator::GtEq => ord.is_ge(),
            _ => return None,
        };
        return Some(Boolean(Some(b)));
    }
    match (l, op, r) {
        (Int64(Some(a)), Operator::Plus, Int64(Some(b))) => a.checked_add(*b).map(|v| Int64(Some(v))),
        (Int64(Some(a)), Operator::Minus, Int64(Some(b))) => a.checked_sub(*b).map(|v| Int64(Some(v))),
        (Int64(Some(a)), Operator::Multiply, Int64(Some(b))) => {
            a.checked_mul(*b).map(|v| Int64(Some(v)))
        }
        (Int32(Some(a)), Operator::Plus, Int32(Some(b))) => a.checked_add(*b).map(|v| Int32(Some(v))),
        (Int32(Some(a)), Operator::Minus, Int32(Some(b))) => a.checked_sub(*b).map(|v| Int32(Some(v))),
        (Int32(Some(a)), Operator::Multiply, Int32(Some(b))) => {
            a.checked_mul(*b).map(|v| Int32(Some(v)))
        }
        (Float64(Some(a)), Operator::Plus, Float64(Some(b))) => Some(Float64(Some(a + b))),
        (Float64(Some(a)), Operator::Minus, Float64(Some(b))) => Some(Float64(Some(a - b))),
        (Float64(Some(a)), Operator::Multiply, Float64(Some(b))) => Some(Float64(Some(a * b))),
        (Float64(Some(a)), Operator::Divide, Float64(Some(b))) if *b != 0.0 => {
            Some(Float64(Some(a / b)))
        }
        _ => None,
    }
}

// -----------------------------
// 2) Filter merge
// -----------------------------

/// Collapses stacked filters into one and removes always-true filters.
#[derive(Debug, Default)]
pub struct MergeFilters;

impl OptimizerRule for MergeFilters {
    fn name(&self) -> &str {
        "merge_filters"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        merge_filters(&plan)
    }
}

fn merge_filters(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    let plan = map_inputs(plan, &mut |p| merge_filters(p))?;
    if let LogicalPlan::Filter { predicate, input } = plan.as_ref() {
        if bool_lit(predicate) == Some(Some(true)) {
            return Ok(Arc::clone(input));
        }
        if let LogicalPlan::Filter {
            predicate: inner_pred,
            input: inner_input,
        } = input.as_ref()
        {
            // Filter(Filter(x)) => Filter(x) with merged predicate
            let mut preds = split_conjunction(inner_pred);
            preds.extend(split_conjunction(predicate));
            return with_filter(Arc::clone(inner_input), preds);
        }
    }
    Ok(plan)
}

// -----------------------------
// 3) Join key extraction
// -----------------------------

/// Moves `left_expr = right_expr` conjuncts of a join filter into the join's
/// equi-key list; everything else stays as the residual filter.
#[derive(Debug, Default)]
pub struct ExtractJoinKeys;

impl OptimizerRule for ExtractJoinKeys {
    fn name(&self) -> &str {
        "extract_join_keys"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        extract_join_keys(&plan)
    }
}

fn extract_join_keys(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    let plan = map_inputs(plan, &mut |p| extract_join_keys(p))?;
    let LogicalPlan::Join {
        left,
        right,
        on,
        filter: Some(filter),
        join_type,
        ..
    } = plan.as_ref()
    else {
        return Ok(plan);
    };
    let cols = JoinColumns::new(left, right);
    let mut keys = on.clone();
    let mut residual = Vec::new();
    for conjunct in split_conjunction(filter) {
        if let Expr::BinaryExpr {
            left: a,
            op: Operator::Eq,
            right: b,
        } = &conjunct
        {
            let pair = match (cols.side(a), cols.side(b)) {
                (JoinSide::Left, JoinSide::Right) => Some((a, b)),
                (JoinSide::Right, JoinSide::Left) => Some((b, a)),
                _ => None,
            };
            if let Some((l, r)) = pair {
                let key = (cols.localize(l)?, cols.localize(r)?);
                if !keys.contains(&key) {
                    keys.push(key);
                }
                continue;
            }
        }
        residual.push(conjunct);
    }
    if keys.len() == on.len() {
        return Ok(plan);
    }
    debug!(
        extracted = keys.len() - on.len(),
        "join equality predicates promoted to keys"
    );
    Ok(Arc::new(LogicalPlan::join(
        Arc::clone(left),
        Arc::clone(right),
        keys,
        conjunction(residual),
        *join_type,
    )?))
}

// -----------------------------
// 4) Predicate pushdown
// -----------------------------

/// Moves filter conjuncts as close to the scans as join and aggregation
/// semantics allow; conjuncts that cannot move stay where they were.
#[derive(Debug, Default)]
pub struct PushDownFilter;

impl OptimizerRule for PushDownFilter {
    fn name(&self) -> &str {
        "push_down_filter"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        predicate_pushdown(&plan)
    }
}

fn predicate_pushdown(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    match plan.as_ref() {
        LogicalPlan::Filter { predicate, input } => {
            let pushed = push_into(input, split_conjunction(predicate))?;
            if *pushed == **plan {
                return Ok(Arc::clone(plan));
            }
            Ok(pushed)
        }
        _ => map_inputs(plan, &mut |p| predicate_pushdown(p)),
    }
}

/// Plan equivalent to `Filter(preds, input)` with `preds` pushed down.
fn push_into(input: &Arc<LogicalPlan>, preds: Vec<Expr>) -> Result<Arc<LogicalPlan>> {
    if preds.is_empty() {
        return predicate_pushdown(input);
    }
    let preds = dedup_exprs(preds);
    match input.as_ref() {
        LogicalPlan::Filter {
            predicate,
            input: inner,
        } => {
            let mut all = split_conjunction(predicate);
            all.extend(preds);
            push_into(inner, all)
        }
        LogicalPlan::Projection { exprs, input: inner, .. } => {
            let map: HashMap<String, Expr> = exprs
                .iter()
                .map(|e| (e.display_name(), e.clone().unalias()))
                .collect();
            let substituted = preds
                .iter()
                .map(|p| substitute_columns(p, &map))
                .collect::<Result<Vec<_>>>()?;
            let new_inner = push_into(inner, substituted)?;
            Ok(Arc::new(input.with_new_inputs(vec![new_inner])?))
        }
        LogicalPlan::Sort { input: inner, .. }
        | LogicalPlan::Distinct { input: inner }
        | LogicalPlan::Repartition { input: inner, .. } => {
            let new_inner = push_into(inner, preds)?;
            Ok(Arc::new(input.with_new_inputs(vec![new_inner])?))
        }
        LogicalPlan::Union { inputs, .. } => {
            let mut new_inputs = Vec::with_capacity(inputs.len());
            for child in inputs {
                let renames = positional_renames(input, child);
                let renamed = preds
                    .iter()
                    .map(|p| rename_columns(p, &renames))
                    .collect::<Result<Vec<_>>>()?;
                new_inputs.push(push_into(child, renamed)?);
            }
            Ok(Arc::new(input.with_new_inputs(new_inputs)?))
        }
        LogicalPlan::SetOperation { left, right, .. } => {
            let renames = positional_renames(input, right);
            let right_preds = preds
                .iter()
                .map(|p| rename_columns(p, &renames))
                .collect::<Result<Vec<_>>>()?;
            let new_left = push_into(left, preds)?;
            let new_right = push_into(right, right_preds)?;
            Ok(Arc::new(input.with_new_inputs(vec![new_left, new_right])?))
        }
        LogicalPlan::Aggregate {
            group_exprs,
            input: inner,
            ..
        } => {
            let group_map: HashMap<String, Expr> = group_exprs
                .iter()
                .map(|g| (g.display_name(), g.clone().unalias()))
                .collect();
            let mut push = Vec::new();
            let mut keep = Vec::new();
            for p in preds {
                let cols = p.column_refs();
                if !cols.is_empty() && cols.iter().all(|c| group_map.contains_key(c)) {
                    push.push(substitute_columns(&p, &group_map)?);
                } else {
                    keep.push(p);
                }
            }
            let new_inner = push_into(inner, push)?;
            let rebuilt = map_inputs(input, &mut |_| Ok(Arc::clone(&new_inner)))?;
            with_filter(rebuilt, keep)
        }
        LogicalPlan::Window {
            window_exprs,
            input: inner,
            ..
        } => {
            let mut common: Option<BTreeSet<String>> = None;
            for w in window_exprs {
                let parts: BTreeSet<String> = match w.clone().unalias() {
                    Expr::WindowCall { partition_by, .. } => partition_by
                        .iter()
                        .filter_map(|p| match p {
                            Expr::Column(c) => Some(c.clone()),
                            _ => None,
                        })
                        .collect(),
                    _ => BTreeSet::new(),
                };
                common = Some(match common {
                    None => parts,
                    Some(c) => c.intersection(&parts).cloned().collect(),
                });
            }
            let common = common.unwrap_or_default();
            let (push, keep): (Vec<_>, Vec<_>) = preds.into_iter().partition(|p| {
                let cols = p.column_refs();
                !cols.is_empty() && cols.is_subset(&common)
            });
            let new_inner = push_into(inner, push)?;
            let rebuilt = map_inputs(input, &mut |_| Ok(Arc::clone(&new_inner)))?;
            with_filter(rebuilt, keep)
        }
        LogicalPlan::Unnest {
            columns,
            input: inner,
            ..
        } => {
            let (push, keep): (Vec<_>, Vec<_>) = preds
                .into_iter()
                .partition(|p| p.column_refs().iter().all(|c| !columns.contains(c)));
            let new_inner = push_into(inner, push)?;
            let rebuilt = map_inputs(input, &mut |_| Ok(Arc::clone(&new_inner)))?;
            with_filter(rebuilt, keep)
        }
        LogicalPlan::Join {
            left,
            right,
            on,
            filter,
            join_type,
            ..
        } => push_into_join(left, right, on, filter.as_ref(), *join_type, preds),
        LogicalPlan::TableScan {
            table,
            source_schema,
            projection,
            filters,
            fetch,
            ..
        } => {
            if fetch.is_some() {
                // A fetch hint counts rows before filtering; keep the filter above.
                return with_filter(Arc::clone(input), preds);
            }
            let mut all = filters.clone();
            for p in preds {
                if !all.contains(&p) {
                    all.push(p);
                }
            }
            Ok(Arc::new(LogicalPlan::table_scan(
                table.clone(),
                Arc::clone(source_schema),
                projection.clone(),
                all,
                *fetch,
            )?))
        }
        LogicalPlan::Limit { .. } => {
            let new_input = predicate_pushdown(input)?;
            with_filter(new_input, preds)
        }
    }
}

fn push_into_join(
    left: &Arc<LogicalPlan>,
    right: &Arc<LogicalPlan>,
    on: &[(Expr, Expr)],
    filter: Option<&Expr>,
    join_type: JoinType,
    preds: Vec<Expr>,
) -> Result<Arc<LogicalPlan>> {
    let cols = JoinColumns::new(left, right);
    let mut left_push = Vec::new();
    let mut right_push = Vec::new();
    let mut join_filter: Vec<Expr> = filter.map(split_conjunction).unwrap_or_default();
    let mut keep = Vec::new();

    // Conjuncts of the WHERE clause above the join.
    for p in preds {
        match (cols.side(&p), join_type) {
            (JoinSide::Left, JoinType::Inner | JoinType::Left | JoinType::Semi | JoinType::Anti) => {
                left_push.push(cols.localize(&p)?)
            }
            (JoinSide::Right, JoinType::Inner | JoinType::Right) => right_push.push(cols.localize(&p)?),
            (JoinSide::Both, JoinType::Inner) => join_filter.push(p),
            _ => keep.push(p),
        }
    }

    // Conjuncts of the ON clause that only restrict the non-preserved side.
    let mut residual = Vec::new();
    for p in join_filter {
        match (cols.side(&p), join_type) {
            (JoinSide::Left, JoinType::Inner | JoinType::Right | JoinType::Semi) => {
                left_push.push(cols.localize(&p)?)
            }
            (
                JoinSide::Right,
                JoinType::Inner | JoinType::Left | JoinType::Semi | JoinType::Anti,
            ) => right_push.push(cols.localize(&p)?),
            _ => residual.push(p),
        }
    }
    let new_left = push_into(left, left_push)?;
    let new_right = push_into(right, right_push)?;
    let join = Arc::new(LogicalPlan::join(
        new_left,
        new_right,
        on.to_vec(),
        conjunction(dedup_exprs(residual)),
        join_type,
    )?);
    with_filter(join, keep)
}

// -----------------------------
// 5) Limit pushdown
// -----------------------------

/// Merges stacked limits and pushes row caps below projections, into union
/// inputs, into the preserved side of outer joins, and into scans.
#[derive(Debug, Default)]
pub struct PushDownLimit;

impl OptimizerRule for PushDownLimit {
    fn name(&self) -> &str {
        "push_down_limit"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        limit_pushdown(&plan)
    }
}

/// Cap `child` at `n` rows unless it already is capped at most that tightly.
fn cap_rows(child: &Arc<LogicalPlan>, n: usize) -> Arc<LogicalPlan> {
    if let LogicalPlan::Limit {
        skip: 0,
        fetch: Some(f),
        ..
    } = child.as_ref()
    {
        if *f <= n {
            return Arc::clone(child);
        }
    }
    Arc::new(LogicalPlan::limit(Arc::clone(child), 0, Some(n)))
}

fn limit_pushdown(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    let plan = map_inputs(plan, &mut |p| limit_pushdown(p))?;
    let LogicalPlan::Limit { skip, fetch, input } = plan.as_ref() else {
        return Ok(plan);
    };
    let (skip, fetch) = (*skip, *fetch);
    match input.as_ref() {
        LogicalPlan::Limit {
            skip: inner_skip,
            fetch: inner_fetch,
            input: inner,
        } => {
            let merged_skip = inner_skip.saturating_add(skip);
            let merged_fetch = match inner_fetch {
                None => fetch,
                Some(f) => {
                    let remaining = f.saturating_sub(skip);
                    Some(fetch.map_or(remaining, |o| o.min(remaining)))
                }
            };
            limit_pushdown(&Arc::new(LogicalPlan::limit(
                Arc::clone(inner),
                merged_skip,
                merged_fetch,
            )))
        }
        LogicalPlan::Projection { input: inner, .. } => {
            let limited = Arc::new(LogicalPlan::limit(Arc::clone(inner), skip, fetch));
            let limited = limit_pushdown(&limited)?;
            Ok(Arc::new(input.with_new_inputs(vec![limited])?))
        }
        LogicalPlan::Union { inputs, .. } => {
            let Some(f) = fetch else {
                return Ok(plan);
            };
            let n = skip.saturating_add(f);
            let capped: Vec<_> = inputs.iter().map(|c| cap_rows(c, n)).collect();
            if capped.iter().zip(inputs).all(|(a, b)| Arc::ptr_eq(a, b)) {
                return Ok(plan);
            }
            let union = Arc::new(input.with_new_inputs(capped)?);
            Ok(Arc::new(LogicalPlan::limit(union, skip, fetch)))
        }
        LogicalPlan::Join {
            left,
            right,
            join_type,
            ..
        } if fetch.is_some() && matches!(join_type, JoinType::Left | JoinType::Right) => {
            let n = skip.saturating_add(fetch.unwrap_or_default());
            let (new_left, new_right) = match join_type {
                JoinType::Left => (cap_rows(left, n), Arc::clone(right)),
                _ => (Arc::clone(left), cap_rows(right, n)),
            };
            if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                return Ok(plan);
            }
            let join = Arc::new(input.with_new_inputs(vec![new_left, new_right])?);
            Ok(Arc::new(LogicalPlan::limit(join, skip, fetch)))
        }
        LogicalPlan::TableScan {
            table,
            source_schema,
            projection,
            filters,
            fetch: scan_fetch,
            ..
        } if filters.is_empty() && fetch.is_some() => {
            let n = skip.saturating_add(fetch.unwrap_or_default());
            if scan_fetch.is_some_and(|f| f <= n) {
                return Ok(plan);
            }
            let scan = Arc::new(LogicalPlan::table_scan(
                table.clone(),
                Arc::clone(source_schema),
                projection.clone(),
                vec![],
                Some(n),
            )?);
            Ok(Arc::new(LogicalPlan::limit(scan, skip, fetch)))
        }
        _ => Ok(plan),
    }
}

// -----------------------------
// 6) Common subexpression elimination
// -----------------------------

/// Computes expressions repeated within one projection once, in a
/// projection below it, as `__common_expr_<n>` columns.
#[derive(Debug, Default)]
pub struct CommonSubexprEliminate;

impl OptimizerRule for CommonSubexprEliminate {
    fn name(&self) -> &str {
        "common_subexpr_eliminate"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        cse(&plan)
    }
}

fn is_cse_candidate(e: &Expr) -> bool {
    matches!(
        e,
        Expr::BinaryExpr { .. }
            | Expr::Unary { .. }
            | Expr::Cast { .. }
            | Expr::ScalarFunction { .. }
            | Expr::InList { .. }
    )
}

fn count_subexprs(e: &Expr, counts: &mut Vec<(Expr, usize)>) {
    if is_cse_candidate(e) {
        match counts.iter_mut().find(|(x, _)| x == e) {
            Some((_, n)) => *n += 1,
            None => counts.push((e.clone(), 1)),
        }
    }
    for c in e.children() {
        count_subexprs(c, counts);
    }
}

fn cse(plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
    let plan = map_inputs(plan, &mut |p| cse(p))?;
    let LogicalPlan::Projection { exprs, input, .. } = plan.as_ref() else {
        return Ok(plan);
    };
    let mut counts = Vec::new();
    for e in exprs {
        count_subexprs(e, &mut counts);
    }
    let repeated: Vec<Expr> = counts
        .iter()
        .filter(|(_, n)| *n > 1)
        .map(|(e, _)| e.clone())
        .collect();
    // Only the outermost repeated expressions; their children come along.
    let chosen: Vec<Expr> = repeated
        .iter()
        .filter(|e| {
            !repeated
                .iter()
                .any(|outer| outer != *e && outer.exists(&|x| x == *e))
        })
        .cloned()
        .collect();
    if chosen.is_empty() {
        return Ok(plan);
    }

    let taken: BTreeSet<String> = input.output_columns().into_iter().collect();
    let mut next_id = 1usize;
    let mut named: Vec<(Expr, String)> = Vec::with_capacity(chosen.len());
    for e in chosen {
        let mut name = format!("__common_expr_{next_id}");
        while taken.contains(&name) {
            next_id += 1;
            name = format!("__common_expr_{next_id}");
        }
        next_id += 1;
        named.push((e, name));
    }

    let mut inner_exprs: Vec<Expr> = input
        .output_columns()
        .into_iter()
        .map(Expr::Column)
        .collect();
    inner_exprs.extend(named.iter().map(|(e, n)| e.clone().alias(n.clone())));
    let inner = Arc::new(LogicalPlan::projection(Arc::clone(input), inner_exprs)?);

    let outer_exprs = exprs
        .iter()
        .map(|e| {
            let rewritten = replace_common(e, &named)?;
            Ok(preserve_name(e, rewritten))
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(count = named.len(), "common subexpressions extracted");
    Ok(Arc::new(LogicalPlan::projection(inner, outer_exprs)?))
}

fn replace_common(e: &Expr, named: &[(Expr, String)]) -> Result<Expr> {
    if let Some((_, name)) = named.iter().find(|(x, _)| x == e) {
        return Ok(Expr::Column(name.clone()));
    }
    e.map_children(&mut |c| replace_common(c, named))
}

// -----------------------------
// 7) Projection pushdown
// -----------------------------

/// Narrows every operator to the columns its ancestors actually use.
#[derive(Debug, Default)]
pub struct PushDownProjection;

impl OptimizerRule for PushDownProjection {
    fn name(&self) -> &str {
        "push_down_projection"
    }

    fn rewrite(&self, plan: Arc<LogicalPlan>, _cfg: &OptimizerConfig) -> Result<Arc<LogicalPlan>> {
        projection_pushdown(&plan, None)
    }
}

fn expr_columns(exprs: &[&Expr]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for e in exprs {
        out.extend(e.column_refs());
    }
    out
}

fn union_req(required: Option<&BTreeSet<String>>, extra: BTreeSet<String>) -> Option<BTreeSet<String>> {
    required.map(|r| r.union(&extra).cloned().collect())
}

fn rebuild_single(
    plan: &Arc<LogicalPlan>,
    input: &Arc<LogicalPlan>,
    required: Option<BTreeSet<String>>,
) -> Result<Arc<LogicalPlan>> {
    let new_input = projection_pushdown(input, required.as_ref())?;
    if Arc::ptr_eq(&new_input, input) {
        return Ok(Arc::clone(plan));
    }
    Ok(Arc::new(plan.with_new_inputs(vec![new_input])?))
}

/// `required == None` means every output column must be kept as is.
fn projection_pushdown(
    plan: &Arc<LogicalPlan>,
    required: Option<&BTreeSet<String>>,
) -> Result<Arc<LogicalPlan>> {
    match plan.as_ref() {
        LogicalPlan::TableScan {
            table,
            source_schema,
            projection,
            filters,
            fetch,
            ..
        } => {
            let Some(required) = required else {
                return Ok(Arc::clone(plan));
            };
            let mut needed = required.clone();
            needed.extend(expr_columns(&filters.iter().collect::<Vec<_>>()));
            let current: Vec<usize> = projection
                .clone()
                .unwrap_or_else(|| (0..source_schema.fields().len()).collect());
            let mut indices: Vec<usize> = current
                .iter()
                .copied()
                .filter(|&i| needed.contains(source_schema.field(i).name()))
                .collect();
            if indices.is_empty() {
                // Keep one column so batches still carry a row count.
                if let Some(&first) = current.first() {
                    indices.push(first);
                }
            }
            if Some(&indices) == projection.as_ref() {
                return Ok(Arc::clone(plan));
            }
            if projection.is_none() && indices.len() == source_schema.fields().len() {
                return Ok(Arc::clone(plan));
            }
            Ok(Arc::new(LogicalPlan::table_scan(
                table.clone(),
                Arc::clone(source_schema),
                Some(indices),
                filters.clone(),
                *fetch,
            )?))
        }
        LogicalPlan::Projection { exprs, input, .. } => {
            let kept: Vec<Expr> = match required {
                Some(req) => {
                    let mut kept: Vec<Expr> = exprs
                        .iter()
                        .filter(|e| req.contains(&e.display_name()))
                        .cloned()
                        .collect();
                    if kept.is_empty() {
                        kept.extend(exprs.first().cloned());
                    }
                    kept
                }
                None => exprs.clone(),
            };
            let child_req = expr_columns(&kept.iter().collect::<Vec<_>>());
            let new_input = projection_pushdown(input, Some(&child_req))?;
            if kept.len() == exprs.len() && Arc::ptr_eq(&new_input, input) {
                return Ok(Arc::clone(plan));
            }
            Ok(Arc::new(LogicalPlan::projection(new_input, kept)?))
        }
        LogicalPlan::Filter { input, .. }
        | LogicalPlan::Sort { input, .. }
        | LogicalPlan::Repartition { input, .. } => {
            let extra = expr_columns(&plan.expressions());
            rebuild_single(plan, input, union_req(required, extra))
        }
        LogicalPlan::Limit { input, .. } => rebuild_single(plan, input, required.cloned()),
        LogicalPlan::Distinct { input } => rebuild_single(plan, input, None),
        LogicalPlan::Union { .. } | LogicalPlan::SetOperation { .. } => {
            map_inputs(plan, &mut |p| projection_pushdown(p, None))
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
            ..
        } => {
            let kept_aggs: Vec<Expr> = match required {
                Some(req) => aggr_exprs
                    .iter()
                    .filter(|a| req.contains(&a.display_name()))
                    .cloned()
                    .collect(),
                None => aggr_exprs.clone(),
            };
            let kept_aggs = if kept_aggs.is_empty() && group_exprs.is_empty() {
                aggr_exprs.iter().take(1).cloned().collect()
            } else {
                kept_aggs
            };
            let refs: Vec<&Expr> = group_exprs.iter().chain(kept_aggs.iter()).collect();
            let new_input = projection_pushdown(input, Some(&expr_columns(&refs)))?;
            if kept_aggs.len() == aggr_exprs.len() && Arc::ptr_eq(&new_input, input) {
                return Ok(Arc::clone(plan));
            }
            Ok(Arc::new(LogicalPlan::aggregate(
                new_input,
                group_exprs.clone(),
                kept_aggs,
            )?))
        }
        LogicalPlan::Window {
            window_exprs,
            input,
            ..
        } => {
            let kept: Vec<Expr> = match required {
                Some(req) => window_exprs
                    .iter()
                    .filter(|w| req.contains(&w.display_name()))
                    .cloned()
                    .collect(),
                None => window_exprs.clone(),
            };
            if kept.is_empty() {
                // Window output unused: the node reduces to its input.
                return projection_pushdown(input, required);
            }
            let child_req = required.map(|req| {
                let inputs: BTreeSet<String> = input.output_columns().into_iter().collect();
                let mut r: BTreeSet<String> = req.intersection(&inputs).cloned().collect();
                r.extend(expr_columns(&kept.iter().collect::<Vec<_>>()));
                r
            });
            let new_input = projection_pushdown(input, child_req.as_ref())?;
            if kept.len() == window_exprs.len() && Arc::ptr_eq(&new_input, input) {
                return Ok(Arc::clone(plan));
            }
            Ok(Arc::new(LogicalPlan::window(new_input, kept)?))
        }
        LogicalPlan::Unnest { columns, input, .. } => {
            let extra: BTreeSet<String> = columns.iter().cloned().collect();
            rebuild_single(plan, input, union_req(required, extra))
        }
        LogicalPlan::Join {
            left,
            right,
            on,
            filter,
            join_type,
            ..
        } => {
            let cols = JoinColumns::new(left, right);
            let mut needed: BTreeSet<String> = match required {
                Some(r) => r.clone(),
                None => plan.output_columns().into_iter().collect(),
            };
            if let Some(f) = filter {
                needed.extend(f.column_refs());
            }
            let mut left_req: BTreeSet<String> = BTreeSet::new();
            let mut right_req: BTreeSet<String> = BTreeSet::new();
            for name in &needed {
                match cols.names.get(name) {
                    Some((false, n)) => {
                        left_req.insert(n.clone());
                    }
                    Some((true, n)) => {
                        right_req.insert(n.clone());
                    }
                    None => {}
                }
            }
            for (l, r) in on {
                left_req.extend(l.column_refs());
                right_req.extend(r.column_refs());
            }
            let new_left = projection_pushdown(left, Some(&left_req))?;
            let new_right = projection_pushdown(right, Some(&right_req))?;
            if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                return Ok(Arc::clone(plan));
            }
            let candidate = LogicalPlan::join(
                new_left,
                new_right,
                on.clone(),
                filter.clone(),
                *join_type,
            )?;
            // Pruning the left side can undo a `_right` rename; only accept
            // the narrower join when every needed name keeps its type.
            let stable = needed.iter().all(|n| {
                match (
                    plan.schema().field_with_name(n),
                    candidate.schema().field_with_name(n),
                ) {
                    (Ok(a), Ok(b)) => a.data_type() == b.data_type(),
                    _ => false,
                }
            }) && filter.as_ref().map_or(true, |f| {
                let full = JoinColumns::new(
                    candidate.inputs()[0],
                    candidate.inputs()[1],
                );
                f.column_refs().iter().all(|c| {
                    full.names.get(c) == cols.names.get(c)
                })
            });
            if stable {
                Ok(Arc::new(candidate))
            } else {
                map_inputs(plan, &mut |p| projection_pushdown(p, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::LogicalPlanBuilder;
    use crate::expr_fn::{col, lit};
    use arrow_schema::{DataType, Field, Schema};

    fn scan(name: &str) -> LogicalPlanBuilder {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, true),
            Field::new("c", DataType::Utf8, true),
        ]));
        LogicalPlanBuilder::scan(name, schema).expect("scan")
    }

    #[test]
    fn constant_folding_keeps_projection_names() {
        let plan = scan("t")
            .select(vec![col("a") + (lit(1i64) + lit(2i64))])
            .expect("select")
            .build();
        let folded = SimplifyExpressions
            .rewrite(Arc::clone(&plan), &OptimizerConfig::default())
            .expect("fold");
        assert_eq!(folded.output_columns(), plan.output_columns());
        let LogicalPlan::Projection { exprs, .. } = folded.as_ref() else {
            panic!("projection expected");
        };
        assert_eq!(exprs[0].clone().unalias(), col("a") + lit(3i64));
    }

    #[test]
    fn true_filter_is_removed() {
        let plan = scan("t")
            .filter(vec![lit(true)])
            .expect("filter")
            .build();
        let out = MergeFilters
            .rewrite(plan, &OptimizerConfig::default())
            .expect("merge");
        assert!(matches!(out.as_ref(), LogicalPlan::TableScan { .. }));
    }

    #[test]
    fn failing_invariant_is_reported() {
        struct DropColumns;
        impl OptimizerRule for DropColumns {
            fn name(&self) -> &str {
                "drop_columns"
            }
            fn rewrite(
                &self,
                plan: Arc<LogicalPlan>,
                _cfg: &OptimizerConfig,
            ) -> Result<Arc<LogicalPlan>> {
                Ok(Arc::new(LogicalPlan::projection(plan, vec![col("a")])?))
            }
        }
        let opt = Optimizer::with_rules(vec![Arc::new(DropColumns)]);
        let err = opt
            .optimize(scan("t").build(), &OptimizerConfig::default())
            .expect_err("schema changed");
        assert!(matches!(err, LfqError::OptimizationInvariant(_)), "{err}");
    }
}
