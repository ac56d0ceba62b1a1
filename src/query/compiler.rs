//! IR → pipeline translation and evaluation (spec §4.7).
//!
//! Per SPEC_FULL §4.2, this targets an in-process embedded engine with no
//! distributed worker pool: the pipeline is a direct, single-threaded
//! evaluator over typed batches that mirrors the *contract* of
//! `map`/`filter`/`join`/`consolidate`/`reduce`/`output` rather than
//! constructing an actual distributed dataflow graph per query. Each
//! call to [`CompiledQuery::evaluate`] recomputes the full result set from
//! the current visible state of every referenced collection; the diff
//! against the previous materialization (net +1 → insert/update, net −1 →
//! delete) is computed one layer up, in [`crate::live_query`] (spec §4.8),
//! which is where the `(key, value, Δ)` multiplicity discipline is actually
//! realized as a stream of `ChangeMessage`s.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{CoreError, CoreResult};
use crate::key::{composite_key, Key};
use crate::query::functions::{eval_agg, eval_predicate, eval_scalar};
use crate::query::ir::{JoinKind, OrderDirection, NullsOrder, Projection, QueryIr, Source, SPREAD_SENTINEL};
use crate::query::namespaced::{KeyedRow, NamespacedRow};
use crate::query::optimizer::optimize;
use crate::value::{universal_cmp, DynValue};

/// Resolves a named collection to its current visible rows (spec §4.7.1
/// step 2 "look up input stream by collection.id"). Implemented by
/// [`crate::runtime::Runtime`] for real collections; tests may implement it
/// directly over a plain map.
pub trait CollectionSource {
    fn visible_rows(&self, name: &str) -> Option<Vec<(Key, serde_json::Value)>>;
}

/// Per-evaluation subquery cache, keyed by `QueryIr` pointer identity (spec
/// §4.7.1 step 2 "recursive compile with shared compilation cache keyed by
/// IR identity", §8 property 6). Scoped to one top-level `evaluate` call —
/// there is no cross-call memoization since this engine recomputes from
/// scratch on every sync notification (see module docs).
#[derive(Default)]
struct CompileCache(RefCell<HashMap<usize, Rc<Vec<KeyedRow>>>>);

impl CompileCache {
    fn get_or_compute(
        &self,
        ir: &Rc<QueryIr>,
        source: &dyn CollectionSource,
    ) -> CoreResult<Rc<Vec<KeyedRow>>> {
        let ptr = Rc::as_ptr(ir) as usize;
        if let Some(cached) = self.0.borrow().get(&ptr) {
            return Ok(cached.clone());
        }
        let rows = Rc::new(run_query(ir, source, self)?);
        self.0.borrow_mut().insert(ptr, rows.clone());
        Ok(rows)
    }
}

/// A query, optimized once at construction (spec §4.7.1 step 1).
pub struct CompiledQuery {
    optimized: Rc<QueryIr>,
}

impl CompiledQuery {
    pub fn compile(query: &QueryIr) -> Self {
        CompiledQuery { optimized: Rc::new(optimize(query)) }
    }

    /// Evaluates the full pipeline against `source`, returning `(key,
    /// selectResults)` pairs (spec §4.7.1 step 10).
    pub fn evaluate(&self, source: &dyn CollectionSource) -> CoreResult<Vec<(Key, serde_json::Value)>> {
        let cache = CompileCache::default();
        let rows = cache.get_or_compute(&self.optimized, source)?;
        Ok(rows
            .iter()
            .map(|r| {
                let value = r.row.select_result().cloned().unwrap_or_else(|| {
                    // No explicit select: spec §4.7.1 step 7 default — the
                    // main alias's record when unambiguous.
                    r.row.get(self.optimized.from.alias()).cloned().unwrap_or(serde_json::Value::Null)
                });
                (r.key.clone(), value)
            })
            .collect())
    }
}

fn resolve_source(
    source: &Source,
    resolver: &dyn CollectionSource,
    cache: &CompileCache,
) -> CoreResult<Vec<KeyedRow>> {
    match source {
        Source::CollectionRef { collection, alias } => {
            let rows = resolver
                .visible_rows(collection)
                .ok_or_else(|| CoreError::Query(format!("unknown collection source `{collection}`")))?;
            Ok(rows
                .into_iter()
                .map(|(key, value)| KeyedRow::new(key, NamespacedRow::single(alias.clone(), value)))
                .collect())
        }
        Source::QueryRef { query, alias } => {
            let rows = cache.get_or_compute(query, resolver)?;
            // Re-namespace the subquery's projected result under this
            // source's alias, so an outer query can still `Ref{[alias,
            // field]}` into it (spec §4.7.1 step 2: a `QueryRef` recursively
            // compiles, and its output rejoins the namespaced-row world).
            Ok(rows
                .iter()
                .map(|r| {
                    let value = r.row.select_result().cloned().unwrap_or(serde_json::Value::Null);
                    KeyedRow::new(r.key.clone(), NamespacedRow::single(alias.clone(), value))
                })
                .collect())
        }
    }
}

/// Runs one `QueryIr` node end to end (spec §4.7.1 steps 3-10), assuming it
/// has already been optimized.
fn run_query(ir: &Rc<QueryIr>, resolver: &dyn CollectionSource, cache: &CompileCache) -> CoreResult<Vec<KeyedRow>> {
    // Steps 3-4: load main source, then fold in joins in declared order.
    let mut rows = resolve_source(&ir.from, resolver, cache)?;

    for join in &ir.join {
        rows = apply_join(rows, join, resolver, cache)?;
    }

    // Step 5-6: WHERE (AND semantics) + functional WHERE.
    let mut filtered = Vec::with_capacity(rows.len());
    for r in rows {
        let mut keep = true;
        for clause in &ir.r#where {
            if !eval_predicate(clause, &r.row)? {
                keep = false;
                break;
            }
        }
        if keep {
            for f in &ir.fn_where {
                if !f(&r.row) {
                    keep = false;
                    break;
                }
            }
        }
        if keep {
            filtered.push(r);
        }
    }
    rows = filtered;

    // Step 8: GROUP BY / aggregates / HAVING.
    let grouping_active = !ir.group_by.is_empty() || ir.select_has_agg();
    if !ir.having.is_empty() && !grouping_active {
        return Err(CoreError::Query("HAVING without GROUP BY or aggregates".into()));
    }
    if grouping_active {
        rows = apply_group_by(rows, ir)?;
    }

    // Step 7: SELECT (after grouping, so aggregates see their group).
    rows = apply_select(rows, ir)?;

    // Step 9: ORDER BY / LIMIT / OFFSET.
    if (ir.limit.is_some() || ir.offset.is_some()) && ir.order_by.is_empty() {
        return Err(CoreError::Query("LIMIT/OFFSET without ORDER BY".into()));
    }
    if !ir.order_by.is_empty() {
        rows = apply_order_by(rows, ir)?;
    }
    if let Some(offset) = ir.offset {
        rows = rows.into_iter().skip(offset).collect();
    }
    if let Some(limit) = ir.limit {
        rows.truncate(limit);
    }

    Ok(rows)
}

/// Spec §4.7.1 step 4: compile the join source, evaluate left/right keys,
/// run the appropriate outer/inner join, filter pairs by join kind, merge
/// namespaces (right overwrites), and synthesize a composite result key.
fn apply_join(
    left_rows: Vec<KeyedRow>,
    join: &crate::query::ir::JoinClause,
    resolver: &dyn CollectionSource,
    cache: &CompileCache,
) -> CoreResult<Vec<KeyedRow>> {
    let right_rows = resolve_source(&join.source, resolver, cache)?;

    let mut right_by_value: HashMap<DynValue, Vec<&KeyedRow>> = HashMap::new();
    for r in &right_rows {
        let v = eval_scalar(&join.right, &r.row)?;
        right_by_value.entry(v).or_default().push(r);
    }

    let mut matched_right: std::collections::HashSet<Key> = std::collections::HashSet::new();
    let mut out = Vec::new();

    for l in &left_rows {
        let lv = eval_scalar(&join.left, &l.row)?;
        let matches = right_by_value.get(&lv).cloned().unwrap_or_default();
        if matches.is_empty() {
            if matches!(join.kind, JoinKind::Left | JoinKind::Full) {
                out.push(KeyedRow::new(l.key.clone(), l.row.clone()));
            }
            continue;
        }
        for r in matches {
            matched_right.insert(r.key.clone());
            let merged = l.row.merged_with(&r.row);
            out.push(KeyedRow::new(composite_key(&l.key, &r.key), merged));
        }
    }

    if matches!(join.kind, JoinKind::Right | JoinKind::Full) {
        for r in &right_rows {
            if !matched_right.contains(&r.key) {
                out.push(KeyedRow::new(r.key.clone(), r.row.clone()));
            }
        }
    }

    Ok(out)
}

fn apply_select(rows: Vec<KeyedRow>, ir: &QueryIr) -> CoreResult<Vec<KeyedRow>> {
    let mut out = Vec::with_capacity(rows.len());
    for mut r in rows {
        let value = if let Some(f) = &ir.fn_select {
            f(&r.row)
        } else if let Some(Projection(fields)) = &ir.select {
            let mut obj = serde_json::Map::new();
            for (name, expr) in fields {
                if let Some(spread_alias) = name.strip_prefix(SPREAD_SENTINEL) {
                    if let Some(serde_json::Value::Object(inner)) = r.row.get(spread_alias) {
                        for (k, v) in inner {
                            obj.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                    continue;
                }
                let value = if expr.contains_agg() {
                    r.row
                        .get(AGG_NAMESPACE)
                        .and_then(|agg| agg.get(name))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null)
                } else {
                    dyn_to_json(&eval_scalar(expr, &r.row)?)
                };
                obj.insert(name.clone(), value);
            }
            serde_json::Value::Object(obj)
        } else if ir.join.is_empty() && ir.group_by.is_empty() {
            // Step 7 default, no join/group-by: the main alias's record.
            r.row.get(ir.from.alias()).cloned().unwrap_or(serde_json::Value::Null)
        } else {
            // Default with join/group-by: keep the namespaced row as JSON.
            serde_json::Value::Object(
                r.row
                    .0
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        };
        r.row = r.row.with_select_result(value);
        out.push(r);
    }
    Ok(out)
}

fn dyn_to_json(value: &DynValue) -> serde_json::Value {
    match value {
        DynValue::Null => serde_json::Value::Null,
        DynValue::Bool(b) => serde_json::Value::Bool(*b),
        DynValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        DynValue::Str(s) => serde_json::Value::String(s.clone()),
        DynValue::Array(items) => serde_json::Value::Array(items.iter().map(dyn_to_json).collect()),
        DynValue::Object(fields) => {
            serde_json::Value::Object(fields.iter().map(|(k, v)| (k.clone(), dyn_to_json(v))).collect())
        }
    }
}

/// Spec §4.7.1 step 8: group by the tuple of grouping expressions (or the
/// empty tuple, "implicit" grouping, if only `select` has an aggregate),
/// compute `select`'s aggregates per group, then apply `HAVING`.
///
/// A group's output row represents non-aggregated `select`/`orderBy`
/// references using its first member's namespaced row — standard SQL
/// requires those to be functionally dependent on the grouping columns, so
/// any member is representative.
fn apply_group_by(rows: Vec<KeyedRow>, ir: &QueryIr) -> CoreResult<Vec<KeyedRow>> {
    let mut groups: Vec<(Vec<DynValue>, Vec<NamespacedRow>, Key)> = Vec::new();
    let mut index: HashMap<Vec<DynValueKey>, usize> = HashMap::new();

    for r in rows {
        let group_values: Vec<DynValue> = ir
            .group_by
            .iter()
            .map(|e| eval_scalar(e, &r.row))
            .collect::<CoreResult<Vec<_>>>()?;
        let lookup_key: Vec<DynValueKey> = group_values.iter().map(DynValueKey::from).collect();

        match index.get(&lookup_key) {
            Some(&pos) => groups[pos].1.push(r.row),
            None => {
                index.insert(lookup_key, groups.len());
                let key = group_key(&group_values, &r.key);
                groups.push((group_values, vec![r.row], key));
            }
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, members, key) in groups {
        let representative = members[0].clone();
        // Stash the group's members on the representative row under a
        // private side channel so `apply_select`/`having` can evaluate
        // aggregates; we do this by evaluating aggregates here and folding
        // the results into the representative's namespace under a
        // synthetic `__agg_<n>` alias is unnecessary complexity — instead
        // aggregates are evaluated directly against `members` at both the
        // HAVING check and the later SELECT pass via `GroupContext`.
        let ctx = GroupContext { members: members.clone() };
        if !ir.having.is_empty() {
            let mut keep = true;
            for clause in &ir.having {
                if !eval_predicate_grouped(clause, &representative, &ctx)? {
                    keep = false;
                    break;
                }
            }
            for f in &ir.fn_having {
                if !f(&members) {
                    keep = false;
                }
            }
            if !keep {
                continue;
            }
        }
        out.push(KeyedRow::new(key, representative_with_group(&representative, &ir.select, &ctx)?));
    }
    Ok(out)
}

/// Pre-evaluates every `Agg` node that appears in `select` against the
/// group's members and bakes the result into the representative row as a
/// plain JSON field the later `apply_select` pass can `Ref` into — keeping
/// `apply_select` ignorant of grouping.
fn representative_with_group(
    representative: &NamespacedRow,
    select: &Option<Projection>,
    ctx: &GroupContext,
) -> CoreResult<NamespacedRow> {
    let Some(Projection(fields)) = select else {
        return Ok(representative.clone());
    };
    let mut augmented = representative.clone();
    let mut agg_fields = serde_json::Map::new();
    for (name, expr) in fields {
        if expr.contains_agg() {
            let value = eval_expr_grouped(expr, ctx)?;
            agg_fields.insert(name.clone(), dyn_to_json(&value));
        }
    }
    augmented.0.insert(AGG_NAMESPACE.to_string(), serde_json::Value::Object(agg_fields));
    Ok(augmented)
}

/// The namespace alias under which pre-computed aggregate values are
/// stashed so `apply_select`'s plain `Ref`/`Func` evaluator can read them
/// back out by field name instead of re-walking the group.
const AGG_NAMESPACE: &str = "__agg";

struct GroupContext {
    members: Vec<NamespacedRow>,
}

fn eval_expr_grouped(expr: &crate::query::ir::Expr, ctx: &GroupContext) -> CoreResult<DynValue> {
    match expr {
        crate::query::ir::Expr::Agg { op, arg } => eval_agg(*op, arg, &ctx.members),
        crate::query::ir::Expr::Func { name, args } => {
            let values = args.iter().map(|a| eval_expr_grouped(a, ctx)).collect::<CoreResult<Vec<_>>>()?;
            eval_func_on_values(name, &values)
        }
        other => eval_scalar(other, ctx.members.first().ok_or_else(|| {
            CoreError::Query("empty group".into())
        })?),
    }
}

fn eval_func_on_values(name: &str, values: &[DynValue]) -> CoreResult<DynValue> {
    crate::query::functions::eval_func_public(name, values)
}

fn eval_predicate_grouped(expr: &crate::query::ir::Expr, representative: &NamespacedRow, ctx: &GroupContext) -> CoreResult<bool> {
    if expr.contains_agg() {
        let v = eval_expr_grouped(expr, ctx)?;
        Ok(match v {
            DynValue::Bool(b) => b,
            DynValue::Null => false,
            other => !other.is_null(),
        })
    } else {
        eval_predicate(expr, representative)
    }
}

/// Rewrites a `select` field that names an aggregate to instead read the
/// pre-computed value stashed by [`representative_with_group`] under
/// [`AGG_NAMESPACE`]. Non-aggregate fields pass through `eval_scalar`
/// unchanged against the representative row.
fn group_key(values: &[DynValue], fallback: &Key) -> Key {
    if values.is_empty() {
        return fallback.clone();
    }
    Key::Str(values.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>().join("\u{0}"))
}

/// A hashable projection of [`DynValue`] used only to bucket group-by keys
/// (`DynValue` itself is `Hash`, but floats hash by bit pattern which is
/// exactly what grouping wants — equal group keys must hash identically).
#[derive(PartialEq, Eq, Hash)]
struct DynValueKey(String);

impl DynValueKey {
    fn from(v: &DynValue) -> Self {
        DynValueKey(format!("{v:?}"))
    }
}

fn apply_order_by(mut rows: Vec<KeyedRow>, ir: &QueryIr) -> CoreResult<Vec<KeyedRow>> {
    let mut evaluated: Vec<(KeyedRow, Vec<DynValue>)> = Vec::with_capacity(rows.len());
    for r in rows.drain(..) {
        let mut keys = Vec::with_capacity(ir.order_by.len());
        for entry in &ir.order_by {
            keys.push(eval_scalar(&entry.expr, &r.row)?);
        }
        evaluated.push((r, keys));
    }

    evaluated.sort_by(|(_, a), (_, b)| {
        for (i, entry) in ir.order_by.iter().enumerate() {
            let ord = order_cmp(&a[i], &b[i], entry.direction, entry.nulls);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });

    Ok(evaluated
        .into_iter()
        .enumerate()
        .map(|(i, (mut r, _))| {
            r.order_by_index = Some(i);
            r
        })
        .collect())
}

/// Nulls sort first by default regardless of direction (spec §4.7.1 step 9,
/// §9 open question, resolved: "implemented exactly as documented").
fn order_cmp(a: &DynValue, b: &DynValue, direction: OrderDirection, nulls: Option<NullsOrder>) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    let nulls_first = match nulls {
        Some(NullsOrder::First) => true,
        Some(NullsOrder::Last) => false,
        None => true,
    };
    match (a.is_null(), b.is_null()) {
        (true, true) => return Equal,
        (true, false) => return if nulls_first { Less } else { Greater },
        (false, true) => return if nulls_first { Greater } else { Less },
        (false, false) => {}
    }
    let natural = universal_cmp(a, b);
    match direction {
        OrderDirection::Asc => natural,
        OrderDirection::Desc => natural.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ir::{Expr, JoinKind};
    use serde_json::json;

    struct MapSource(HashMap<String, Vec<(Key, serde_json::Value)>>);
    impl CollectionSource for MapSource {
        fn visible_rows(&self, name: &str) -> Option<Vec<(Key, serde_json::Value)>> {
            self.0.get(name).cloned()
        }
    }

    #[test]
    fn join_and_pushdown_scenario() {
        let mut data = HashMap::new();
        data.insert(
            "users".to_string(),
            vec![
                (Key::from(1i64), json!({"id": 1, "dept": 10})),
                (Key::from(2i64), json!({"id": 2, "dept": 20})),
            ],
        );
        data.insert(
            "depts".to_string(),
            vec![
                (Key::from(10i64), json!({"id": 10, "n": "E"})),
                (Key::from(20i64), json!({"id": 20, "n": "P"})),
            ],
        );
        let source = MapSource(data);

        let query = QueryIr::from(Source::collection("users", "u"))
            .join(JoinKind::Inner, Source::collection("depts", "d"), Expr::r#ref(["u", "dept"]), Expr::r#ref(["d", "id"]))
            .filter(Expr::func("eq", vec![Expr::r#ref(["u", "id"]), Expr::value(DynValue::Number(1.0))]))
            .select(vec![("id", Expr::r#ref(["u", "id"])), ("n", Expr::r#ref(["d", "n"]))]);

        let compiled = CompiledQuery::compile(&query);
        let result = compiled.evaluate(&source).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].1, json!({"id": 1.0, "n": "E"}));
    }

    #[test]
    fn group_by_count_with_left_join() {
        let mut data = HashMap::new();
        data.insert(
            "issues".to_string(),
            vec![
                (Key::from(1i64), json!({"id": 1})),
                (Key::from(2i64), json!({"id": 2})),
                (Key::from(3i64), json!({"id": 3})),
            ],
        );
        data.insert(
            "comments".to_string(),
            vec![
                (Key::from(1i64), json!({"id": 1, "issueId": 1})),
                (Key::from(2i64), json!({"id": 2, "issueId": 1})),
                (Key::from(3i64), json!({"id": 3, "issueId": 2})),
            ],
        );
        let source = MapSource(data);

        let query = QueryIr::from(Source::collection("issues", "i"))
            .join(JoinKind::Left, Source::collection("comments", "c"), Expr::r#ref(["i", "id"]), Expr::r#ref(["c", "issueId"]))
            .group_by(vec![Expr::r#ref(["i", "id"])])
            .select(vec![
                ("id", Expr::r#ref(["i", "id"])),
                ("count", Expr::agg(crate::query::ir::AggOp::Count, Expr::r#ref(["c", "id"]))),
            ]);

        let compiled = CompiledQuery::compile(&query);
        let mut result = compiled.evaluate(&source).unwrap();
        result.sort_by_key(|(_, v)| v["id"].as_i64());
        let counts: Vec<i64> = result.iter().map(|(_, v)| v["count"].as_i64().unwrap()).collect();
        assert_eq!(counts, vec![2, 1, 0]);
    }

    #[test]
    fn limit_without_order_by_is_rejected() {
        let query = QueryIr::from(Source::collection("users", "u")).limit(5);
        let compiled = CompiledQuery::compile(&query);
        let source = MapSource(HashMap::new());
        assert!(compiled.evaluate(&source).is_err());
    }

    #[test]
    fn having_without_group_by_is_rejected() {
        let query = QueryIr::from(Source::collection("users", "u"))
            .having(Expr::func("eq", vec![Expr::value(DynValue::Number(1.0)), Expr::value(DynValue::Number(1.0))]));
        let compiled = CompiledQuery::compile(&query);
        let source = MapSource(HashMap::new());
        assert!(compiled.evaluate(&source).is_err());
    }
}
