//! The scalar expression evaluator and function registry (spec §4.5).
//!
//! Each entry in the registry is a fixed-arity pure function over
//! already-evaluated [`DynValue`] arguments; unknown names are a `QueryError`
//! at evaluation time (in practice caught once at compile time, since the
//! compiler pre-compiles every expression before running the pipeline —
//! spec §4.7.1 step 5: "each expression is pre-compiled into a pure
//! evaluator").

use crate::error::{CoreError, CoreResult};
use crate::query::ir::{AggOp, Expr};
use crate::query::namespaced::NamespacedRow;
use crate::value::{universal_cmp, DynValue, Row};
use std::cmp::Ordering;

/// Evaluates a scalar (non-aggregate) expression against a namespaced row.
/// Returns a `QueryError` if an `Agg` node is encountered — aggregates are
/// only legal inside `select`/`having` after grouping (spec §4.7.1 step 8).
pub fn eval_scalar(expr: &Expr, row: &NamespacedRow) -> CoreResult<DynValue> {
    match expr {
        Expr::Ref { path } => Ok(row.resolve(path)),
        Expr::Value { literal } => Ok(literal.clone()),
        Expr::Func { name, args } => {
            let values = args
                .iter()
                .map(|a| eval_scalar(a, row))
                .collect::<CoreResult<Vec<_>>>()?;
            eval_func(name, &values)
        }
        Expr::Agg { .. } => Err(CoreError::Query(
            "aggregate expression used outside of a group-by context".into(),
        )),
    }
}

/// Evaluates a `bool`-typed scalar expression (for `WHERE`/`HAVING`
/// clauses). Non-boolean results are treated as falsy unless truthy per the
/// universal comparator's notion of "non-null", matching the Boolean
/// coercion every function in the `and/or/not` family already performs.
pub fn eval_predicate(expr: &Expr, row: &NamespacedRow) -> CoreResult<bool> {
    Ok(truthy(&eval_scalar(expr, row)?))
}

/// Evaluates a scalar expression against a single un-namespaced row (spec
/// §4.3.4/§4.3.5: a collection's `where`/index expressions are compiled
/// against single-row access, with no alias to strip — unlike
/// [`eval_scalar`]'s namespaced-row variant used by the query pipeline,
/// `Ref.path` here is the field path straight into [`Row::field`]).
pub fn eval_row_scalar<R: Row>(expr: &Expr, row: &R) -> CoreResult<DynValue> {
    match expr {
        Expr::Ref { path } => Ok(row.field(path)),
        Expr::Value { literal } => Ok(literal.clone()),
        Expr::Func { name, args } => {
            let values = args
                .iter()
                .map(|a| eval_row_scalar(a, row))
                .collect::<CoreResult<Vec<_>>>()?;
            eval_func(name, &values)
        }
        Expr::Agg { .. } => Err(CoreError::Query(
            "aggregate expression used outside of a group-by context".into(),
        )),
    }
}

/// Evaluates a `where` predicate against a single un-namespaced row (spec
/// §4.3.4 `currentStateAsChanges({ where })`/`subscribeChanges({ where })`).
pub fn eval_row_predicate<R: Row>(expr: &Expr, row: &R) -> CoreResult<bool> {
    Ok(truthy(&eval_row_scalar(expr, row)?))
}

fn truthy(value: &DynValue) -> bool {
    match value {
        DynValue::Null => false,
        DynValue::Bool(b) => *b,
        _ => !value.is_null(),
    }
}

/// Exposes the function registry to the grouped-aggregate evaluator in
/// [`crate::query::compiler`], which pre-evaluates `Agg` subexpressions and
/// needs to keep composing the surrounding `Func` nodes without re-walking
/// a row.
pub(crate) fn eval_func_public(name: &str, args: &[DynValue]) -> CoreResult<DynValue> {
    eval_func(name, args)
}

fn eval_func(name: &str, args: &[DynValue]) -> CoreResult<DynValue> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(DynValue::Null);
    match name {
        "eq" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) == Ordering::Equal)),
        "neq" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) != Ordering::Equal)),
        "lt" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) == Ordering::Less)),
        "lte" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) != Ordering::Greater)),
        "gt" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) == Ordering::Greater)),
        "gte" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) != Ordering::Less)),

        "and" => Ok(DynValue::Bool(args.iter().all(truthy))),
        "or" => Ok(DynValue::Bool(args.iter().any(truthy))),
        "not" => Ok(DynValue::Bool(!truthy(&arg(0)))),

        "like" => Ok(DynValue::Bool(glob_like(str_of(&arg(0)), str_of(&arg(1))))),
        "notLike" => Ok(DynValue::Bool(!glob_like(str_of(&arg(0)), str_of(&arg(1))))),
        "upper" => Ok(DynValue::Str(str_of(&arg(0)).to_uppercase())),
        "lower" => Ok(DynValue::Str(str_of(&arg(0)).to_lowercase())),
        "length" => Ok(match &arg(0) {
            DynValue::Str(s) => DynValue::Number(s.chars().count() as f64),
            DynValue::Array(a) => DynValue::Number(a.len() as f64),
            DynValue::Null => DynValue::Null,
            other => DynValue::Number(str_of(other).chars().count() as f64),
        }),
        "concat" => Ok(DynValue::Str(args.iter().map(str_of).collect::<Vec<_>>().concat())),

        "in" => Ok(DynValue::Bool(args[1..].iter().any(|v| universal_cmp(v, &arg(0)) == Ordering::Equal))),
        "notIn" => Ok(DynValue::Bool(!args[1..].iter().any(|v| universal_cmp(v, &arg(0)) == Ordering::Equal))),

        "is" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) == Ordering::Equal)),
        "isNot" => Ok(DynValue::Bool(universal_cmp(&arg(0), &arg(1)) != Ordering::Equal)),

        "coalesce" => Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or(DynValue::Null)),

        // A no-op pass-through; the real `orderByIndex` synthesis happens in
        // the order-by operator (spec §4.7.1 step 9), not as a scalar
        // function. Kept in the registry so an expression tree can reference
        // it as a marker without a special IR node.
        "orderIndex" => Ok(arg(0)),

        other => Err(CoreError::Query(format!("unknown function `{other}`"))),
    }
}

fn str_of(value: &DynValue) -> String {
    match value {
        DynValue::Str(s) => s.clone(),
        DynValue::Null => String::new(),
        DynValue::Bool(b) => b.to_string(),
        DynValue::Number(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

/// `%`/`_` SQL-style glob matching (`%` = any run, `_` = any one char).
fn glob_like(haystack: String, pattern: String) -> bool {
    fn matches(h: &[char], p: &[char]) -> bool {
        match p.first() {
            None => h.is_empty(),
            Some('%') => matches(h, &p[1..]) || (!h.is_empty() && matches(&h[1..], p)),
            Some('_') => !h.is_empty() && matches(&h[1..], &p[1..]),
            Some(c) => h.first() == Some(c) && matches(&h[1..], &p[1..]),
        }
    }
    let h: Vec<char> = haystack.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    matches(&h, &p)
}

/// Evaluates an aggregate over a group's member rows (spec §4.7.2).
/// Null/undefined members are excluded from every aggregate; `mode` breaks
/// ties by returning the smallest value.
pub fn eval_agg(op: AggOp, arg: &Expr, members: &[NamespacedRow]) -> CoreResult<DynValue> {
    let values: Vec<DynValue> = members
        .iter()
        .map(|r| eval_scalar(arg, r))
        .collect::<CoreResult<Vec<_>>>()?
        .into_iter()
        .filter(|v| !v.is_null())
        .collect();

    Ok(match op {
        AggOp::Count => DynValue::Number(values.len() as f64),
        AggOp::Sum => {
            DynValue::Number(values.iter().filter_map(DynValue::as_f64).sum())
        }
        AggOp::Avg => {
            let nums: Vec<f64> = values.iter().filter_map(DynValue::as_f64).collect();
            if nums.is_empty() {
                DynValue::Null
            } else {
                DynValue::Number(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggOp::Min => values.iter().min_by(|a, b| universal_cmp(a, b)).cloned().unwrap_or(DynValue::Null),
        AggOp::Max => values.iter().max_by(|a, b| universal_cmp(a, b)).cloned().unwrap_or(DynValue::Null),
        AggOp::Median => {
            let mut nums: Vec<f64> = values.iter().filter_map(DynValue::as_f64).collect();
            if nums.is_empty() {
                DynValue::Null
            } else {
                nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let mid = nums.len() / 2;
                if nums.len() % 2 == 0 {
                    DynValue::Number((nums[mid - 1] + nums[mid]) / 2.0)
                } else {
                    DynValue::Number(nums[mid])
                }
            }
        }
        AggOp::Mode => {
            if values.is_empty() {
                DynValue::Null
            } else {
                let mut sorted = values.clone();
                sorted.sort_by(universal_cmp);
                let mut best = sorted[0].clone();
                let mut best_count = 0usize;
                let mut i = 0;
                while i < sorted.len() {
                    let mut j = i;
                    while j < sorted.len() && universal_cmp(&sorted[j], &sorted[i]) == Ordering::Equal {
                        j += 1;
                    }
                    let count = j - i;
                    // Ties favor the smallest value; `sorted` is already
                    // ascending, so the first run with the max count wins.
                    if count > best_count {
                        best_count = count;
                        best = sorted[i].clone();
                    }
                    i = j;
                }
                best
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_supports_percent_and_underscore() {
        assert!(glob_like("hello world".into(), "hello%".into()));
        assert!(glob_like("hello".into(), "h_llo".into()));
        assert!(!glob_like("hello".into(), "world".into()));
    }

    #[test]
    fn mode_breaks_ties_on_smallest_value() {
        let members: Vec<NamespacedRow> = vec![1.0, 2.0, 2.0, 1.0]
            .into_iter()
            .map(|n| NamespacedRow::single("t", serde_json::json!({"n": n})))
            .collect();
        let result = eval_agg(AggOp::Mode, &Expr::r#ref(["t", "n"]), &members).unwrap();
        assert_eq!(result, DynValue::Number(1.0));
    }

    #[test]
    fn avg_excludes_nulls() {
        let members: Vec<NamespacedRow> = vec![serde_json::json!({"n": 10}), serde_json::json!({"n": null})]
            .into_iter()
            .map(|v| NamespacedRow::single("t", v))
            .collect();
        let result = eval_agg(AggOp::Avg, &Expr::r#ref(["t", "n"]), &members).unwrap();
        assert_eq!(result, DynValue::Number(10.0));
    }
}
