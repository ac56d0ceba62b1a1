//! Single-pass, conservative predicate pushdown (spec §4.6).
//!
//! The optimizer never mutates a `QueryIr` in place — it produces a fresh
//! tree, since the same subquery `Rc` may be observed from more than one
//! outer context (spec §9: "the safety check must forbid optimization that
//! would affect a subquery whose result is observed from multiple outer
//! contexts; implementations should operate on freshly cloned IR trees when
//! lifting clauses").

use std::collections::HashSet;
use std::rc::Rc;

use crate::query::ir::{Expr, JoinClause, QueryIr, Source};

/// Runs the optimizer pass on `query`, returning a semantically equivalent
/// tree (spec §8 property 5).
pub fn optimize(query: &QueryIr) -> QueryIr {
    // Rule 1: no joins, nothing to push.
    if query.join.is_empty() {
        return query.clone();
    }

    // Rule 2: split top-level `and(a, b, ...)` clauses; `or` is never split.
    let clauses: Vec<Expr> = query.r#where.iter().flat_map(split_and).collect();

    let mut remaining: Vec<Expr> = Vec::new();
    let mut pushed_into_main: Vec<Expr> = Vec::new();
    let mut pushed_into_join: Vec<Vec<Expr>> = vec![Vec::new(); query.join.len()];

    for clause in clauses {
        let mut aliases = HashSet::new();
        clause.aliases(&mut aliases);

        if aliases.len() == 1 {
            let alias = aliases.iter().next().unwrap().clone();
            if alias == query.from.alias() && is_safe_source(&query.from) {
                pushed_into_main.push(clause);
                continue;
            }
            if let Some(idx) = query.join.iter().position(|j| j.source.alias() == alias) {
                if is_safe_source(&query.join[idx].source) {
                    pushed_into_join[idx].push(clause);
                    continue;
                }
            }
        }
        // Multi-source, or single-source but unsafe to push: stays outer.
        remaining.push(clause);
    }

    let mut result = query.clone();
    result.r#where = remaining;

    if !pushed_into_main.is_empty() {
        result.from = push_into_source(&query.from, pushed_into_main);
    }
    for (idx, clauses) in pushed_into_join.into_iter().enumerate() {
        if !clauses.is_empty() {
            result.join[idx].source = push_into_source(&query.join[idx].source, clauses);
        }
    }

    result
}

/// Splits a root `and(...)` clause into its conjuncts; anything else
/// (including `or(...)`) is returned unsplit (spec §4.6 rule 2).
fn split_and(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Func { name, args } if name == "and" => args.iter().flat_map(split_and).collect(),
        other => vec![other.clone()],
    }
}

/// `isSafeToOptimize(S)` (spec §4.6 rule 4): no `groupBy`/`having`/aggregate
/// select, no `orderBy` combined with `limit`/`offset`, and no opaque
/// functional variants.
fn is_safe_source(source: &Source) -> bool {
    match source {
        Source::CollectionRef { .. } => true,
        Source::QueryRef { query, .. } => {
            query.group_by.is_empty()
                && query.having.is_empty()
                && !query.select_has_agg()
                && !(!query.order_by.is_empty() && (query.limit.is_some() || query.offset.is_some()))
                && query.fn_select.is_none()
                && query.fn_where.is_empty()
                && query.fn_having.is_empty()
        }
    }
}

/// Wraps `source` in a (possibly new) `QueryRef` carrying the pushed
/// clauses (spec §4.6 rule 5).
fn push_into_source(source: &Source, clauses: Vec<Expr>) -> Source {
    match source {
        Source::CollectionRef { collection, alias } => {
            let inner = QueryIr::from(Source::CollectionRef { collection: collection.clone(), alias: alias.clone() });
            let inner = clauses.into_iter().fold(inner, |q, c| q.filter(c));
            Source::QueryRef { query: Rc::new(inner), alias: alias.clone() }
        }
        Source::QueryRef { query, alias } => {
            let mut inner = (**query).clone();
            inner.r#where.extend(clauses);
            Source::QueryRef { query: Rc::new(inner), alias: alias.clone() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ir::{Expr, JoinKind};

    #[test]
    fn pushes_single_source_where_into_collection_ref() {
        // SELECT u.id, d.n FROM users u JOIN depts d ON u.dept=d.id WHERE u.id=1
        let q = QueryIr::from(Source::collection("users", "u"))
            .join(
                JoinKind::Inner,
                Source::collection("depts", "d"),
                Expr::r#ref(["u", "dept"]),
                Expr::r#ref(["d", "id"]),
            )
            .filter(Expr::func("eq", vec![Expr::r#ref(["u", "id"]), Expr::value(crate::value::DynValue::Number(1.0))]));

        let optimized = optimize(&q);
        assert!(optimized.r#where.is_empty(), "u.id=1 should be fully pushed");
        match &optimized.from {
            Source::QueryRef { query, alias } => {
                assert_eq!(alias, "u");
                assert_eq!(query.r#where.len(), 1);
            }
            _ => panic!("expected main source to become a QueryRef"),
        }
    }

    #[test]
    fn does_not_push_multi_source_clause() {
        let q = QueryIr::from(Source::collection("users", "u"))
            .join(JoinKind::Inner, Source::collection("depts", "d"), Expr::r#ref(["u", "dept"]), Expr::r#ref(["d", "id"]))
            .filter(Expr::func("eq", vec![Expr::r#ref(["u", "dept"]), Expr::r#ref(["d", "id"])]));
        let optimized = optimize(&q);
        assert_eq!(optimized.r#where.len(), 1, "multi-alias clause must stay outer");
    }

    #[test]
    fn does_not_split_or() {
        let q = QueryIr::from(Source::collection("users", "u"))
            .join(JoinKind::Inner, Source::collection("depts", "d"), Expr::r#ref(["u", "dept"]), Expr::r#ref(["d", "id"]))
            .filter(Expr::func(
                "or",
                vec![
                    Expr::func("eq", vec![Expr::r#ref(["u", "id"]), Expr::value(crate::value::DynValue::Number(1.0))]),
                    Expr::func("eq", vec![Expr::r#ref(["u", "id"]), Expr::value(crate::value::DynValue::Number(2.0))]),
                ],
            ));
        let optimized = optimize(&q);
        // Still single-source (only `u`), so it is still pushed whole — but
        // unsplit, as a single `or(...)` clause, not two.
        match &optimized.from {
            Source::QueryRef { query, .. } => assert_eq!(query.r#where.len(), 1),
            _ => panic!("expected pushdown"),
        }
    }

    #[test]
    fn refuses_to_push_into_unsafe_source_with_group_by() {
        let inner = QueryIr::from(Source::collection("comments", "c")).group_by(vec![Expr::r#ref(["c", "issueId"])]);
        let q = QueryIr::from(Source::query(inner, "c"))
            .join(JoinKind::Inner, Source::collection("issues", "i"), Expr::r#ref(["c", "issueId"]), Expr::r#ref(["i", "id"]))
            .filter(Expr::func("eq", vec![Expr::r#ref(["c", "issueId"]), Expr::value(crate::value::DynValue::Number(1.0))]));
        let optimized = optimize(&q);
        assert_eq!(optimized.r#where.len(), 1, "unsafe source (has group_by) must not receive pushdown");
    }

    #[test]
    fn idempotent() {
        let q = QueryIr::from(Source::collection("users", "u"))
            .join(JoinKind::Inner, Source::collection("depts", "d"), Expr::r#ref(["u", "dept"]), Expr::r#ref(["d", "id"]))
            .filter(Expr::func("eq", vec![Expr::r#ref(["u", "id"]), Expr::value(crate::value::DynValue::Number(1.0))]));
        let once = optimize(&q);
        let twice = optimize(&once);
        assert_eq!(once.r#where.len(), twice.r#where.len());
    }
}
