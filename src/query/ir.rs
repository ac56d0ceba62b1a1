//! The query intermediate representation (spec §4.5).
//!
//! `QueryIr` is immutable once built — the optimizer (§4.6) never mutates a
//! tree in place, it produces a new one. There is no text parser anywhere in
//! this crate (spec Non-goals: "SQL parsing from text"); callers build a
//! `QueryIr` directly with the constructors/builder methods below, the same
//! way the teacher's own `Plan<Value>` is built with `.project()`, `.join()`,
//! `.filter()` chain methods (`interactive/src/plan/mod.rs`) rather than
//! parsed from a string.

use std::rc::Rc;

use crate::value::DynValue;

/// `Agg{ name, arg }` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Median,
    Mode,
}

/// An expression node (spec §4.5). `Func`/`Agg` dispatch is a tagged
/// variant with a static dispatcher per node kind (spec §9: "implement as a
/// tagged variant and a static dispatcher per node kind", grounded on the
/// teacher's own `enum Plan<Value>` + `impl Render for Plan<Value>`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    /// `Ref{ path=[alias, field, ...] }`.
    Ref { path: Vec<String> },
    /// `Value{ literal }`.
    Value { literal: DynValue },
    /// `Func{ name, args[] }` — see [`crate::query::functions`] for the
    /// registry of recognized names.
    Func { name: String, args: Vec<Expr> },
    /// `Agg{ name, arg }` — only legal inside `select`/`having` (spec §4.7.1
    /// step 8); evaluating one outside a group-by context is a `QueryError`.
    Agg { op: AggOp, arg: Box<Expr> },
}

impl Expr {
    pub fn r#ref(path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Expr::Ref { path: path.into_iter().map(Into::into).collect() }
    }

    pub fn value(literal: DynValue) -> Self {
        Expr::Value { literal }
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func { name: name.into(), args }
    }

    pub fn agg(op: AggOp, arg: Expr) -> Self {
        Expr::Agg { op, arg: Box::new(arg) }
    }

    /// The set of aliases this expression references, used by the optimizer
    /// (spec §4.6 rule 3, `aliasesOf(expr)`).
    pub fn aliases(&self, out: &mut std::collections::HashSet<String>) {
        match self {
            Expr::Ref { path } => {
                if let Some(alias) = path.first() {
                    out.insert(alias.clone());
                }
            }
            Expr::Value { .. } => {}
            Expr::Func { args, .. } => args.iter().for_each(|a| a.aliases(out)),
            Expr::Agg { arg, .. } => arg.aliases(out),
        }
    }

    /// Whether this expression tree (or any subexpression) contains an
    /// aggregate (spec §4.7.1 step 8 "implicit" group-by trigger).
    pub fn contains_agg(&self) -> bool {
        match self {
            Expr::Ref { .. } | Expr::Value { .. } => false,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_agg),
            Expr::Agg { .. } => true,
        }
    }
}

/// Equi-join kind (spec §4.5, §4.7.3). `cross`/`outer` are surface-syntax
/// synonyms normalized away by the builder, not distinct IR variants (spec
/// §4.7.3: "cross joins are rewritten to inner...", "outer synonym -> full").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrderByEntry {
    pub expr: Expr,
    pub direction: OrderDirection,
    /// Defaults to nulls-first regardless of direction if unset (spec §4.7.1
    /// step 9, §9 open question: "the ORDER BY comparator places
    /// null/undefined first regardless of direction... implementers should
    /// follow this spec").
    pub nulls: Option<NullsOrder>,
}

/// A query source: either a named collection, or a nested subquery (spec
/// §4.5 "Sources").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Source {
    CollectionRef { collection: String, alias: String },
    QueryRef { query: Rc<QueryIr>, alias: String },
}

impl Source {
    pub fn alias(&self) -> &str {
        match self {
            Source::CollectionRef { alias, .. } => alias,
            Source::QueryRef { alias, .. } => alias,
        }
    }

    pub fn collection(collection: impl Into<String>, alias: impl Into<String>) -> Self {
        Source::CollectionRef { collection: collection.into(), alias: alias.into() }
    }

    pub fn query(query: QueryIr, alias: impl Into<String>) -> Self {
        Source::QueryRef { query: Rc::new(query), alias: alias.into() }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub source: Source,
    pub left: Expr,
    pub right: Expr,
}

/// `SELECT` projection: a set of named output fields, each an expression
/// evaluated against the namespaced row (spec §4.7.1 step 7). A field name
/// equal to [`SPREAD_SENTINEL`] followed by an alias expands that alias's
/// whole record into the result, with explicitly named fields taking
/// precedence (spec: "fields already set take precedence").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Projection(pub Vec<(String, Expr)>);

/// Reserved field-name prefix for a spread entry, e.g. `("__spread_u",
/// Expr::Ref{path:["u"]})` expands alias `u`'s record into the result.
pub const SPREAD_SENTINEL: &str = "__spread_";

/// The opaque, "functional" escape hatches (spec §4.5, §4.6 rule 4: `fn
/// Select`/`fnWhere`/`fnHaving`). These are deliberately excluded from the
/// serializable IR surface — a boxed closure has no stable wire shape — and
/// from optimizer pushdown, since the optimizer cannot reason about opaque
/// code (spec §4.6 rule 4 "no fnSelect, fnWhere, fnHaving").
pub type FnWhere = Rc<dyn Fn(&crate::query::namespaced::NamespacedRow) -> bool>;
pub type FnSelect = Rc<dyn Fn(&crate::query::namespaced::NamespacedRow) -> serde_json::Value>;
pub type FnHaving = Rc<dyn Fn(&[crate::query::namespaced::NamespacedRow]) -> bool>;

/// The query tree itself (spec §3, §4.5).
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct QueryIr {
    pub from: Source,
    pub join: Vec<JoinClause>,
    pub r#where: Vec<Expr>,
    #[serde(skip)]
    pub fn_where: Vec<FnWhere>,
    pub select: Option<Projection>,
    #[serde(skip)]
    pub fn_select: Option<FnSelect>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    #[serde(skip)]
    pub fn_having: Vec<FnHaving>,
    pub order_by: Vec<OrderByEntry>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl std::fmt::Debug for QueryIr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryIr")
            .field("from", &self.from)
            .field("join", &self.join)
            .field("where", &self.r#where)
            .field("select", &self.select)
            .field("group_by", &self.group_by)
            .field("having", &self.having)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

impl QueryIr {
    pub fn from(source: Source) -> Self {
        QueryIr {
            from: source,
            join: Vec::new(),
            r#where: Vec::new(),
            fn_where: Vec::new(),
            select: None,
            fn_select: None,
            group_by: Vec::new(),
            having: Vec::new(),
            fn_having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    // `outer` is a surface synonym for `full`. There is no separate `Cross`
    // variant in `JoinKind` — a cross join is built by callers as
    // `JoinKind::Inner` with a `value(true)` == `value(true)` pair (cross
    // joins are rewritten to inner with a constant true predicate).
    pub fn join(mut self, kind: JoinKind, source: Source, left: Expr, right: Expr) -> Self {
        self.join.push(JoinClause { kind, source, left, right });
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.r#where.push(expr);
        self
    }

    pub fn filter_fn(mut self, f: FnWhere) -> Self {
        self.fn_where.push(f);
        self
    }

    pub fn select(mut self, projection: Vec<(impl Into<String>, Expr)>) -> Self {
        self.select = Some(Projection(projection.into_iter().map(|(k, v)| (k.into(), v)).collect()));
        self
    }

    pub fn select_fn(mut self, f: FnSelect) -> Self {
        self.fn_select = Some(f);
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having.push(expr);
        self
    }

    pub fn order_by(mut self, entries: Vec<OrderByEntry>) -> Self {
        self.order_by = entries;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Whether any `select` field is an aggregate (spec §4.7.1 step 8
    /// "implicit" group-by trigger).
    pub fn select_has_agg(&self) -> bool {
        self.select
            .as_ref()
            .map(|p| p.0.iter().any(|(_, e)| e.contains_agg()))
            .unwrap_or(false)
    }
}
