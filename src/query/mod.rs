//! The query subsystem: IR (§4.5), optimizer (§4.6), and compiler/evaluator
//! (§4.7). There is no text parser — queries are built directly as
//! [`ir::QueryIr`] trees, the same way the teacher's `interactive` crate
//! builds a `Plan<Value>` through chained constructors rather than parsing
//! SQL (spec Non-goals).

pub mod compiler;
pub mod functions;
pub mod ir;
pub mod namespaced;
pub mod optimizer;

pub use compiler::{CollectionSource, CompiledQuery};
pub use ir::{AggOp, Expr, JoinClause, JoinKind, NullsOrder, OrderByEntry, OrderDirection, Projection, QueryIr, Source};
pub use namespaced::{KeyedRow, NamespacedRow};
