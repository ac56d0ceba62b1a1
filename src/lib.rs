//! A reactive, incremental in-memory query engine.
//!
//! Callers register *collections* (keyed record sets fed by optimistic
//! local mutation and/or an external `sync` driver, §4.3) and compose
//! *live queries* over them (§4.5–§4.8) — selection, projection, join,
//! group-by, and order-by/limit pipelines whose materialized results are
//! themselves collections, kept current as their inputs change.
//!
//! There is no text query parser; queries are built as [`query::QueryIr`]
//! trees directly, the way the teacher's own `interactive` crate builds a
//! `Plan<Value>` through chained constructors rather than from parsed SQL.

pub mod change;
pub mod collection;
pub mod error;
pub mod key;
pub mod live_query;
pub mod ordered_map;
pub mod query;
pub mod runtime;
pub mod transaction;
pub mod value;

pub use change::{ChangeMessage, Diff, Multiplicity, SyncWrite};
pub use collection::{Collection, CollectionConfig, CollectionStatus, RowUpdateMode, SyncDriver, SyncHandle};
pub use error::{CoreError, CoreResult, SchemaIssue};
pub use key::Key;
pub use live_query::create_live_query_collection;
pub use query::{CompiledQuery, Expr, JoinKind, QueryIr, Source};
pub use runtime::Runtime;
pub use transaction::{TransactionHandle, TransactionManager, TransactionState};
pub use value::{DynValue, Row};
