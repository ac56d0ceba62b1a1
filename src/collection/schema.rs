//! The opaque schema contract (spec §6 "Schema contract").

use crate::error::SchemaIssue;
use crate::value::Row;

/// `validate(input) -> { value } | { issues: [...] }`, required to be
/// synchronous (spec §4.3.6: "async result is fatal").
pub trait Schema<R: Row> {
    fn validate(&self, value: &R) -> Result<R, Vec<SchemaIssue>>;
}

impl<R, F> Schema<R> for F
where
    R: Row,
    F: Fn(&R) -> Result<R, Vec<SchemaIssue>>,
{
    fn validate(&self, value: &R) -> Result<R, Vec<SchemaIssue>> {
        (self)(value)
    }
}
