//! Filter trees, query envelopes and grouped queries over entity objects

mod envelope;
mod evaluate;
mod filter;
mod group;

pub use envelope::{EntityQuery, Page, SortBy, SortOrder};
pub use evaluate::{as_number, compare_values, lookup, sort_cmp, values_equal};
pub use filter::{Composite, Condition, Operator, QueryItem};
pub use group::{
    AggregateFunction, AggregationSpec, Group, GroupBy, GroupFormat, GroupFormatType,
    GroupSpec, GroupedQuery, GroupedResult,
};
