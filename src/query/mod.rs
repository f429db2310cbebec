//! Search specification → query plan.

pub mod filter;
pub mod operators;
pub mod params;
pub mod plan;

pub use filter::Filter;
pub use operators::Operator;
pub use params::{OrderBy, SearchParams};
pub use plan::{build, build_predicate, CompareOp, Correlated, Direction, Operand, Predicate, QueryPlan, Scope};
