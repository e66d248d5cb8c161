//! Properties of an expression.
//!
//! Relational properties are shared by all expressions in a memo group.
//! Physical properties describe physical characteristics of the data (such as ordering)
//! that an operator is required to provide.

pub mod logical;
pub mod ordering;
pub mod physical;

pub use ordering::{OrderingChoice, OrderingColumn};
