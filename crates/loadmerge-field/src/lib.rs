//! loadmerge-field - merge point lookups by one field.
//!
//! # Overview
//!
//! - [`FieldMerger`] - the reference [`RequestMerger`](loadmerge_core::RequestMerger):
//!   groups requests by their other arguments and turns the field into a
//!   `{ "$in": [...] }` condition, capped at `max_query_length` values
//! - [`FieldSolver`] - a scheduler pre-wired with a `FieldMerger`
//! - [`FieldValue`] / [`FieldIn`] / [`FieldSource`] - field values, the
//!   typed `$in` condition, and how result rows expose the field
//! - [`canonical_key`] - order-independent key for common arguments

pub mod error;
pub mod key;
pub mod merger;
pub mod solver;
pub mod value;

pub use error::FieldMergeError;
pub use key::canonical_key;
pub use merger::{FieldMerger, FieldMergerConfig};
pub use solver::{FieldSolver, FieldSolverConfig};
pub use value::{FieldIn, FieldNumber, FieldSource, FieldValue, IN_OPERATOR};
