//! Row-oriented data model shared across the execution engine.

pub mod datatype;
pub mod datum;
pub mod encoding;
pub mod field;
pub mod row;
pub mod sort;
