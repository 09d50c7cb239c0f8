//! Shared helpers for operator tests.

use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;
use groupexec_row::field::{Field, Schema};
use groupexec_row::row::Row;

use super::values::ValuesSource;

/// Schema of `n` Int64 columns named c0..c{n-1}.
pub fn int64_schema(n: usize) -> Schema {
    Schema::new((0..n).map(|i| Field::new(format!("c{i}"), DataType::Int64)))
}

pub fn int_row(values: &[i64]) -> Row {
    values.iter().map(|&v| Datum::Int64(v)).collect()
}

pub fn opt_int_row(values: &[Option<i64>]) -> Row {
    values.iter().map(|v| v.map(Datum::Int64)).collect()
}

pub fn int_source(ncols: usize, rows: &[&[i64]]) -> ValuesSource {
    ValuesSource::new(
        int64_schema(ncols),
        rows.iter().map(|r| int_row(r)).collect(),
    )
}
