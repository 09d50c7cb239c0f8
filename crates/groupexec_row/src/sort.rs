use std::cmp::Ordering;

use crate::datum::Datum;
use crate::row::Row;

/// Ordering requirement on a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        SortKey {
            column,
            descending: false,
            nulls_first: false,
        }
    }
}

/// Total order over same-typed datums.
///
/// Floats order by `total_cmp`. Differently-typed datums order by type tag so
/// that sorting never panics; the executor only compares like-typed columns.
pub fn datum_cmp(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
        (Datum::Int32(a), Datum::Int32(b)) => a.cmp(b),
        (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
        (Datum::Float64(a), Datum::Float64(b)) => a.total_cmp(b),
        (Datum::Utf8(a), Datum::Utf8(b)) => a.cmp(b),
        (Datum::Binary(a), Datum::Binary(b)) => a.cmp(b),
        (Datum::List(a), Datum::List(b)) | (Datum::Struct(a), Datum::Struct(b)) => {
            for (a, b) in a.iter().zip(b.iter()) {
                let ord = nullable_cmp(a, b, false);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (a, b) => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(d: &Datum) -> u8 {
    match d {
        Datum::Boolean(_) => 0,
        Datum::Int32(_) => 1,
        Datum::Int64(_) => 2,
        Datum::Float64(_) => 3,
        Datum::Utf8(_) => 4,
        Datum::Binary(_) => 5,
        Datum::List(_) => 6,
        Datum::Struct(_) => 7,
    }
}

/// Compare nullable datums with an explicit null position.
pub fn nullable_cmp(a: &Option<Datum>, b: &Option<Datum>, nulls_first: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(_), None) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(a), Some(b)) => datum_cmp(a, b),
    }
}

/// Compare a single column of two rows under a sort key.
pub fn compare_key(a: &Option<Datum>, b: &Option<Datum>, key: &SortKey) -> Ordering {
    let ord = nullable_cmp(a, b, key.nulls_first != key.descending);
    if key.descending {
        ord.reverse()
    } else {
        ord
    }
}

/// Compare two rows under a multi-column sort key.
pub fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ord = compare_key(&a.columns[key.column], &b.columns[key.column], key);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// SQL equality over nullable datums, with nulls considered equal to each
/// other. This is grouping equality ("not distinct from"), not `=`.
pub fn grouping_eq(a: &Option<Datum>, b: &Option<Datum>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => datum_cmp(a, b) == Ordering::Equal,
        _ => false,
    }
}
