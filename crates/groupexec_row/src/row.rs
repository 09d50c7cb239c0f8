use std::mem;

use crate::datum::Datum;

/// Representation of a single owned row.
///
/// Columns are nullable; a `None` column is an SQL null.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub columns: Vec<Option<Datum>>,
}

impl Row {
    /// Create an empty row.
    pub const fn empty() -> Self {
        Row {
            columns: Vec::new(),
        }
    }

    /// Create a row of `n` null columns.
    pub fn nulls(n: usize) -> Self {
        Row {
            columns: vec![None; n],
        }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Column accessor. Panics on out-of-range access; the executor validates
    /// column indices at plan-build time.
    pub fn column(&self, idx: usize) -> &Option<Datum> {
        &self.columns[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Option<Datum>> {
        self.columns.iter()
    }

    /// Project a subset of columns into a new row.
    pub fn project(&self, indices: &[usize]) -> Row {
        Row {
            columns: indices.iter().map(|&idx| self.columns[idx].clone()).collect(),
        }
    }

    /// Bytes of transient allocation held by the row's values.
    pub fn heap_size(&self) -> usize {
        self.columns.len() * mem::size_of::<Option<Datum>>()
            + self
                .columns
                .iter()
                .flatten()
                .map(|d| d.heap_size())
                .sum::<usize>()
    }
}

impl FromIterator<Option<Datum>> for Row {
    fn from_iter<T: IntoIterator<Item = Option<Datum>>>(iter: T) -> Self {
        Row {
            columns: iter.into_iter().collect(),
        }
    }
}

impl FromIterator<Datum> for Row {
    fn from_iter<T: IntoIterator<Item = Datum>>(iter: T) -> Self {
        Row {
            columns: iter.into_iter().map(Some).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_reorders_and_duplicates() {
        let row: Row = [Some(Datum::Int64(1)), None, Some(Datum::from("x"))]
            .into_iter()
            .collect();

        let projected = row.project(&[2, 0, 0]);
        assert_eq!(
            Row::from_iter([Some(Datum::from("x")), Some(Datum::Int64(1)), Some(Datum::Int64(1))]),
            projected
        );
    }
}
