use groupexec_error::Result;
use groupexec_row::field::Schema;
use groupexec_row::row::Row;

use super::RowSource;

/// In-memory row source backed by a fixed list of rows.
#[derive(Debug)]
pub struct ValuesSource {
    schema: Schema,
    rows: Vec<Row>,
    idx: usize,
}

impl ValuesSource {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        ValuesSource {
            schema,
            rows,
            idx: 0,
        }
    }
}

impl RowSource for ValuesSource {
    fn next(&mut self) -> Result<Option<Row>> {
        match self.rows.get(self.idx) {
            Some(row) => {
                self.idx += 1;
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    fn rescan(&mut self) -> Result<()> {
        self.idx = 0;
        Ok(())
    }

    fn output_schema(&self) -> &Schema {
        &self.schema
    }
}
