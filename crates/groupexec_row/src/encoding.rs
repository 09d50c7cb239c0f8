//! Compact, self-describing row encoding used for spill tuples.
//!
//! Layout: `u16` column count, then per column a one-byte type tag followed by
//! a fixed- or length-prefixed payload. The encoding carries its own type
//! information so readers do not need the writer's schema; a spilled tuple can
//! therefore be decoded after the executor has switched input shapes.

use groupexec_error::{ErrorKind, GroupExecError, Result};

use crate::datum::Datum;
use crate::row::Row;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_FLOAT64: u8 = 4;
const TAG_UTF8: u8 = 5;
const TAG_BINARY: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_STRUCT: u8 = 8;

/// Encode a row, appending to `out`.
///
/// `keep` masks the columns worth writing; unmasked columns are encoded as
/// nulls so the decoded row keeps its width while dropping payload bytes.
pub fn encode_row(row: &Row, keep: Option<&[bool]>, out: &mut Vec<u8>) {
    debug_assert!(row.num_columns() <= u16::MAX as usize);
    out.extend_from_slice(&(row.num_columns() as u16).to_le_bytes());

    for (idx, col) in row.columns.iter().enumerate() {
        let wanted = keep.map(|mask| mask[idx]).unwrap_or(true);
        match col {
            Some(datum) if wanted => encode_datum(datum, out),
            _ => out.push(TAG_NULL),
        }
    }
}

fn encode_datum(datum: &Datum, out: &mut Vec<u8>) {
    match datum {
        Datum::Boolean(v) => {
            out.push(TAG_BOOL);
            out.push(*v as u8);
        }
        Datum::Int32(v) => {
            out.push(TAG_INT32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int64(v) => {
            out.push(TAG_INT64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            out.push(TAG_FLOAT64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Utf8(v) => {
            out.push(TAG_UTF8);
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        Datum::Binary(v) => {
            out.push(TAG_BINARY);
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        Datum::List(elems) => {
            out.push(TAG_LIST);
            encode_elems(elems, out);
        }
        Datum::Struct(fields) => {
            out.push(TAG_STRUCT);
            encode_elems(fields, out);
        }
    }
}

fn encode_elems(elems: &[Option<Datum>], out: &mut Vec<u8>) {
    out.extend_from_slice(&(elems.len() as u32).to_le_bytes());
    for elem in elems {
        match elem {
            Some(datum) => encode_datum(datum, out),
            None => out.push(TAG_NULL),
        }
    }
}

/// Decode a row from the full contents of `buf`.
pub fn decode_row(buf: &[u8]) -> Result<Row> {
    let mut reader = ByteReader { buf, pos: 0 };
    let ncols = reader.read_u16()? as usize;

    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        columns.push(reader.read_datum()?);
    }

    if reader.pos != buf.len() {
        return Err(decode_error("trailing bytes after row"));
    }

    Ok(Row { columns })
}

fn decode_error(msg: &str) -> GroupExecError {
    GroupExecError::with_kind(format!("Malformed spill tuple: {msg}"), ErrorKind::Io)
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(decode_error("short read"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_datum(&mut self) -> Result<Option<Datum>> {
        let tag = self.read_u8()?;
        let datum = match tag {
            TAG_NULL => return Ok(None),
            TAG_BOOL => Datum::Boolean(self.read_u8()? != 0),
            TAG_INT32 => {
                let bytes = self.take(4)?;
                Datum::Int32(i32::from_le_bytes(bytes.try_into().expect("4 bytes")))
            }
            TAG_INT64 => {
                let bytes = self.take(8)?;
                Datum::Int64(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
            }
            TAG_FLOAT64 => {
                let bytes = self.take(8)?;
                Datum::Float64(f64::from_le_bytes(bytes.try_into().expect("8 bytes")))
            }
            TAG_UTF8 => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                Datum::Utf8(
                    std::str::from_utf8(bytes)
                        .map_err(|_| decode_error("invalid utf8"))?
                        .to_string(),
                )
            }
            TAG_BINARY => {
                let len = self.read_u32()? as usize;
                Datum::Binary(self.take(len)?.to_vec())
            }
            TAG_LIST => Datum::List(self.read_elems()?),
            TAG_STRUCT => Datum::Struct(self.read_elems()?),
            other => return Err(decode_error(&format!("unknown type tag {other}"))),
        };
        Ok(Some(datum))
    }

    fn read_elems(&mut self) -> Result<Vec<Option<Datum>>> {
        let len = self.read_u32()? as usize;
        let mut elems = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            elems.push(self.read_datum()?);
        }
        Ok(elems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(row: &Row) -> Row {
        let mut buf = Vec::new();
        encode_row(row, None, &mut buf);
        decode_row(&buf).unwrap()
    }

    #[test]
    fn roundtrip_mixed_row() {
        let row: Row = [
            Some(Datum::Int64(-7)),
            None,
            Some(Datum::from("grp")),
            Some(Datum::Float64(1.5)),
            Some(Datum::Struct(vec![Some(Datum::Float64(3.0)), Some(Datum::Int64(2))])),
        ]
        .into_iter()
        .collect();

        assert_eq!(row, roundtrip(&row));
    }

    #[test]
    fn keep_mask_writes_null_placeholders() {
        let row: Row = [Some(Datum::from("wide-column-we-do-not-need")), Some(Datum::Int64(1))]
            .into_iter()
            .collect();

        let mut buf = Vec::new();
        encode_row(&row, Some(&[false, true]), &mut buf);

        let decoded = decode_row(&buf).unwrap();
        assert_eq!(2, decoded.num_columns());
        assert_eq!(None, decoded.columns[0]);
        assert_eq!(Some(Datum::Int64(1)), decoded.columns[1]);
    }

    #[test]
    fn truncated_payload_errors() {
        let row: Row = [Some(Datum::from("abcdef"))].into_iter().collect();
        let mut buf = Vec::new();
        encode_row(&row, None, &mut buf);
        buf.truncate(buf.len() - 2);

        assert!(decode_row(&buf).is_err());
    }
}
