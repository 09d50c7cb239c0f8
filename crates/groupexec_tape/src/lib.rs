//! Logical tape sets: numbered append-only byte streams backed by temporary
//! files, used by the executor to park spilled tuples.
//!
//! A tape is written once, rewound once, then read to exhaustion. Tape
//! numbering is dense and stable: extending a set appends new tapes without
//! renumbering existing ones.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use groupexec_error::{ErrorKind, GroupExecError, Result};
use tracing::trace;

/// Block size assumed for tape buffering. Mirrors the executor's accounting
/// of per-open-tape memory overhead.
pub const BLOCK_SIZE: usize = 8192;

#[derive(Debug)]
enum TapeState {
    Writing(BufWriter<File>),
    Reading(BufReader<File>),
    Closed,
}

#[derive(Debug)]
struct Tape {
    state: TapeState,
    written: u64,
}

/// A set of logical tapes sharing one lifetime.
///
/// Dropping the set closes all tapes; the backing files are unlinked
/// temporary files and vanish with their handles.
#[derive(Debug)]
pub struct TapeSet {
    tapes: Vec<Tape>,
}

impl TapeSet {
    /// Create a set with `n` empty tapes open for writing.
    pub fn create(n: usize) -> Result<Self> {
        let mut set = TapeSet { tapes: Vec::new() };
        set.extend(n)?;
        Ok(set)
    }

    /// Append `n` new tapes, returning the number of the first one. Existing
    /// tape numbers are unchanged.
    pub fn extend(&mut self, n: usize) -> Result<usize> {
        let first = self.tapes.len();
        for _ in 0..n {
            let file = tempfile::tempfile().map_err(|e| {
                GroupExecError::with_kind(
                    format!("Failed to create tape backing file: {e}"),
                    ErrorKind::Io,
                )
            })?;
            self.tapes.push(Tape {
                state: TapeState::Writing(BufWriter::with_capacity(BLOCK_SIZE, file)),
                written: 0,
            });
        }
        trace!(first, n, "extended tape set");
        Ok(first)
    }

    pub fn tape_count(&self) -> usize {
        self.tapes.len()
    }

    /// Total bytes written across all tapes in the set.
    pub fn bytes_written(&self) -> u64 {
        self.tapes.iter().map(|t| t.written).sum()
    }

    fn tape_mut(&mut self, tape: usize) -> Result<&mut Tape> {
        let count = self.tapes.len();
        self.tapes.get_mut(tape).ok_or_else(|| {
            GroupExecError::new(format!("Tape {tape} out of range (set has {count})"))
        })
    }

    /// Append bytes to a tape. Errors if the tape has been rewound for
    /// reading.
    pub fn write(&mut self, tape: usize, bytes: &[u8]) -> Result<()> {
        let t = self.tape_mut(tape)?;
        match &mut t.state {
            TapeState::Writing(w) => {
                w.write_all(bytes).map_err(io_err)?;
                t.written += bytes.len() as u64;
                Ok(())
            }
            _ => Err(GroupExecError::new(format!(
                "Tape {tape} is not open for writing"
            ))),
        }
    }

    /// Flush pending writes and position the tape at its start for reading.
    pub fn rewind_for_read(&mut self, tape: usize) -> Result<()> {
        let t = self.tape_mut(tape)?;
        let state = std::mem::replace(&mut t.state, TapeState::Closed);
        match state {
            TapeState::Writing(w) => {
                let mut file = w.into_inner().map_err(|e| {
                    GroupExecError::with_kind(
                        format!("Failed to flush tape {tape}: {e}"),
                        ErrorKind::Io,
                    )
                })?;
                file.seek(SeekFrom::Start(0)).map_err(io_err)?;
                t.state = TapeState::Reading(BufReader::with_capacity(BLOCK_SIZE, file));
                Ok(())
            }
            other => {
                t.state = other;
                Err(GroupExecError::new(format!(
                    "Tape {tape} is not open for writing"
                )))
            }
        }
    }

    /// Read up to `buf.len()` bytes. Returns the number of bytes read; zero
    /// means end of tape.
    pub fn read(&mut self, tape: usize, buf: &mut [u8]) -> Result<usize> {
        let t = self.tape_mut(tape)?;
        match &mut t.state {
            TapeState::Reading(r) => {
                let mut total = 0;
                while total < buf.len() {
                    let n = r.read(&mut buf[total..]).map_err(io_err)?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                Ok(total)
            }
            _ => Err(GroupExecError::new(format!(
                "Tape {tape} is not open for reading"
            ))),
        }
    }

    /// Release a single tape's backing storage early.
    pub fn close_tape(&mut self, tape: usize) -> Result<()> {
        let t = self.tape_mut(tape)?;
        t.state = TapeState::Closed;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> GroupExecError {
    GroupExecError::with_kind(format!("Tape IO error: {e}"), ErrorKind::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_rewind_read() {
        let mut set = TapeSet::create(2).unwrap();
        set.write(0, b"hello ").unwrap();
        set.write(0, b"tape").unwrap();
        set.write(1, b"other").unwrap();

        set.rewind_for_read(0).unwrap();
        let mut buf = vec![0; 16];
        let n = set.read(0, &mut buf).unwrap();
        assert_eq!(b"hello tape", &buf[..n]);

        // Subsequent read hits end of tape.
        assert_eq!(0, set.read(0, &mut buf).unwrap());
    }

    #[test]
    fn extend_keeps_existing_numbering() {
        let mut set = TapeSet::create(4).unwrap();
        set.write(3, b"x").unwrap();

        let first_new = set.extend(4).unwrap();
        assert_eq!(4, first_new);
        assert_eq!(8, set.tape_count());

        // Tape 3 still holds its data.
        set.rewind_for_read(3).unwrap();
        let mut buf = [0; 4];
        assert_eq!(1, set.read(3, &mut buf).unwrap());
        assert_eq!(b'x', buf[0]);
    }

    #[test]
    fn read_before_rewind_errors() {
        let mut set = TapeSet::create(1).unwrap();
        set.write(0, b"abc").unwrap();
        let mut buf = [0; 4];
        assert!(set.read(0, &mut buf).is_err());
    }

    #[test]
    fn bytes_written_accumulates() {
        let mut set = TapeSet::create(2).unwrap();
        set.write(0, &[0; 100]).unwrap();
        set.write(1, &[0; 28]).unwrap();
        assert_eq!(128, set.bytes_written());
    }
}
