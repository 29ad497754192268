// ========================================================================================
//
//                       Line and field readers for .gen/.sample text
//
// ========================================================================================
//
// Lines are copied into caller-supplied buffers (always carved from the arena), so the
// readers themselves never allocate. A line that does not fit its buffer is reported
// instead of being split.

use crate::error::{DosageError, Result};
use crate::types::GEN_METADATA_FIELDS;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 1 << 16;

/// Individuals parsed per probability block.
pub const PROBABILITY_BLOCK: usize = 8;

pub fn open_checked(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| DosageError::OpenFailure {
        path: path.to_path_buf(),
        source,
    })
}

/// Why a line could not be delivered.
#[derive(Debug)]
pub enum LineError {
    Io(io::Error),
    TooLong { limit: usize },
}

/// Reads newline-terminated lines into borrowed buffers, tracking bytes consumed.
pub struct LineReader<R> {
    inner: BufReader<R>,
    consumed: u64,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER_BYTES, inner),
            consumed: 0,
        }
    }

    /// Bytes consumed from the start of the underlying reader.
    #[inline]
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    /// Copies the next line (without its terminator) into `buf`. Returns `Ok(None)` at
    /// end of input. A final line without a newline is still returned.
    pub fn read_line<'b>(
        &mut self,
        buf: &'b mut [u8],
    ) -> std::result::Result<Option<&'b [u8]>, LineError> {
        let mut len = 0usize;
        loop {
            let available = match self.inner.fill_buf() {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LineError::Io(e)),
            };
            if available.is_empty() {
                if len == 0 {
                    return Ok(None);
                }
                return Ok(Some(trim_carriage_return(&buf[..len])));
            }
            let (take, found_newline) = match memchr::memchr(b'\n', available) {
                Some(pos) => (pos, true),
                None => (available.len(), false),
            };
            if len + take > buf.len() {
                return Err(LineError::TooLong { limit: buf.len() });
            }
            buf[len..len + take].copy_from_slice(&available[..take]);
            len += take;
            let step = take + usize::from(found_newline);
            self.inner.consume(step);
            self.consumed += step as u64;
            if found_newline {
                return Ok(Some(trim_carriage_return(&buf[..len])));
            }
        }
    }
}

impl<R: Read + Seek> LineReader<R> {
    /// Repositions at an absolute byte offset, discarding buffered input.
    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.consumed = offset;
        Ok(())
    }

    #[inline]
    pub fn rewind(&mut self) -> io::Result<()> {
        self.seek_to(0)
    }
}

#[inline]
fn trim_carriage_return(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// True for lines with nothing but whitespace.
#[inline]
pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Walks whitespace-separated fields of a single line.
pub struct FieldCursor<'l> {
    line: &'l [u8],
    pos: usize,
}

impl<'l> FieldCursor<'l> {
    #[inline]
    pub fn new(line: &'l [u8]) -> Self {
        Self { line, pos: 0 }
    }

    pub fn next_field(&mut self) -> Option<&'l [u8]> {
        let rest = &self.line[self.pos..];
        let start = rest.iter().position(|b| !b.is_ascii_whitespace())?;
        let len = rest[start..]
            .iter()
            .position(u8::is_ascii_whitespace)
            .unwrap_or(rest.len() - start);
        self.pos += start + len;
        Some(&rest[start..start + len])
    }

    /// Skips `count` fields. Returns false if the line ran out first.
    pub fn skip_fields(&mut self, count: usize) -> bool {
        (0..count).all(|_| self.next_field().is_some())
    }
}

#[inline]
pub fn parse_f64(field: &[u8]) -> Option<f64> {
    lexical_core::parse::<f64>(field).ok()
}

/// Up to eight individuals' probability triples, lane by lane.
#[derive(Clone, Debug, Default)]
pub struct ProbabilityBlock {
    pub p0: [f64; PROBABILITY_BLOCK],
    pub p1: [f64; PROBABILITY_BLOCK],
    pub p2: [f64; PROBABILITY_BLOCK],
    /// Lanes actually filled; `PROBABILITY_BLOCK` except for the final block of a row.
    pub len: usize,
    /// Index of the individual in lane 0.
    pub first: usize,
}

impl ProbabilityBlock {
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == PROBABILITY_BLOCK
    }

    #[inline]
    pub fn triple(&self, lane: usize) -> (f64, f64, f64) {
        (self.p0[lane], self.p1[lane], self.p2[lane])
    }
}

/// The genotype portion of one `.gen` line: five metadata fields are skipped on
/// construction, then `indiv_ct` probability triples are read block by block.
pub struct ProbabilityRow<'l> {
    cursor: FieldCursor<'l>,
    indiv_ct: usize,
    next: usize,
}

impl<'l> ProbabilityRow<'l> {
    pub fn new(line: &'l [u8], indiv_ct: usize) -> std::result::Result<Self, String> {
        let mut cursor = FieldCursor::new(line);
        if !cursor.skip_fields(GEN_METADATA_FIELDS) {
            return Err("missing marker metadata fields".to_string());
        }
        Ok(Self {
            cursor,
            indiv_ct,
            next: 0,
        })
    }

    /// Fills `block` with the next triples. Returns false once every individual has been
    /// read.
    pub fn next_block(&mut self, block: &mut ProbabilityBlock) -> std::result::Result<bool, String> {
        let len = (self.indiv_ct - self.next).min(PROBABILITY_BLOCK);
        if len == 0 {
            return Ok(false);
        }
        block.first = self.next;
        block.len = len;
        for lane in 0..len {
            let individual = self.next + lane;
            block.p0[lane] = self.probability(individual)?;
            block.p1[lane] = self.probability(individual)?;
            block.p2[lane] = self.probability(individual)?;
        }
        self.next += len;
        Ok(true)
    }

    #[inline]
    fn probability(&mut self, individual: usize) -> std::result::Result<f64, String> {
        let field = self
            .cursor
            .next_field()
            .ok_or_else(|| format!("too few probabilities (individual {})", individual + 1))?;
        parse_f64(field).ok_or_else(|| {
            format!(
                "invalid probability '{}' (individual {})",
                String::from_utf8_lossy(field),
                individual + 1
            )
        })
    }
}

/// Total length of an open file, for percentage progress.
pub fn file_len(file: &File, path: &Path) -> Result<u64> {
    file.metadata()
        .map(|meta| meta.len())
        .map_err(|source| DosageError::read(path.display().to_string(), source))
}
