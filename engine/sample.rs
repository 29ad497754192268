// ========================================================================================
//
//                              The .sample metadata loader
//
// ========================================================================================
//
// Two passes over the file. The first validates both header lines, counts individuals
// and measures the longest identifier; its line buffer lives in a scope that is retired
// before the identifier table is carved out. The second pass seeks back to the first data
// line and fills identifiers, phenotypes and the phenotype-missing bitmap.

use crate::arena::Scope;
use crate::error::{DosageError, Result, SAMPLE_FILE};
use crate::io::{self, FieldCursor, LineError, LineReader};
use crate::types::{count_set, is_set, set_bit, words_for_bits};
use std::borrow::Cow;
use std::io::{Read, Seek};
use std::path::Path;

/// Longest accepted `.sample` line.
pub const MAX_LINE_LEN: usize = 131_072;

/// Smallest identifier slot, even when every identifier is shorter.
const MIN_ID_LEN: usize = 4;

const HEADER_FIRST: &[u8] = b"ID_1 ID_2 missing ";
const HEADER_SECOND: &[u8] = b"0 0 0 ";

/// Individuals loaded from a `.sample` file.
pub struct SampleTable<'a> {
    ids: &'a [u8],
    max_id_len: usize,
    phenotypes: &'a [f64],
    pheno_missing: &'a [u64],
    excluded: &'a mut [u64],
    count: usize,
}

impl<'a> SampleTable<'a> {
    /// Individuals in the file, excluded ones included.
    #[inline]
    pub fn unfiltered_count(&self) -> usize {
        self.count
    }

    /// Individuals that take part in the distance calculation.
    #[inline]
    pub fn included_count(&self) -> usize {
        self.count - count_set(self.excluded)
    }

    /// Bytes reserved per identifier, terminator included.
    #[inline]
    pub fn max_id_len(&self) -> usize {
        self.max_id_len
    }

    /// The stored `ID_1\tID_2` identifier.
    pub fn id_bytes(&self, idx: usize) -> &'a [u8] {
        let ids: &'a [u8] = self.ids;
        let slot = &ids[idx * self.max_id_len..(idx + 1) * self.max_id_len];
        let end = memchr::memchr(0, slot).unwrap_or(slot.len());
        &slot[..end]
    }

    pub fn id(&self, idx: usize) -> Cow<'a, str> {
        String::from_utf8_lossy(self.id_bytes(idx))
    }

    pub fn phenotype(&self, idx: usize) -> Option<f64> {
        (!is_set(self.pheno_missing, idx)).then(|| self.phenotypes[idx])
    }

    #[inline]
    pub fn pheno_missing(&self) -> &[u64] {
        self.pheno_missing
    }

    #[inline]
    pub fn exclusions(&self) -> &[u64] {
        self.excluded
    }

    #[inline]
    pub fn is_excluded(&self, idx: usize) -> bool {
        is_set(self.excluded, idx)
    }

    /// Drops an individual from the distance calculation.
    pub fn exclude(&mut self, idx: usize) {
        set_bit(self.excluded, idx);
    }

    /// Indices of included individuals, in file order.
    pub fn included(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).filter(|&idx| !self.is_excluded(idx))
    }
}

/// Validates a comma-separated missing-phenotype code list.
pub fn validate_missing_codes(codes: &str) -> Result<()> {
    if codes.split(',').any(str::is_empty) {
        return Err(DosageError::invalid(format!(
            "empty entry in missing phenotype code list '{codes}'"
        )));
    }
    Ok(())
}

fn is_missing_code(field: &[u8], codes: Option<&str>) -> bool {
    codes.is_some_and(|list| list.split(',').any(|code| code.as_bytes() == field))
}

pub fn load_samples<'a>(
    scope: &mut Scope<'a>,
    path: &Path,
    missing_codes: Option<&str>,
) -> Result<SampleTable<'a>> {
    let file = io::open_checked(path)?;
    read_samples(scope, file, missing_codes)
}

pub fn read_samples<'a, R: Read + Seek>(
    scope: &mut Scope<'a>,
    source: R,
    missing_codes: Option<&str>,
) -> Result<SampleTable<'a>> {
    if let Some(codes) = missing_codes {
        validate_missing_codes(codes)?;
    }
    let mut reader = LineReader::new(source);

    let (data_start, count, max_id_len) = {
        let scan = scope.child();
        let buf = scan.alloc_zeroed::<u8>(MAX_LINE_LEN)?;
        count_individuals(&mut reader, buf)?
    };
    if count == 0 {
        return Err(DosageError::format(SAMPLE_FILE, "no individuals"));
    }
    log::debug!("{count} individuals in .sample file (identifier slot {max_id_len} bytes).");

    let ids = scope.alloc_zeroed::<u8>(count * max_id_len)?;
    let phenotypes = scope.alloc_slice::<f64>(count, f64::NAN)?;
    let pheno_missing = scope.alloc_zeroed::<u64>(words_for_bits(count))?;
    let excluded = scope.alloc_zeroed::<u64>(words_for_bits(count))?;

    {
        let fill = scope.child();
        let buf = fill.alloc_zeroed::<u8>(MAX_LINE_LEN)?;
        reader
            .seek_to(data_start)
            .map_err(|e| DosageError::read(SAMPLE_FILE, e))?;
        let mut idx = 0usize;
        while let Some(line) = next_line(&mut reader, buf)? {
            if io::is_blank(line) {
                continue;
            }
            if idx == count {
                break;
            }
            let mut cursor = FieldCursor::new(line);
            let (id1, id2) = read_id_fields(&mut cursor, idx)?;
            let slot = &mut ids[idx * max_id_len..(idx + 1) * max_id_len];
            slot[..id1.len()].copy_from_slice(id1);
            slot[id1.len()] = b'\t';
            slot[id1.len() + 1..id1.len() + 1 + id2.len()].copy_from_slice(id2);

            if !cursor.skip_fields(2) {
                return Err(short_line(idx));
            }
            let pheno = cursor.next_field().ok_or_else(|| short_line(idx))?;
            if is_missing_code(pheno, missing_codes) {
                set_bit(pheno_missing, idx);
            } else {
                phenotypes[idx] = io::parse_f64(pheno).ok_or_else(|| {
                    DosageError::format(
                        SAMPLE_FILE,
                        format!(
                            "invalid phenotype '{}' for individual {}",
                            String::from_utf8_lossy(pheno),
                            idx + 1
                        ),
                    )
                })?;
            }
            idx += 1;
        }
        if idx != count {
            return Err(DosageError::format(
                SAMPLE_FILE,
                "file changed between passes",
            ));
        }
    }

    Ok(SampleTable {
        ids,
        max_id_len,
        phenotypes,
        pheno_missing,
        excluded,
        count,
    })
}

/// First pass: checks the two header lines, then counts data lines and sizes the
/// identifier slot. Returns the offset of the first data line as well.
fn count_individuals<R: Read>(
    reader: &mut LineReader<R>,
    buf: &mut [u8],
) -> Result<(u64, usize, usize)> {
    let first = next_line(reader, buf)?.unwrap_or_default();
    if !first.starts_with(HEADER_FIRST) {
        return Err(DosageError::format(
            SAMPLE_FILE,
            "first line must begin with 'ID_1 ID_2 missing'",
        ));
    }
    let second = next_line(reader, buf)?.unwrap_or_default();
    if !second.starts_with(HEADER_SECOND) {
        return Err(DosageError::format(
            SAMPLE_FILE,
            "second line must begin with '0 0 0'",
        ));
    }
    let data_start = reader.bytes_consumed();

    let mut count = 0usize;
    let mut max_id_len = MIN_ID_LEN;
    while let Some(line) = next_line(reader, buf)? {
        if io::is_blank(line) {
            continue;
        }
        let mut cursor = FieldCursor::new(line);
        let (id1, id2) = read_id_fields(&mut cursor, count)?;
        max_id_len = max_id_len.max(2 + id1.len() + id2.len());
        count += 1;
    }
    Ok((data_start, count, max_id_len))
}

fn next_line<'b, R: Read>(reader: &mut LineReader<R>, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>> {
    reader.read_line(buf).map_err(|err| match err {
        LineError::Io(source) => DosageError::read(SAMPLE_FILE, source),
        LineError::TooLong { limit } => DosageError::format(
            SAMPLE_FILE,
            format!("excessively long line (limit {limit} bytes)"),
        ),
    })
}

fn read_id_fields<'l>(cursor: &mut FieldCursor<'l>, idx: usize) -> Result<(&'l [u8], &'l [u8])> {
    let id1 = cursor.next_field().ok_or_else(|| short_line(idx))?;
    let id2 = cursor.next_field().ok_or_else(|| short_line(idx))?;
    Ok((id1, id2))
}

fn short_line(idx: usize) -> DosageError {
    DosageError::format(
        SAMPLE_FILE,
        format!("too few fields for individual {}", idx + 1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use std::io::Cursor;

    const HEADER: &str = "ID_1 ID_2 missing sex pheno\n0 0 0 D P\n";

    fn sample(body: &str) -> Cursor<Vec<u8>> {
        Cursor::new(format!("{HEADER}{body}").into_bytes())
    }

    #[test]
    fn loads_identifiers_and_phenotypes() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        let body = "fam1 ind1 0 1 2.5\n\nfamily_two i2 0 2 NA\nf3 i3 0.1 1 -1\n";
        let table = read_samples(&mut scope, sample(body), Some("NA,-9")).unwrap();
        assert_eq!(table.unfiltered_count(), 3);
        assert_eq!(table.included_count(), 3);
        assert_eq!(table.id(0), "fam1\tind1");
        assert_eq!(table.id(1), "family_two\ti2");
        assert_eq!(table.max_id_len(), 2 + "family_two".len() + "i2".len());
        for idx in 0..3 {
            assert!(table.id_bytes(idx).len() < table.max_id_len());
        }
        assert_eq!(table.phenotype(0), Some(2.5));
        assert_eq!(table.phenotype(1), None);
        assert_eq!(table.phenotype(2), Some(-1.0));
        assert!(table.exclusions().iter().all(|&w| w == 0));
    }

    #[test]
    fn scan_buffers_are_released() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        read_samples(&mut scope, sample("a b 0 0 1\n"), None).unwrap();
        assert!(scope.used() < MAX_LINE_LEN);
    }

    #[test]
    fn exclusion_reduces_included_count() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        let mut table =
            read_samples(&mut scope, sample("a b 0 0 1\nc d 0 0 1\ne f 0 0 1\n"), None).unwrap();
        table.exclude(1);
        assert_eq!(table.included_count(), 2);
        assert_eq!(table.included().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn rejects_bad_headers() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        let bad_first = Cursor::new(b"ID_1 ID_2 sex\n0 0 0\na b 0 0 1\n".to_vec());
        assert!(matches!(
            read_samples(&mut scope, bad_first, None),
            Err(DosageError::FormatError { .. })
        ));
        let bad_second = Cursor::new(b"ID_1 ID_2 missing x\n0 0 x\na b 0 0 1\n".to_vec());
        assert!(matches!(
            read_samples(&mut scope, bad_second, None),
            Err(DosageError::FormatError { .. })
        ));
    }

    #[test]
    fn rejects_empty_sample_set() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        assert!(matches!(
            read_samples(&mut scope, sample("\n\n"), None),
            Err(DosageError::FormatError { .. })
        ));
    }

    #[test]
    fn rejects_unparseable_phenotype_and_short_lines() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        assert!(matches!(
            read_samples(&mut scope, sample("a b 0 0 oops\n"), Some("NA")),
            Err(DosageError::FormatError { .. })
        ));
        assert!(matches!(
            read_samples(&mut scope, sample("a b 0 0\n"), Some("NA")),
            Err(DosageError::FormatError { .. })
        ));
    }

    #[test]
    fn rejects_excessively_long_line() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut scope = arena.scope();
        let long = format!("a {} 0 0 1\n", "x".repeat(MAX_LINE_LEN));
        assert!(matches!(
            read_samples(&mut scope, sample(&long), None),
            Err(DosageError::FormatError { .. })
        ));
    }

    #[test]
    fn rejects_empty_missing_code() {
        assert!(matches!(
            validate_missing_codes("NA,,-9"),
            Err(DosageError::InvalidConfiguration(_))
        ));
        assert!(validate_missing_codes("NA").is_ok());
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let mut arena = Arena::with_capacity(1024).unwrap();
        let mut scope = arena.scope();
        assert!(matches!(
            read_samples(&mut scope, sample("a b 0 0 1\n"), None),
            Err(DosageError::OutOfMemory { .. })
        ));
    }
}
