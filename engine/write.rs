// ========================================================================================
//
//                               Distance matrix output
//
// ========================================================================================

use crate::error::{DosageError, Result};
use crate::pipeline::DistanceMatrix;
use crate::sample::SampleTable;
use crate::types::ParallelJob;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Which transform of the accumulated distances is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatrixKind {
    /// Mean allelic distance per marker.
    Distance,
    /// Identity-by-state similarity, `1 - d`.
    Ibs,
    /// Identity-by-state distance.
    OneMinusIbs,
}

impl MatrixKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Distance => ".dist",
            Self::Ibs => ".mibs",
            Self::OneMinusIbs => ".mdist",
        }
    }

    #[inline]
    fn transform(self, raw: f64, distance_scale: f64, ibs_scale: f64) -> f64 {
        match self {
            Self::Distance => raw * distance_scale,
            Self::Ibs => 1.0 - raw * ibs_scale,
            Self::OneMinusIbs => raw * ibs_scale,
        }
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// `<prefix><ext>[.<job>][.gz]`, where the job suffix is 1-based and only present for
/// split runs.
pub fn matrix_path(prefix: &Path, kind: MatrixKind, gzip: bool, job: ParallelJob) -> PathBuf {
    let mut suffix = kind.extension().to_string();
    if job.total > 1 {
        suffix.push_str(&format!(".{}", job.index + 1));
    }
    if gzip {
        suffix.push_str(".gz");
    }
    with_suffix(prefix, &suffix)
}

/// Writes the job's rows of the lower triangle, one tab-separated line per individual
/// with at least one stored pair.
pub fn write_matrix(
    prefix: &Path,
    matrix: &DistanceMatrix<'_>,
    kind: MatrixKind,
    gzip: bool,
    job: ParallelJob,
) -> Result<PathBuf> {
    let path = matrix_path(prefix, kind, gzip, job);
    let failure = |source: io::Error| DosageError::WriteFailure {
        path: path.clone(),
        source,
    };
    let file = File::create(&path).map_err(failure)?;
    if gzip {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        write_rows(&mut encoder, matrix, kind).map_err(failure)?;
        encoder.finish().and_then(|mut inner| inner.flush()).map_err(failure)?;
    } else {
        let mut writer = BufWriter::new(file);
        write_rows(&mut writer, matrix, kind).map_err(failure)?;
        writer.flush().map_err(failure)?;
    }
    log::info!("Distances written to {}.", path.display());
    Ok(path)
}

fn write_rows<W: Write>(writer: &mut W, matrix: &DistanceMatrix<'_>, kind: MatrixKind) -> io::Result<()> {
    let distance_scale = matrix.distance_scale();
    let ibs_scale = matrix.ibs_scale();
    let mut number = ryu::Buffer::new();
    let mut line = Vec::new();
    for i in matrix.rows() {
        let Some(row) = matrix.row(i) else { continue };
        let Some((last, head)) = row.split_last() else { continue };
        line.clear();
        for &raw in head {
            line.extend_from_slice(number.format(kind.transform(raw, distance_scale, ibs_scale)).as_bytes());
            line.push(b'\t');
        }
        line.extend_from_slice(number.format(kind.transform(*last, distance_scale, ibs_scale)).as_bytes());
        line.push(b'\n');
        writer.write_all(&line)?;
    }
    Ok(())
}

/// Writes `ID_1\tID_2` for every included individual to `<prefix><ext>.id`.
pub fn write_ids(prefix: &Path, kind: MatrixKind, samples: &SampleTable<'_>) -> Result<PathBuf> {
    let path = with_suffix(prefix, &format!("{}.id", kind.extension()));
    let failure = |source: io::Error| DosageError::WriteFailure {
        path: path.clone(),
        source,
    };
    let mut writer = BufWriter::new(File::create(&path).map_err(failure)?);
    for idx in samples.included() {
        writer
            .write_all(samples.id_bytes(idx))
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(failure)?;
    }
    writer.flush().map_err(failure)?;
    Ok(path)
}
