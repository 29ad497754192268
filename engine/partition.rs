// ========================================================================================
//
//                      Triangular partitioning of the distance matrix
//
// ========================================================================================
//
// Row `i` of the packed lower triangle holds `i` entries, so splitting rows evenly would
// give the last thread most of the work. Boundaries are instead placed so that every
// piece covers an (almost) equal share of the triangle's area. A job-split run is
// partitioned as if all jobs' threads were one large pool, and each job keeps its own
// contiguous run of boundaries.

use crate::error::{DosageError, Result};
use crate::types::ParallelJob;
use std::ops::Range;

/// Entries in rows `[0, row)` of the packed lower triangle.
#[inline]
pub fn triangle_area(row: usize) -> u128 {
    let row = row as u128;
    row * row.saturating_sub(1) / 2
}

/// Packed length of rows `[start, end)`.
#[inline]
pub fn packed_len(rows: &Range<usize>) -> usize {
    (triangle_area(rows.end) - triangle_area(rows.start)) as usize
}

/// Row boundaries for one job: thread `k` owns rows `[starts[k], starts[k + 1])`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadPartition {
    starts: Vec<usize>,
}

impl ThreadPartition {
    /// Splits `[0, indiv_ct)` among `thread_ct * job.total` pieces and keeps the
    /// `thread_ct` pieces belonging to `job.index`.
    pub fn new(indiv_ct: usize, thread_ct: usize, job: ParallelJob) -> Result<Self> {
        if thread_ct == 0 {
            return Err(DosageError::invalid("thread count must be at least 1"));
        }
        if job.total == 0 || job.index >= job.total {
            return Err(DosageError::invalid(format!(
                "parallel job {} of {} is out of range",
                job.index + 1,
                job.total
            )));
        }
        let pieces = thread_ct
            .checked_mul(job.total)
            .ok_or_else(|| DosageError::invalid("too many threads across parallel jobs"))?;
        let first_piece = job.index * thread_ct;
        let starts = (first_piece..=first_piece + thread_ct)
            .map(|piece| boundary(indiv_ct, piece, pieces))
            .collect();
        Ok(Self { starts })
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.starts.len() - 1
    }

    /// Rows covered by the whole job.
    #[inline]
    pub fn job_rows(&self) -> Range<usize> {
        self.starts[0]..self.starts[self.thread_count()]
    }

    #[inline]
    pub fn thread_rows(&self, thread_idx: usize) -> Range<usize> {
        self.starts[thread_idx]..self.starts[thread_idx + 1]
    }

    /// Packed matrix entries owned by the job.
    #[inline]
    pub fn job_len(&self) -> usize {
        packed_len(&self.job_rows())
    }

    /// Offset of a thread's first entry within the job's packed matrix.
    #[inline]
    pub fn thread_offset(&self, thread_idx: usize) -> usize {
        packed_len(&(self.starts[0]..self.starts[thread_idx]))
    }

    /// Splits a job-local packed matrix into the disjoint pieces owned by each thread.
    pub fn split_rows<'m, T>(&self, matrix: &'m mut [T]) -> RowSlices<'_, 'm, T> {
        debug_assert_eq!(matrix.len(), self.job_len());
        RowSlices {
            bounds: &self.starts,
            rest: matrix,
        }
    }
}

/// First row of `piece` out of `pieces`: the smallest row whose preceding triangle holds
/// at least `ceil(piece * area / pieces)` entries. Rounding up hands any remainder to
/// the earlier pieces.
fn boundary(indiv_ct: usize, piece: usize, pieces: usize) -> usize {
    if piece == 0 {
        return 0;
    }
    if piece == pieces {
        return indiv_ct;
    }
    let total = triangle_area(indiv_ct);
    let target = (piece as u128 * total).div_ceil(pieces as u128);
    // r(r-1)/2 >= target  <=>  r >= (1 + sqrt(1 + 8 target)) / 2
    let estimate = ((1.0 + (1.0 + 8.0 * target as f64).sqrt()) / 2.0) as usize;
    let mut row = estimate.min(indiv_ct);
    while row > 0 && triangle_area(row - 1) >= target {
        row -= 1;
    }
    while row < indiv_ct && triangle_area(row) < target {
        row += 1;
    }
    row
}

/// Iterator over `(rows, packed slice)` per thread.
pub struct RowSlices<'p, 'm, T> {
    bounds: &'p [usize],
    rest: &'m mut [T],
}

impl<'m, T> Iterator for RowSlices<'_, 'm, T> {
    type Item = (Range<usize>, &'m mut [T]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&start, tail) = self.bounds.split_first()?;
        let &end = tail.first()?;
        self.bounds = tail;
        let rows = start..end;
        let (head, rest) = std::mem::take(&mut self.rest).split_at_mut(packed_len(&rows));
        self.rest = rest;
        Some((rows, head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_balance(indiv_ct: usize, thread_ct: usize) {
        let partition = ThreadPartition::new(indiv_ct, thread_ct, ParallelJob::SINGLE).unwrap();
        assert_eq!(partition.job_rows(), 0..indiv_ct);
        let ideal = triangle_area(indiv_ct) as f64 / thread_ct as f64;
        let mut previous_end = 0;
        for thread_idx in 0..partition.thread_count() {
            let rows = partition.thread_rows(thread_idx);
            assert_eq!(rows.start, previous_end);
            assert!(rows.start <= rows.end);
            previous_end = rows.end;
            let area = packed_len(&rows) as f64;
            // never more than one row of work away from an even split
            assert!(
                (area - ideal).abs() <= indiv_ct as f64,
                "N={indiv_ct} T={thread_ct} rows={rows:?} area={area} ideal={ideal}"
            );
        }
        assert_eq!(previous_end, indiv_ct);
    }

    #[test]
    fn partitions_cover_rows_with_balanced_area() {
        for indiv_ct in [2, 3, 5, 17, 64, 100, 1001] {
            for thread_ct in 1..=(indiv_ct / 2).max(1).min(12) {
                check_balance(indiv_ct, thread_ct);
            }
        }
    }

    #[test]
    fn offsets_match_packed_prefix_lengths() {
        let partition = ThreadPartition::new(50, 4, ParallelJob::SINGLE).unwrap();
        let mut expected = 0;
        for thread_idx in 0..partition.thread_count() {
            assert_eq!(partition.thread_offset(thread_idx), expected);
            expected += packed_len(&partition.thread_rows(thread_idx));
        }
        assert_eq!(expected, partition.job_len());
        assert_eq!(partition.job_len(), 50 * 49 / 2);
    }

    #[test]
    fn parallel_jobs_tile_the_full_triangle() {
        let total = 3;
        let mut next_row = 0;
        let mut covered = 0;
        for index in 0..total {
            let partition =
                ThreadPartition::new(40, 2, ParallelJob { index, total }).unwrap();
            assert_eq!(partition.job_rows().start, next_row);
            next_row = partition.job_rows().end;
            covered += partition.job_len();
        }
        assert_eq!(next_row, 40);
        assert_eq!(covered, 40 * 39 / 2);
    }

    #[test]
    fn split_rows_hands_out_disjoint_slices() {
        let partition = ThreadPartition::new(20, 3, ParallelJob::SINGLE).unwrap();
        let mut matrix = vec![0usize; partition.job_len()];
        for (thread_idx, (rows, slice)) in partition.split_rows(&mut matrix).enumerate() {
            assert_eq!(rows, partition.thread_rows(thread_idx));
            slice.iter_mut().for_each(|cell| *cell = thread_idx + 1);
        }
        assert!(matrix.iter().all(|&owner| owner > 0));
        assert!(matrix.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(ThreadPartition::new(10, 0, ParallelJob::SINGLE).is_err());
        assert!(ThreadPartition::new(10, 1, ParallelJob { index: 2, total: 2 }).is_err());
    }
}
