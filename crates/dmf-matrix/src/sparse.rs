use dmf_common::error::{MfError, Result};

/// An immutable coordinate-format sparse matrix (spec §3 `SparseCOO`).
///
/// `nnz` is fixed at construction; there is no insert/remove API because
/// every consumer in this crate (the stratification sort, the per-row ALS
/// accumulation, the SGD point order) relies on the triples never moving
/// once the matrix exists.
#[derive(Clone, Debug)]
pub struct SparseCoo {
    rows: usize,
    cols: usize,
    row: Vec<u32>,
    col: Vec<u32>,
    val: Vec<f64>,
    /// `true` if sorted by `(row, col)` (row-major); `false` if sorted by
    /// `(col, row)` (column-major). Either order is accepted by
    /// `from_triples_sorted`, never both with conflicting data.
    row_major: bool,
}

impl SparseCoo {
    /// Builds from triples already sorted in the claimed order. Debug
    /// builds verify the ordering; release builds trust the caller, as the
    /// teacher's hot paths trust their own invariants rather than
    /// re-validating in every constructor.
    pub fn from_triples_sorted(
        rows: usize,
        cols: usize,
        row: Vec<u32>,
        col: Vec<u32>,
        val: Vec<f64>,
        row_major: bool,
    ) -> Result<Self> {
        if row.len() != col.len() || row.len() != val.len() {
            return Err(MfError::Shape(
                "SparseCoo: row/col/val lengths must match".into(),
            ));
        }
        debug_assert!(is_sorted(&row, &col, row_major));
        Ok(Self {
            rows,
            cols,
            row,
            col,
            val,
            row_major,
        })
    }

    /// Builds from arbitrary triples, sorting them into the requested
    /// order. Used by the I/O collaborator and by `RandomMatrixDescriptor`
    /// generation, neither of which can assume its input arrives sorted.
    pub fn from_triples_unsorted(
        rows: usize,
        cols: usize,
        mut triples: Vec<(u32, u32, f64)>,
        row_major: bool,
    ) -> Self {
        if row_major {
            triples.sort_unstable_by_key(|&(r, c, _)| (r, c));
        } else {
            triples.sort_unstable_by_key(|&(r, c, _)| (c, r));
        }
        let mut row = Vec::with_capacity(triples.len());
        let mut col = Vec::with_capacity(triples.len());
        let mut val = Vec::with_capacity(triples.len());
        for (r, c, v) in triples {
            row.push(r);
            col.push(c);
            val.push(v);
        }
        Self {
            rows,
            cols,
            row,
            col,
            val,
            row_major,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.row.len()
    }

    pub fn is_row_major(&self) -> bool {
        self.row_major
    }

    #[inline]
    pub fn row_at(&self, p: usize) -> u32 {
        self.row[p]
    }

    #[inline]
    pub fn col_at(&self, p: usize) -> u32 {
        self.col[p]
    }

    #[inline]
    pub fn val_at(&self, p: usize) -> f64 {
        self.val[p]
    }

    pub fn triples(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        (0..self.nnz()).map(move |p| (self.row[p], self.col[p], self.val[p]))
    }

    /// `nnz1[i] = |{p : row[p] = i}|`, `nnz2[j] = |{p : col[p] = j}|`, and
    /// `nnz12max = max(max_i nnz1[i], max_j nnz2[j])`.
    ///
    /// Spec §9 open question: the source's accumulator for this helper is
    /// left at the compiler's default (undefined for a plain `double` in
    /// C++); this implementation always starts every counter at `0`.
    pub fn nnz_marginals(&self) -> (Vec<u32>, Vec<u32>, u32) {
        let mut nnz1 = vec![0u32; self.rows];
        let mut nnz2 = vec![0u32; self.cols];
        for p in 0..self.nnz() {
            nnz1[self.row[p] as usize] += 1;
            nnz2[self.col[p] as usize] += 1;
        }
        let max1 = nnz1.iter().copied().max().unwrap_or(0);
        let max2 = nnz2.iter().copied().max().unwrap_or(0);
        (nnz1, nnz2, max1.max(max2))
    }
}

fn is_sorted(row: &[u32], col: &[u32], row_major: bool) -> bool {
    let key = |p: usize| -> (u32, u32) {
        if row_major {
            (row[p], col[p])
        } else {
            (col[p], row[p])
        }
    };
    (1..row.len()).all(|p| key(p - 1) <= key(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nnz_marginals_start_at_zero() {
        let m = SparseCoo::from_triples_unsorted(
            3,
            3,
            vec![(0, 0, 1.0), (1, 1, 2.0), (2, 2, 3.0)],
            true,
        );
        let (nnz1, nnz2, max12) = m.nnz_marginals();
        assert_eq!(nnz1, vec![1, 1, 1]);
        assert_eq!(nnz2, vec![1, 1, 1]);
        assert_eq!(max12, 1);
    }

    #[test]
    fn empty_matrix_has_zero_marginals() {
        let m = SparseCoo::from_triples_unsorted(3, 3, vec![], true);
        let (nnz1, nnz2, max12) = m.nnz_marginals();
        assert_eq!(nnz1, vec![0, 0, 0]);
        assert_eq!(nnz2, vec![0, 0, 0]);
        assert_eq!(max12, 0);
    }

    #[test]
    fn unsorted_triples_are_sorted_row_major() {
        let m = SparseCoo::from_triples_unsorted(
            2,
            2,
            vec![(1, 0, 9.0), (0, 1, 8.0), (0, 0, 7.0)],
            true,
        );
        let ordered: Vec<_> = m.triples().map(|(r, c, _)| (r, c)).collect();
        assert_eq!(ordered, vec![(0, 0), (0, 1), (1, 0)]);
    }
}
