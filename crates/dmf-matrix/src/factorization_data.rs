use crate::dense::Dense;
use crate::sparse::SparseCoo;

/// `(V, Vc?, W, H, nnz1, nnz2, nnz12max, tasks)` (spec §3).
///
/// `Vc` is an optional column-major mirror of `V`, used by ALS/GNMF, whose
/// per-column accumulation is far cheaper against a column-sorted copy
/// than against the row-sorted `V` the SGD kernels want.
pub struct FactorizationData {
    pub v: SparseCoo,
    pub vc: Option<SparseCoo>,
    pub w: Dense,
    pub h: Dense,
    pub nnz1: Vec<u32>,
    pub nnz2: Vec<u32>,
    pub nnz12max: u32,
    pub tasks: usize,
}

impl FactorizationData {
    pub fn new(v: SparseCoo, vc: Option<SparseCoo>, w: Dense, h: Dense, tasks: usize) -> Self {
        let (nnz1, nnz2, nnz12max) = v.nnz_marginals();
        Self {
            v,
            vc,
            w,
            h,
            nnz1,
            nnz2,
            nnz12max,
            tasks,
        }
    }

    pub fn rank(&self) -> usize {
        self.w.cols()
    }

    /// A view restricted to one (row-block, col-block) pair, with `nnz1`
    /// and `nnz2` re-derived for the block's local index space and offset
    /// by the block's global row/col offsets so update functors that read
    /// `nnz1[i]`/`nnz2[j]` see the whole row/column's degree, not just the
    /// block-local count (spec §4.6 step 3).
    pub fn block_view(
        v_block: SparseCoo,
        w_block: Dense,
        h_block: Dense,
        nnz1_global: &[u32],
        nnz2_global: &[u32],
        row_offset: usize,
        col_offset: usize,
        tasks: usize,
    ) -> Self {
        let rows = v_block.rows();
        let cols = v_block.cols();
        let nnz1 = nnz1_global[row_offset..row_offset + rows].to_vec();
        let nnz2 = nnz2_global[col_offset..col_offset + cols].to_vec();
        let nnz12max = nnz1
            .iter()
            .chain(nnz2.iter())
            .copied()
            .max()
            .unwrap_or(0);
        Self {
            v: v_block,
            vc: None,
            w: w_block,
            h: h_block,
            nnz1,
            nnz2,
            nnz12max,
            tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Order;

    #[test]
    fn nnz12max_is_the_max_of_both_marginals() {
        let v = SparseCoo::from_triples_unsorted(
            2,
            3,
            vec![(0, 0, 1.0), (0, 1, 1.0), (0, 2, 1.0), (1, 0, 1.0)],
            true,
        );
        let w = Dense::zeros(2, 1, Order::RowMajor);
        let h = Dense::zeros(1, 3, Order::ColMajor);
        let data = FactorizationData::new(v, None, w, h, 1);
        // row 0 has 3 nonzeros, row 1 has 1; cols have 2,1,1
        assert_eq!(data.nnz12max, 3);
    }
}
