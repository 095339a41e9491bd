use std::sync::Arc;

use dmf_common::rng::SplitMix64;
use dmf_matrix::distributed::default_offsets;
use dmf_matrix::{FactorizationData, SparseCoo};

use crate::sgd::run_regularize;
use crate::update::{Regularize, Update};

/// Solves `alpha*b^2 + beta*b + gamma = 0` for the positive root `b`, the
/// number of row/column blocks such that one row-block of `W` plus one
/// column-block of `H` fit in `cache_bytes` of last-level cache (spec
/// §4.8): `alpha = cache_bytes`, `beta = -(rows+cols)*rank*8`, `gamma =
/// -nnz*3*8` (three 8-byte fields per nonzero: row, col, value).
pub fn choose_block_count(rows: usize, cols: usize, rank: usize, nnz: usize, cache_bytes: f64) -> usize {
    let alpha = cache_bytes;
    let beta = -((rows + cols) as f64) * rank as f64 * 8.0;
    let gamma = -(nnz as f64) * 3.0 * 8.0;
    let discriminant = beta * beta - 4.0 * alpha * gamma;
    let b = (-beta + discriminant.sqrt()) / (2.0 * alpha);
    b.round().max(1.0) as usize
}

fn block_of(offsets: &[usize], index: u32) -> usize {
    let index = index as usize;
    match offsets.binary_search(&index) {
        Ok(b) if b == offsets.len() - 1 => b - 1,
        Ok(b) => b,
        Err(b) => b - 1,
    }
}

/// `V` reordered into a `b x b` grid of (row-block, col-block) cells (spec
/// §4.8 "V is sorted by (row-block, col-block) and an offsets table is
/// stored"). `order[cell_offsets[c]..cell_offsets[c+1]]` lists the
/// original point indices belonging to cell `c = row_block * b + col_block`.
pub struct StratifiedLayout {
    pub b: usize,
    pub row_offsets: Vec<usize>,
    pub col_offsets: Vec<usize>,
    pub order: Vec<usize>,
    pub cell_offsets: Vec<usize>,
}

impl StratifiedLayout {
    pub fn build(v: &SparseCoo, b: usize) -> Self {
        let row_offsets = default_offsets(v.rows(), b);
        let col_offsets = default_offsets(v.cols(), b);

        let cell_of = |p: usize| -> usize {
            let rb = block_of(&row_offsets, v.row_at(p));
            let cb = block_of(&col_offsets, v.col_at(p));
            rb * b + cb
        };

        let mut order: Vec<usize> = (0..v.nnz()).collect();
        order.sort_by_key(|&p| cell_of(p));

        let mut cell_offsets = vec![0usize; b * b + 1];
        for &p in &order {
            cell_offsets[cell_of(p) + 1] += 1;
        }
        for c in 0..b * b {
            cell_offsets[c + 1] += cell_offsets[c];
        }

        Self {
            b,
            row_offsets,
            col_offsets,
            order,
            cell_offsets,
        }
    }

    fn cell(&self, row_block: usize, col_block: usize) -> &[usize] {
        let c = row_block * self.b + col_block;
        &self.order[self.cell_offsets[c]..self.cell_offsets[c + 1]]
    }
}

pub struct StratifiedPsgdJob {
    pub update: Arc<dyn Update>,
    pub regularize: Arc<dyn Regularize>,
    pub tasks: usize,
}

/// One stratified-PSGD epoch. Requires `job.tasks <= layout.b`: row-blocks
/// are split into `job.tasks` contiguous, disjoint bands, so `W`'s rows
/// never alias across tasks and no lock is needed there (spec §4.8).
/// `H`'s columns are not partitioned this way and may be touched by more
/// than one task in the same epoch; like PSGD, those writes are
/// unsynchronised by design (spec §4.8, §5: "locks are used only by
/// ASGD").
pub fn run_stratified_psgd_epoch(
    data: &mut FactorizationData,
    layout: &StratifiedLayout,
    job: &StratifiedPsgdJob,
    eps: f64,
    rng: &mut SplitMix64,
) -> usize {
    assert!(job.tasks <= layout.b, "stratified PSGD needs tasks <= b");
    let band_offsets = default_offsets(layout.b, job.tasks);
    let seeds: Vec<u64> = (0..job.tasks).map(|_| rng.next_u64()).collect();

    let processed = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(job.tasks);
        for t in 0..job.tasks {
            let row_block_begin = band_offsets[t];
            let row_block_end = band_offsets[t + 1];
            let data = &*data;
            let layout = &*layout;
            let update = job.update.as_ref();
            let mut local_rng = SplitMix64::split(seeds[t], t as u64);
            handles.push(scope.spawn(move || {
                let mut processed = 0usize;
                for row_block in row_block_begin..row_block_end {
                    let mut col_order: Vec<usize> = (0..layout.b).collect();
                    local_rng.shuffle(&mut col_order);
                    for &col_block in &col_order {
                        let cell = layout.cell(row_block, col_block);
                        let mut within: Vec<usize> = cell.to_vec();
                        local_rng.shuffle(&mut within);
                        for &p in &within {
                            apply_point(data, update, p, eps);
                            processed += 1;
                        }
                    }
                }
                processed
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    run_regularize(data, job.regularize.as_ref(), eps);
    processed
}

fn apply_point(data: &FactorizationData, update: &dyn Update, p: usize, eps: f64) {
    let i = data.v.row_at(p) as usize;
    let j = data.v.col_at(p) as usize;
    let x = data.v.val_at(p);
    let w_row = unsafe { data.w.row_mut_unchecked(i) };
    let h_col = unsafe { data.h.col_mut_unchecked(j) };
    update.apply(w_row, h_col, x, eps, data.nnz1[i], data.nnz2[j]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Nzsl;
    use dmf_matrix::{Dense, Order as DenseOrder};

    #[test]
    fn choose_block_count_is_at_least_one() {
        assert!(choose_block_count(1000, 1000, 10, 5000, 1.0) >= 1);
    }

    #[test]
    fn layout_partitions_every_nonzero_into_exactly_one_cell() {
        let v = SparseCoo::from_triples_unsorted(
            4,
            4,
            vec![(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0), (3, 3, 1.0), (0, 3, 2.0)],
            true,
        );
        let layout = StratifiedLayout::build(&v, 2);
        let total: usize = (0..2).map(|rb| (0..2).map(|cb| layout.cell(rb, cb).len()).sum::<usize>()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn epoch_visits_every_nonzero_exactly_once() {
        let v = SparseCoo::from_triples_unsorted(4, 4, vec![(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0), (3, 3, 1.0)], true);
        let w = Dense::identity(4, DenseOrder::RowMajor);
        let h = Dense::identity(4, DenseOrder::ColMajor);
        let mut data = FactorizationData::new(v, None, w, h, 2);
        let layout = StratifiedLayout::build(&data.v, 2);
        let job = StratifiedPsgdJob {
            update: Arc::new(Nzsl),
            regularize: Arc::new(crate::update::NoRegularize),
            tasks: 2,
        };
        let mut rng = SplitMix64::new(11);
        let n = run_stratified_psgd_epoch(&mut data, &layout, &job, 0.1, &mut rng);
        assert_eq!(n, 4);
    }
}
