use std::sync::Arc;

use dmf_common::rng::SplitMix64;
use dmf_matrix::FactorizationData;

use crate::order::PointOrder;
use crate::sgd::run_regularize;
use crate::update::{Regularize, Update};

/// Whether a dedicated worker prepares next epoch's `Wor` permutation while
/// this epoch's SGD workers are still running, or the driving thread builds
/// it sequentially before starting the epoch (spec §4.8, ground truth
/// `PsgdShuffle` in `mf/sgd/psgd_impl.h`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsgdShuffle {
    Sequential,
    Parallel,
}

pub struct PsgdJob {
    pub update: Arc<dyn Update>,
    pub regularize: Arc<dyn Regularize>,
    pub order: PointOrder,
    pub shuffle: PsgdShuffle,
    pub tasks: usize,
}

pub(crate) fn split_evenly(total: usize, parts: usize) -> Vec<usize> {
    let mut splits = Vec::with_capacity(parts + 1);
    splits.push(0);
    for p in 1..=parts {
        splits.push(p * total / parts);
    }
    splits
}

/// One PSGD epoch: splits `nnz` training points across `job.tasks` worker
/// threads with no cross-worker locking (Hogwild; spec §4.8, §5). Workers
/// touch shared rows of `data.w` / columns of `data.h` through
/// `Dense::row_mut_unchecked`/`col_mut_unchecked`; this is sound only
/// because distinct nonzeros can touch the *same* row/column, in which
/// case the update is genuinely racy by design, mirroring the nolock PSGD
/// variants in the source (e.g. `tools/psgdL2NoLock.cc`).
///
/// `carry` holds the previously-prepared permutation (`None` until the
/// first `Wor` epoch), and is updated in place with the permutation for
/// the *next* epoch when `shuffle == Parallel`.
pub fn run_psgd_epoch(
    data: &mut FactorizationData,
    job: &PsgdJob,
    eps: f64,
    rng: &mut SplitMix64,
    carry: &mut Option<Vec<usize>>,
) -> usize {
    let nnz = data.v.nnz();
    let processed = match job.order {
        PointOrder::Seq => run_split(data, job, eps, &split_evenly(nnz, job.tasks), None),
        PointOrder::Wr => {
            let splits = split_evenly(nnz, job.tasks);
            let step_counts: Vec<usize> = (0..job.tasks).map(|t| splits[t + 1] - splits[t]).collect();
            run_wr(data, job, eps, rng, &step_counts)
        }
        PointOrder::Wor => run_wor(data, job, eps, rng, carry),
    };

    run_regularize(data, job.regularize.as_ref(), eps);
    processed
}

/// `SGD_ORDER_SEQ`: each worker owns a contiguous, disjoint range of
/// storage-order indices, so there is no race at all, parallel or not.
fn run_split(
    data: &FactorizationData,
    job: &PsgdJob,
    eps: f64,
    splits: &[usize],
    permutation: Option<&[usize]>,
) -> usize {
    let tasks = splits.len() - 1;
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(tasks);
        for t in 0..tasks {
            let begin = splits[t];
            let end = splits[t + 1];
            let data = &*data;
            let update = job.update.as_ref();
            handles.push(scope.spawn(move || {
                for k in begin..end {
                    let p = permutation.map(|perm| perm[k]).unwrap_or(k);
                    apply_point(data, update, p, eps);
                }
                end - begin
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
}

/// `SGD_ORDER_WR`: each worker independently draws `step_counts[t]`
/// uniform-random indices with its own split RNG stream.
fn run_wr(data: &FactorizationData, job: &PsgdJob, eps: f64, rng: &mut SplitMix64, step_counts: &[usize]) -> usize {
    let nnz = data.v.nnz();
    if nnz == 0 {
        return 0;
    }
    let seeds: Vec<u64> = (0..step_counts.len()).map(|_| rng.next_u64()).collect();
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(step_counts.len());
        for (t, &steps) in step_counts.iter().enumerate() {
            let data = &*data;
            let update = job.update.as_ref();
            let mut local_rng = SplitMix64::split(seeds[t], t as u64);
            handles.push(scope.spawn(move || {
                for _ in 0..steps {
                    let p = local_rng.gen_range(nnz);
                    apply_point(data, update, p, eps);
                }
                steps
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
}

/// `SGD_ORDER_WOR`: all workers share one permutation of `0..nnz`, sliced
/// into disjoint ranges exactly like `run_split`. When `shuffle ==
/// Parallel`, one of the `tasks` slots is spent on preparing next epoch's
/// permutation concurrently with this epoch's SGD, at the cost of one
/// fewer SGD worker (ground truth: `PsgdRunner::updateWor`).
fn run_wor(
    data: &mut FactorizationData,
    job: &PsgdJob,
    eps: f64,
    rng: &mut SplitMix64,
    carry: &mut Option<Vec<usize>>,
) -> usize {
    let nnz = data.v.nnz();
    let permutation = match carry.take() {
        Some(p) if p.len() == nnz => p,
        _ => {
            let mut p: Vec<usize> = (0..nnz).collect();
            rng.shuffle(&mut p);
            p
        }
    };

    let spend_a_task_on_shuffle = job.shuffle == PsgdShuffle::Parallel && job.tasks > 1;
    if job.shuffle == PsgdShuffle::Parallel && job.tasks <= 1 {
        tracing::warn!("not enough tasks for parallel shuffling; falling back to sequential");
    }
    let sgd_tasks = if spend_a_task_on_shuffle { job.tasks - 1 } else { job.tasks.max(1) };
    let splits = split_evenly(nnz, sgd_tasks);

    let mut next_perm: Vec<usize> = (0..nnz).collect();
    let mut shuffle_rng = SplitMix64::split(rng.next_u64(), u64::MAX);

    let processed = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(sgd_tasks);
        for t in 0..sgd_tasks {
            let begin = splits[t];
            let end = splits[t + 1];
            let data = &*data;
            let update = job.update.as_ref();
            let permutation = &permutation;
            handles.push(scope.spawn(move || {
                for k in begin..end {
                    apply_point(data, update, permutation[k], eps);
                }
                end - begin
            }));
        }

        let shuffle_handle = spend_a_task_on_shuffle.then(|| scope.spawn(|| shuffle_rng.shuffle(&mut next_perm)));

        let processed = handles.into_iter().map(|h| h.join().unwrap()).sum();
        if let Some(h) = shuffle_handle {
            h.join().unwrap();
        }
        processed
    });

    *carry = if spend_a_task_on_shuffle { Some(next_perm) } else { None };
    processed
}

/// Reads `V[row_at(p), col_at(p)]` and updates the corresponding row of
/// `W`/column of `H` in place through an unsynchronised raw slice.
fn apply_point(data: &FactorizationData, update: &dyn Update, p: usize, eps: f64) {
    let i = data.v.row_at(p) as usize;
    let j = data.v.col_at(p) as usize;
    let x = data.v.val_at(p);
    // Safety: W is row-major and H is column-major by construction
    // (FactorizationData / Dense invariant); concurrent callers may
    // legitimately target the same row/column, which is the documented
    // Hogwild race, not a borrow-checker violation.
    let w_row = unsafe { data.w.row_mut_unchecked(i) };
    let h_col = unsafe { data.h.col_mut_unchecked(j) };
    update.apply(w_row, h_col, x, eps, data.nnz1[i], data.nnz2[j]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Nzsl;
    use dmf_matrix::{Dense, Order as DenseOrder, SparseCoo};

    fn three_diagonal_points() -> FactorizationData {
        let v = SparseCoo::from_triples_unsorted(3, 3, vec![(0, 0, 2.0), (1, 1, 2.0), (2, 2, 2.0)], true);
        let w = Dense::identity(3, DenseOrder::RowMajor);
        let h = Dense::identity(3, DenseOrder::ColMajor);
        FactorizationData::new(v, None, w, h, 4)
    }

    fn job(order: PointOrder, shuffle: PsgdShuffle, tasks: usize) -> PsgdJob {
        PsgdJob {
            update: Arc::new(Nzsl),
            regularize: Arc::new(crate::update::NoRegularize),
            order,
            shuffle,
            tasks,
        }
    }

    #[test]
    fn seq_order_processes_every_point_once_across_workers() {
        let mut data = three_diagonal_points();
        let mut rng = SplitMix64::new(1);
        let n = run_psgd_epoch(&mut data, &job(PointOrder::Seq, PsgdShuffle::Sequential, 4), 0.1, &mut rng, &mut None);
        assert_eq!(n, 3);
    }

    #[test]
    fn wor_sequential_shuffle_processes_every_point_once() {
        let mut data = three_diagonal_points();
        let mut rng = SplitMix64::new(2);
        let mut carry = None;
        let n = run_psgd_epoch(&mut data, &job(PointOrder::Wor, PsgdShuffle::Sequential, 2), 0.1, &mut rng, &mut carry);
        assert_eq!(n, 3);
    }

    #[test]
    fn wor_parallel_shuffle_prepares_a_usable_next_permutation() {
        let mut data = three_diagonal_points();
        let mut rng = SplitMix64::new(3);
        let mut carry = None;
        run_psgd_epoch(&mut data, &job(PointOrder::Wor, PsgdShuffle::Parallel, 4), 0.1, &mut rng, &mut carry);
        let next = carry.clone().expect("parallel shuffle leaves a prepared permutation");
        let mut sorted = next;
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn wr_processes_the_requested_number_of_steps() {
        let mut data = three_diagonal_points();
        let mut rng = SplitMix64::new(4);
        let n = run_psgd_epoch(&mut data, &job(PointOrder::Wr, PsgdShuffle::Sequential, 3), 0.1, &mut rng, &mut None);
        assert_eq!(n, 3);
    }
}
