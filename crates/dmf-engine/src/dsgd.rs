use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Barrier;

use dmf_common::error::Result;
use dmf_common::rng::SplitMix64;
use dmf_matrix::{Dense, FactorizationData, SparseCoo};

use crate::order::PointOrder;
use crate::sgd::{run_regularize, run_sgd_epoch};
use crate::update::{Regularize, Update};

/// The functors and point order shared by every stratum of a DSGD epoch
/// (spec §4.6 step 3's `SgdJob`).
pub struct DsgdJob {
    pub update: Arc<dyn Update>,
    pub regularize: Arc<dyn Regularize>,
    pub order: PointOrder,
}

/// Runs one DSGD epoch over a `d x d` block grid, `d = w.len() = h.len()`
/// (spec §4.4: DSGD requires `blocks1 == blocks2`).
///
/// `v[b1][b2]` is the row-major-sorted, never-mutated block grid of `V`.
/// `w[b1]`/`h[b2]` are the row/column factor blocks, updated in place.
/// `nnz1`/`nnz2` are the *global* marginals, sliced per block internally
/// (spec §4.6 step 3). `schedule[s][id]` gives the column block task `id`
/// (which permanently owns row block `id`) works on during subepoch `s`.
///
/// Ground truth for the subepoch loop and the "regularize is called once
/// per stratum, not once per epoch" detail: `mf/sgd/dsgd_impl.h::DsgdTask`.
/// That file hands the *same-rank* peer its next H block via a raw-pointer
/// swap over a channel, and ships bytes to other ranks; a simulated
/// cluster that keeps every rank's state in one address space collapses
/// both cases to one: take the block's lock, clone it out for the
/// duration of the subepoch, write it back (spec §9 design note).
#[allow(clippy::too_many_arguments)]
pub async fn run_dsgd_epoch(
    schedule: &[Vec<usize>],
    v: &[Vec<Arc<SparseCoo>>],
    w: &[Arc<Mutex<Dense>>],
    h: &[Arc<Mutex<Dense>>],
    nnz1: &Arc<Vec<u32>>,
    nnz2: &Arc<Vec<u32>>,
    row_offsets: &Arc<Vec<usize>>,
    col_offsets: &Arc<Vec<usize>>,
    job: &Arc<DsgdJob>,
    eps: f64,
    seed: u64,
) -> Result<usize> {
    let d = schedule.len();
    debug_assert_eq!(w.len(), d);
    debug_assert_eq!(h.len(), d);

    let eps_regularize = if job.regularize.rescale_stratum_stepsize() {
        eps / d as f64
    } else {
        eps
    };
    let processed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(d));

    let mut tasks = Vec::with_capacity(d);
    for id in 0..d {
        let schedule = schedule.to_vec();
        let v_row: Vec<Arc<SparseCoo>> = v[id].clone();
        let w_block = w[id].clone();
        let h_blocks = h.to_vec();
        let nnz1 = nnz1.clone();
        let nnz2 = nnz2.clone();
        let row_offsets = row_offsets.clone();
        let col_offsets = col_offsets.clone();
        let job = job.clone();
        let processed = processed.clone();
        let barrier = barrier.clone();

        tasks.push(tokio::spawn(async move {
            let mut rng = SplitMix64::split(seed, id as u64);
            for (subepoch, row) in schedule.iter().enumerate() {
                let b2 = row[id];
                let v_block = (*v_row[b2]).clone();
                let w_local = w_block.lock().clone();
                let h_local = h_blocks[b2].lock().clone();

                let mut data = FactorizationData::block_view(
                    v_block,
                    w_local,
                    h_local,
                    &nnz1,
                    &nnz2,
                    row_offsets[id],
                    col_offsets[b2],
                    1,
                );
                let n = run_sgd_epoch(&mut data, job.order, job.update.as_ref(), eps, &mut rng);
                processed.fetch_add(n, Ordering::Relaxed);
                run_regularize(&mut data, job.regularize.as_ref(), eps_regularize);

                *w_block.lock() = data.w;
                *h_blocks[b2].lock() = data.h;

                // All tasks must finish writing subepoch `subepoch` before
                // any task starts reading for `subepoch + 1` (ground truth:
                // `barrier(channels)` at the end of `DsgdTask::run`'s loop).
                if subepoch + 1 < d {
                    barrier.wait().await;
                }
            }
            Result::Ok(())
        }));
    }

    for t in tasks {
        t.await.map_err(|join_err| {
            tracing::warn!(?join_err, "dsgd subepoch task panicked");
            dmf_common::error::MfError::ResourceExhaustion("a dsgd subepoch task panicked".into())
        })??;
    }

    Ok(processed.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::{compute_schedule, StratumOrder};
    use crate::update::Nzsl;
    use dmf_matrix::Order as DenseOrder;

    fn diag_blocks(d: usize) -> (Vec<Vec<Arc<SparseCoo>>>, Vec<Arc<Mutex<Dense>>>, Vec<Arc<Mutex<Dense>>>) {
        // A d x d block grid whose global matrix is the identity: block
        // (i, i) holds a single 1.0 diagonal entry, every other block is
        // empty. W/H start as 1x1-per-block identities too, so a perfect
        // fit already exists and Nzsl leaves everything unchanged.
        let mut v = Vec::with_capacity(d);
        for b1 in 0..d {
            let mut row = Vec::with_capacity(d);
            for b2 in 0..d {
                let coo = if b1 == b2 {
                    SparseCoo::from_triples_unsorted(1, 1, vec![(0, 0, 1.0)], true)
                } else {
                    SparseCoo::from_triples_unsorted(1, 1, vec![], true)
                };
                row.push(Arc::new(coo));
            }
            v.push(row);
        }
        let w: Vec<_> = (0..d)
            .map(|_| Arc::new(Mutex::new(Dense::identity(1, DenseOrder::RowMajor))))
            .collect();
        let h: Vec<_> = (0..d)
            .map(|_| Arc::new(Mutex::new(Dense::identity(1, DenseOrder::ColMajor))))
            .collect();
        (v, w, h)
    }

    #[tokio::test]
    async fn perfect_fit_is_unchanged_by_one_epoch() {
        let d = 3;
        let (v, w, h) = diag_blocks(d);
        let nnz1 = Arc::new(vec![1u32; d]);
        let nnz2 = Arc::new(vec![1u32; d]);
        let row_offsets = Arc::new((0..=d).collect::<Vec<_>>());
        let col_offsets = Arc::new((0..=d).collect::<Vec<_>>());
        let job = Arc::new(DsgdJob {
            update: Arc::new(Nzsl),
            regularize: Arc::new(crate::update::NoRegularize),
            order: PointOrder::Seq,
        });
        let mut rng = SplitMix64::new(1);
        let schedule = compute_schedule(d, 1, StratumOrder::Seq, &mut rng);

        let processed = run_dsgd_epoch(
            &schedule, &v, &w, &h, &nnz1, &nnz2, &row_offsets, &col_offsets, &job, 0.1, 7,
        )
        .await
        .unwrap();
        assert_eq!(processed, d);
        for b in 0..d {
            assert_eq!(w[b].lock().get(0, 0), 1.0);
            assert_eq!(h[b].lock().get(0, 0), 1.0);
        }
    }

    #[tokio::test]
    async fn every_block_pair_on_the_diagonal_is_visited_exactly_once_per_epoch() {
        use std::sync::atomic::AtomicU32;
        let d = 4;
        let visit_counts: Vec<Vec<Arc<AtomicU32>>> = (0..d)
            .map(|_| (0..d).map(|_| Arc::new(AtomicU32::new(0))).collect())
            .collect();
        let mut rng = SplitMix64::new(5);
        let schedule = compute_schedule(d, 1, StratumOrder::Wor, &mut rng);
        for (s, row) in schedule.iter().enumerate() {
            for (id, &b2) in row.iter().enumerate() {
                visit_counts[id][b2].fetch_add(1, Ordering::Relaxed);
                let _ = s;
            }
        }
        for b1 in 0..d {
            for b2 in 0..d {
                assert_eq!(visit_counts[b1][b2].load(Ordering::Relaxed), 1);
            }
        }
    }
}
