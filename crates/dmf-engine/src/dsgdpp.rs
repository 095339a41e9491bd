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

/// The functors and point order shared by every subepoch of a DSGD++ epoch
/// (spec §4.6's `SgdJob`, reused unchanged from plain DSGD).
pub struct DsgdPlusPlusJob {
    pub update: Arc<dyn Update>,
    pub regularize: Arc<dyn Regularize>,
    pub order: PointOrder,
}

/// Runs one DSGD++ epoch: `tasks = w.len()` row-blocks of `W`, each
/// permanently owned by one task, against `2*tasks` column half-blocks of
/// `H`, visited over `schedule.len() == 2*tasks` subepochs (spec §4.5's
/// interleaved-halves schedule, built by `stratum::compute_dsgdpp_schedule`).
///
/// `v[id]` holds one `SparseCoo` per column half-block (`v[id].len() ==
/// 2*tasks`, row-major sliced to row block `id`); `w[id]` is row block
/// `id`; `h[b2]` is column half-block `b2`. `col_offsets` has `2*tasks`
/// entries, one per half-block.
///
/// Splitting `H` into twice as many blocks as there are tasks means a
/// task's just-written half-block is never the one the very next subepoch
/// needs from it, which is what lets the real engine overlap the
/// write-back of one subepoch's `H` with the read of the next (spec §4.6
/// step 2's "fast DSGD+ path", ground truth `mf/sgd/dsgdpp_impl.h
/// ::DsgdPpTask::run`'s `Hnext`/`H`/`Hprev` triple buffering and its
/// pointer-swap-if-same-rank, byte-ship-otherwise exchange). This
/// single-address-space port keeps the doubled schedule shape and the
/// once-per-subepoch regularize call but collapses that pipelined exchange
/// to "lock the half-block, clone it out, write it back", exactly as plain
/// DSGD (`dsgd.rs::run_dsgd_epoch`) collapses its own pointer/byte
/// exchange (spec §9 design note).
#[allow(clippy::too_many_arguments)]
pub async fn run_dsgdpp_epoch(
    schedule: &[Vec<usize>],
    v: &[Vec<Arc<SparseCoo>>],
    w: &[Arc<Mutex<Dense>>],
    h: &[Arc<Mutex<Dense>>],
    nnz1: &Arc<Vec<u32>>,
    nnz2: &Arc<Vec<u32>>,
    row_offsets: &Arc<Vec<usize>>,
    col_offsets: &Arc<Vec<usize>>,
    job: &Arc<DsgdPlusPlusJob>,
    eps: f64,
    seed: u64,
) -> Result<usize> {
    let tasks = w.len();
    let subepochs = schedule.len();
    debug_assert_eq!(subepochs, 2 * tasks);
    debug_assert_eq!(h.len(), 2 * tasks);

    // Stratum-level rescaling treats a subepoch as one of `2*tasks`
    // strata, not `tasks` (spec §4.6: "eps/d for the regularizer" scales
    // by the number of subepochs a full epoch actually runs).
    let eps_regularize = if job.regularize.rescale_stratum_stepsize() {
        eps / subepochs as f64
    } else {
        eps
    };
    let processed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(tasks));

    let mut handles = Vec::with_capacity(tasks);
    for id in 0..tasks {
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

        handles.push(tokio::spawn(async move {
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

                if subepoch + 1 < subepochs {
                    barrier.wait().await;
                }
            }
            Result::Ok(())
        }));
    }

    for t in handles {
        t.await.map_err(|join_err| {
            tracing::warn!(?join_err, "dsgd++ subepoch task panicked");
            dmf_common::error::MfError::ResourceExhaustion("a dsgd++ subepoch task panicked".into())
        })??;
    }

    Ok(processed.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::{compute_dsgdpp_schedule, StratumOrder};
    use crate::update::Nzsl;
    use dmf_matrix::Order as DenseOrder;

    /// `tasks` row-blocks against `2*tasks` column half-blocks. The global
    /// matrix places its single nonzero for row-block `id` in half-block
    /// `2*id` (W/H both start at the identity fit for that half-block, so a
    /// perfect fit exists and Nzsl leaves everything unchanged); every
    /// other (row, half-block) combination is empty.
    fn diag_half_blocks(
        tasks: usize,
    ) -> (Vec<Vec<Arc<SparseCoo>>>, Vec<Arc<Mutex<Dense>>>, Vec<Arc<Mutex<Dense>>>) {
        let mut v = Vec::with_capacity(tasks);
        for id in 0..tasks {
            let mut row = Vec::with_capacity(2 * tasks);
            for b2 in 0..2 * tasks {
                let coo = if b2 == 2 * id {
                    SparseCoo::from_triples_unsorted(1, 1, vec![(0, 0, 1.0)], true)
                } else {
                    SparseCoo::from_triples_unsorted(1, 1, vec![], true)
                };
                row.push(Arc::new(coo));
            }
            v.push(row);
        }
        let w: Vec<_> = (0..tasks)
            .map(|_| Arc::new(Mutex::new(Dense::identity(1, DenseOrder::RowMajor))))
            .collect();
        let h: Vec<_> = (0..2 * tasks)
            .map(|_| Arc::new(Mutex::new(Dense::identity(1, DenseOrder::ColMajor))))
            .collect();
        (v, w, h)
    }

    #[tokio::test]
    async fn perfect_fit_is_unchanged_by_one_epoch() {
        let tasks = 3;
        let (v, w, h) = diag_half_blocks(tasks);
        let nnz1 = Arc::new(vec![1u32; tasks]);
        let nnz2 = Arc::new(vec![1u32; 2 * tasks]);
        let row_offsets = Arc::new((0..=tasks).collect::<Vec<_>>());
        let col_offsets = Arc::new((0..=2 * tasks).collect::<Vec<_>>());
        let job = Arc::new(DsgdPlusPlusJob {
            update: Arc::new(Nzsl),
            regularize: Arc::new(crate::update::NoRegularize),
            order: PointOrder::Seq,
        });
        let mut rng = SplitMix64::new(1);
        let schedule = compute_dsgdpp_schedule(tasks, 1, StratumOrder::Seq, &mut rng);

        let processed = run_dsgdpp_epoch(
            &schedule, &v, &w, &h, &nnz1, &nnz2, &row_offsets, &col_offsets, &job, 0.1, 7,
        )
        .await
        .unwrap();
        assert_eq!(processed, tasks);
        for b in 0..tasks {
            assert_eq!(w[b].lock().get(0, 0), 1.0);
        }
        for b in 0..2 * tasks {
            assert_eq!(h[b].lock().get(0, 0), 1.0);
        }
    }

    #[tokio::test]
    async fn every_task_visits_every_half_block_exactly_once() {
        use std::sync::atomic::AtomicU32;
        let tasks = 4;
        let visit_counts: Vec<Vec<Arc<AtomicU32>>> = (0..tasks)
            .map(|_| (0..2 * tasks).map(|_| Arc::new(AtomicU32::new(0))).collect())
            .collect();
        let mut rng = SplitMix64::new(9);
        let schedule = compute_dsgdpp_schedule(tasks, 1, StratumOrder::Wor, &mut rng);
        assert_eq!(schedule.len(), 2 * tasks);
        for row in &schedule {
            for (id, &b2) in row.iter().enumerate() {
                visit_counts[id][b2].fetch_add(1, Ordering::Relaxed);
            }
        }
        for id in 0..tasks {
            for b2 in 0..2 * tasks {
                assert_eq!(visit_counts[id][b2].load(Ordering::Relaxed), 1);
            }
        }
    }
}
