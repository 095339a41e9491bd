use std::sync::Arc;

use parking_lot::Mutex;

use dmf_common::rng::SplitMix64;
use dmf_matrix::{Dense, FactorizationData};

use crate::order::PointOrder;
use crate::psgd::split_evenly;
use crate::sgd::run_regularize;
use crate::update::{Regularize, Update, UpdateLock};

/// The functors and concurrency knobs shared by every node of an ASGD run
/// (spec §4.9; ground truth `mf/sgd/asgd_impl.h`).
pub struct AsgdJob {
    pub update: Arc<dyn Update>,
    pub regularize: Arc<dyn Regularize>,
    pub order: PointOrder,
    pub tasks_per_node: usize,
    /// If true, a shuffle round averages the `d` nodes' deltas (`1/d`
    /// weight); if false, it sums them unweighted, an intentionally more
    /// aggressive and less stable variant (ground truth: `AsgdRunner`'s
    /// `averageDeltas` flag).
    pub average_deltas: bool,
}

/// Per-node state that persists across epochs: the node's row-block of
/// `V`/`W` plus a *full-width working copy* of `H`, shared by every local
/// PSGD worker and updated lock-free within the node except where
/// `row_locks`/`col_locks` say otherwise (spec §4.9: "locks, per-row W and
/// per-column H, protect concurrent accesses within a node").
pub struct AsgdNode {
    pub data: FactorizationData,
    row_locks: Vec<Mutex<()>>,
    col_locks: Vec<Mutex<()>>,
}

impl AsgdNode {
    pub fn new(data: FactorizationData) -> Self {
        let row_locks = (0..data.w.rows()).map(|_| Mutex::new(())).collect();
        let col_locks = (0..data.h.cols()).map(|_| Mutex::new(())).collect();
        Self { data, row_locks, col_locks }
    }
}

fn apply_point_locked(node: &AsgdNode, update: &dyn Update, p: usize, eps: f64) {
    let i = node.data.v.row_at(p) as usize;
    let j = node.data.v.col_at(p) as usize;
    let x = node.data.v.val_at(p);
    // Safety: see `Dense::row_mut_unchecked`/`col_mut_unchecked`; the
    // row/col mutexes below are what make this sound, unlike plain PSGD's
    // accepted Hogwild race.
    let w_row = unsafe { node.data.w.row_mut_unchecked(i) };
    let h_col = unsafe { node.data.h.col_mut_unchecked(j) };
    UpdateLock { inner: update }.apply_locked(
        &node.row_locks[i],
        &node.col_locks[j],
        w_row,
        h_col,
        x,
        eps,
        node.data.nnz1[i],
        node.data.nnz2[j],
    );
}

/// One node's local PSGD epoch against its shared `H` copy, split across
/// `job.tasks_per_node` worker threads (spec §4.9 step "each node runs
/// PSGD on its local V-block").
fn run_local_epoch(node: &AsgdNode, job: &AsgdJob, eps: f64, rng: &mut SplitMix64) -> usize {
    let nnz = node.data.v.nnz();
    if nnz == 0 {
        return 0;
    }
    let tasks = job.tasks_per_node.max(1);

    let permutation: Option<Vec<usize>> = match job.order {
        PointOrder::Wor => {
            let mut p: Vec<usize> = (0..nnz).collect();
            rng.shuffle(&mut p);
            Some(p)
        }
        _ => None,
    };
    let splits = split_evenly(nnz, tasks);
    let seeds: Vec<u64> = (0..tasks).map(|_| rng.next_u64()).collect();
    let order = job.order;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(tasks);
        for t in 0..tasks {
            let begin = splits[t];
            let end = splits[t + 1];
            let node = &*node;
            let update = job.update.as_ref();
            let permutation = permutation.as_deref();
            let mut local_rng = SplitMix64::split(seeds[t], t as u64);
            handles.push(scope.spawn(move || {
                for k in begin..end {
                    let p = match order {
                        PointOrder::Wr => local_rng.gen_range(nnz),
                        _ => permutation.map(|perm| perm[k]).unwrap_or(k),
                    };
                    apply_point_locked(node, update, p, eps);
                }
                end - begin
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
}

/// One shuffle round (spec §4.9 steps 1-4: "compute `deltaH`, exchange,
/// aggregate into a master, broadcast back").
///
/// Every node fully resyncs to `master` at the end of each round (step 4
/// overwrites both `Hlocal` and `Hcache` with the just-broadcast value), so
/// at the *start* of every round every node's drift since the last sync is
/// simply `Hlocal - master`; there is no need to track a per-node cache
/// separately from the single shared `master`. With that simplification
/// the four steps reduce to one weighted update of `master` followed by a
/// broadcast, which is what this function does; `average_deltas` selects
/// `master += (1/d) * sum(drift)` versus `master += sum(drift)`.
fn shuffle_round(nodes: &mut [AsgdNode], master: &mut Dense, average_deltas: bool) {
    let d = nodes.len();
    if d == 0 {
        return;
    }
    let rank = master.rows();
    let n = master.cols();
    let weight = if average_deltas { 1.0 / d as f64 } else { 1.0 };

    let mut accum = vec![0.0f64; rank * n];
    for node in nodes.iter() {
        for c in 0..n {
            for r in 0..rank {
                accum[c * rank + r] += node.data.h.get(r, c) - master.get(r, c);
            }
        }
    }
    for c in 0..n {
        for r in 0..rank {
            master.add_assign(r, c, weight * accum[c * rank + r]);
        }
    }
    for node in nodes.iter_mut() {
        node.data.h = master.clone();
    }
}

/// Runs one ASGD epoch: every node runs a local PSGD epoch against its
/// working copy of `H`, followed by one shuffle round that reconciles the
/// nodes' drifted copies back into a shared `master` (spec §4.9). The
/// source shuffles repeatedly while the epoch's SGD task is still running
/// and once more after it reports done; since a node's local epoch here is
/// one bounded call rather than a polled background task, one trailing
/// shuffle is exactly the "at least once after SGD is done" case and
/// nothing is lost by not shuffling mid-epoch.
pub fn run_asgd_epoch(
    nodes: &mut [AsgdNode],
    master: &mut Dense,
    job: &AsgdJob,
    eps: f64,
    rng: &mut SplitMix64,
) -> (usize, usize) {
    let seeds: Vec<u64> = (0..nodes.len()).map(|_| rng.next_u64()).collect();
    let processed: usize = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(nodes.len());
        for (k, node) in nodes.iter().enumerate() {
            let mut local_rng = SplitMix64::split(seeds[k], k as u64);
            handles.push(scope.spawn(move || run_local_epoch(node, job, eps, &mut local_rng)));
        }
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    for node in nodes.iter_mut() {
        run_regularize(&mut node.data, job.regularize.as_ref(), eps);
    }

    shuffle_round(nodes, master, job.average_deltas);
    tracing::debug!(shuffles = 1, nodes = nodes.len(), "asgd epoch complete");
    (processed, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Nzsl;
    use dmf_matrix::{Order as DenseOrder, SparseCoo};

    fn node_with_diagonal(seed_offset: f64) -> AsgdNode {
        let v = SparseCoo::from_triples_unsorted(1, 2, vec![(0, 0, 1.0)], true);
        let w = Dense::from_data(1, 2, DenseOrder::RowMajor, vec![1.0, 1.0]);
        let mut h = Dense::zeros(2, 2, DenseOrder::ColMajor);
        h.set(0, 0, 1.0 + seed_offset);
        h.set(1, 1, 1.0);
        let data = FactorizationData::new(v, None, w, h, 1);
        AsgdNode::new(data)
    }

    fn job() -> AsgdJob {
        AsgdJob {
            update: Arc::new(Nzsl),
            regularize: Arc::new(crate::update::NoRegularize),
            order: PointOrder::Seq,
            tasks_per_node: 2,
            average_deltas: true,
        }
    }

    #[test]
    fn averaged_shuffle_converges_every_node_to_the_same_value() {
        let mut nodes = vec![node_with_diagonal(0.0), node_with_diagonal(0.2)];
        let mut master = nodes[0].data.h.clone();
        // drift node 1 away from the shared master before shuffling.
        nodes[1].data.h.set(0, 0, 2.0);
        shuffle_round(&mut nodes, &mut master, true);
        assert_eq!(nodes[0].data.h, nodes[1].data.h);
        assert_eq!(nodes[0].data.h, master);
    }

    #[test]
    fn averaging_an_even_split_lands_on_the_midpoint() {
        let mut nodes = vec![node_with_diagonal(0.0), node_with_diagonal(0.0)];
        let mut master = nodes[0].data.h.clone();
        nodes[0].data.h.set(0, 0, 0.0);
        nodes[1].data.h.set(0, 0, 2.0);
        shuffle_round(&mut nodes, &mut master, true);
        assert!((master.get(0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn run_asgd_epoch_processes_every_local_nonzero() {
        let mut nodes = vec![node_with_diagonal(0.0), node_with_diagonal(0.1)];
        let mut master = nodes[0].data.h.clone();
        let mut rng = SplitMix64::new(9);
        let (processed, shuffles) = run_asgd_epoch(&mut nodes, &mut master, &job(), 0.05, &mut rng);
        assert_eq!(processed, 2);
        assert_eq!(shuffles, 1);
        assert_eq!(nodes[0].data.h, nodes[1].data.h);
    }
}
