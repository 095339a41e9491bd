use std::time::Instant;

use dmf_common::error::DecayOutcome;
use dmf_common::rng::SplitMix64;
use dmf_common::trace::{Trace, TraceEntry};

use crate::als::{als_update_h, als_update_w};
use crate::balance::balance;
use crate::decay::Decay;
use crate::job::{Job, KernelChoice};
use crate::loss::raw_nzsl_on;
use crate::psgd::{run_psgd_epoch, PsgdJob};
use crate::sgd::run_regularize;
use crate::stratified_psgd::{run_stratified_psgd_epoch, StratifiedPsgdJob};

/// One pass of whichever kernel `job.kernel` selects (spec §4.13 step 2).
/// `als_half` alternates W/H for `Als` across successive epochs ("one
/// epoch updates W, odd updates H", spec §4.10); it is ignored by the SGD
/// kernels, which touch both factors every epoch.
fn run_kernel(job: &mut Job, eps: f64, rng: &mut SplitMix64, epoch: usize, carry: &mut Option<Vec<usize>>) -> usize {
    match &job.kernel {
        KernelChoice::Psgd { shuffle, tasks } => {
            let psgd_job = PsgdJob {
                update: job.update.clone(),
                regularize: job.regularize.clone(),
                order: job.order,
                shuffle: *shuffle,
                tasks: *tasks,
            };
            run_psgd_epoch(&mut job.data, &psgd_job, eps, rng, carry)
        }
        KernelChoice::StratifiedPsgd { layout, tasks } => {
            let sp_job = StratifiedPsgdJob {
                update: job.update.clone(),
                regularize: job.regularize.clone(),
                tasks: *tasks,
            };
            run_stratified_psgd_epoch(&mut job.data, layout, &sp_job, eps, rng)
        }
        KernelChoice::Als { regularize } => {
            if epoch % 2 == 0 {
                als_update_w(&mut job.data, *regularize);
            } else {
                als_update_h(&mut job.data, *regularize);
            }
            job.data.v.nnz()
        }
        KernelChoice::Gnmf => {
            if epoch % 2 == 0 {
                crate::als::gnmf_update_w(&mut job.data);
            } else {
                crate::als::gnmf_update_h(&mut job.data);
            }
            job.data.v.nnz()
        }
        KernelChoice::Gkl => {
            if epoch % 2 == 0 {
                crate::als::gkl_update_w(&mut job.data);
            } else {
                crate::als::gkl_update_h(&mut job.data);
            }
            job.data.v.nnz()
        }
    }
}

/// Runs `epochs` epochs of the driver loop (spec §4.13): decay, kernel,
/// balance, loss, trace. `test_v`, if given, holds out nonzeros scored
/// every epoch against the *current* `job.data.w`/`h` (unregularized raw
/// loss only) for the trace's `loss.test` field.
pub fn run(job: &mut Job, epochs: usize, decay: &mut dyn Decay, rng: &mut SplitMix64, test_v: Option<&dmf_matrix::SparseCoo>) -> Trace {
    let mut trace = Trace::new();
    let mut carry: Option<Vec<usize>> = None;
    let mut previous_loss: Option<f64> = None;
    let mut current_loss = (job.loss_fn)(&job.data).total();

    for epoch in 0..epochs {
        let _span = tracing::info_span!("epoch", epoch).entered();

        let eps = match decay.step(epoch, previous_loss, current_loss, rng) {
            DecayOutcome::Eps(e) => e,
            DecayOutcome::RetryWithSmallerEps => {
                tracing::warn!(epoch, "decay asked for a retry with no fallback available; holding eps steady");
                current_loss
            }
            DecayOutcome::GiveUp => {
                tracing::warn!(epoch, "decay gave up; stopping early");
                break;
            }
        };

        let t_epoch = Instant::now();
        run_kernel(job, eps, rng, epoch, &mut carry);
        if !matches!(job.kernel, KernelChoice::Als { .. } | KernelChoice::Gnmf | KernelChoice::Gkl) {
            run_regularize(&mut job.data, job.regularize.as_ref(), eps);
        }
        let epoch_dur = t_epoch.elapsed();

        let t_balance = Instant::now();
        let rescale = job.balance.map(|(method, weighting)| balance(&mut job.data, method, weighting));
        let balance_dur = t_balance.elapsed();

        let t_loss = Instant::now();
        let loss_parts = (job.loss_fn)(&job.data);
        let loss_test = test_v.map(|v| raw_nzsl_on(v, &job.data.w, &job.data.h));
        let loss_dur = t_loss.elapsed();

        previous_loss = Some(current_loss);
        current_loss = loss_parts.total();

        let mut entry = TraceEntry::new(epoch, epoch, eps, current_loss)
            .with_phase("epoch", epoch_dur)
            .with_phase("balance", balance_dur)
            .with_phase("loss", loss_dur);
        entry.loss_test = loss_test;
        entry.rescale = rescale;
        entry.add_field("loss.raw", loss_parts.raw);
        entry.add_field("loss.regularizer", loss_parts.regularizer);
        trace.push(entry);
    }

    trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decay::Constant;
    use crate::loss::nzsl_loss;
    use crate::order::PointOrder;
    use crate::psgd::PsgdShuffle;
    use crate::update::{NoRegularize, Nzsl};
    use dmf_matrix::{Dense, Order as DenseOrder, FactorizationData, SparseCoo};
    use std::sync::Arc;

    fn job() -> Job {
        let v = SparseCoo::from_triples_unsorted(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)], true);
        let w = Dense::identity(2, DenseOrder::RowMajor);
        let h = Dense::identity(2, DenseOrder::ColMajor);
        let data = FactorizationData::new(v, None, w, h, 1);
        Job {
            data,
            update: Arc::new(Nzsl),
            regularize: Arc::new(NoRegularize),
            order: PointOrder::Seq,
            kernel: KernelChoice::Psgd { shuffle: PsgdShuffle::Sequential, tasks: 2 },
            loss_fn: Box::new(nzsl_loss),
            balance: None,
        }
    }

    #[test]
    fn driver_reduces_loss_over_several_epochs() {
        let mut j = job();
        let mut decay = Constant { eps0: 0.05 };
        let mut rng = SplitMix64::new(1);
        let trace = run(&mut j, 10, &mut decay, &mut rng, None);
        assert_eq!(trace.entries().len(), 10);
        let first = trace.entries()[0].loss;
        let last = trace.entries()[9].loss;
        assert!(last <= first);
    }

    #[test]
    fn trace_carries_raw_and_regularizer_fields() {
        let mut j = job();
        let mut decay = Constant { eps0: 0.01 };
        let mut rng = SplitMix64::new(2);
        let trace = run(&mut j, 1, &mut decay, &mut rng, None);
        assert!(trace.entries()[0].info.contains_key("loss.raw"));
        assert!(trace.entries()[0].info.contains_key("loss.regularizer"));
    }
}
