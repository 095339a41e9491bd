use dmf_common::rng::SplitMix64;
use dmf_matrix::FactorizationData;

use crate::order::{PointOrder, PointSequence};
use crate::update::{Regularize, Update};

/// The sequential SGD kernel shared by every SGD variant (spec §4.7): one
/// pass over a `FactorizationData` view, applying `update` to every
/// training point in the requested order.
pub fn run_sgd_epoch(
    data: &mut FactorizationData,
    order: PointOrder,
    update: &dyn Update,
    eps: f64,
    rng: &mut SplitMix64,
) -> usize {
    let seq = PointSequence::new(order, data.v.nnz(), rng);
    let mut processed = 0usize;
    for p in seq {
        let i = data.v.row_at(p) as usize;
        let j = data.v.col_at(p) as usize;
        let x = data.v.val_at(p);
        let mut w_row = data.w.row(i);
        let mut h_col = data.h.col(j);
        update.apply(&mut w_row, &mut h_col, x, eps, data.nnz1[i], data.nnz2[j]);
        data.w.set_row(i, &w_row);
        data.h.set_col(j, &h_col);
        processed += 1;
    }
    processed
}

/// `regularize`, invoked once per epoch by PSGD/DSGD (spec §4.7), unless
/// `Regularize::rescale_stratum_stepsize` asks the caller to call this
/// once per stratum with `eps / d` instead (handled by the DSGD kernel).
pub fn run_regularize(data: &mut FactorizationData, regularize: &dyn Regularize, eps: f64) {
    regularize.apply(&mut data.w, &mut data.h, eps);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Nzsl;
    use dmf_matrix::{Dense, Order as DenseOrder, SparseCoo};

    fn identity_2x2() -> FactorizationData {
        let v = SparseCoo::from_triples_unsorted(2, 2, vec![(0, 0, 1.0), (1, 1, 1.0)], true);
        let w = Dense::identity(2, DenseOrder::RowMajor);
        let h = Dense::identity(2, DenseOrder::ColMajor);
        FactorizationData::new(v, None, w, h, 1)
    }

    #[test]
    fn zero_step_size_epoch_is_a_no_op() {
        let mut data = identity_2x2();
        let mut rng = SplitMix64::new(1);
        run_sgd_epoch(&mut data, PointOrder::Seq, &Nzsl, 0.0, &mut rng);
        assert_eq!(data.w.get(0, 0), 1.0);
        assert_eq!(data.h.get(0, 0), 1.0);
        assert_eq!(data.w.get(1, 1), 1.0);
    }

    #[test]
    fn deterministic_dsgd_scenario_leaves_perfect_fit_unchanged() {
        // Scenario 1 from spec §8: V=I2, W0=H0=I2, Nzsl, eps=0.1: gradient
        // is zero everywhere because <W_i,H_i> already equals V_ii.
        let mut data = identity_2x2();
        let mut rng = SplitMix64::new(1);
        run_sgd_epoch(&mut data, PointOrder::Seq, &Nzsl, 0.1, &mut rng);
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(data.w.get(i, j), if i == j { 1.0 } else { 0.0 });
                assert_eq!(data.h.get(i, j), if i == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn wor_processes_every_nonzero_exactly_once() {
        let v = SparseCoo::from_triples_unsorted(
            3,
            3,
            vec![(0, 0, 2.0), (1, 1, 2.0), (2, 2, 2.0)],
            true,
        );
        let w = Dense::identity(3, DenseOrder::RowMajor);
        let h = Dense::identity(3, DenseOrder::ColMajor);
        let mut data = FactorizationData::new(v, None, w, h, 1);
        let mut rng = SplitMix64::new(1);
        let processed = run_sgd_epoch(&mut data, PointOrder::Wor, &Nzsl, 0.5, &mut rng);
        assert_eq!(processed, 3);
        for i in 0..3 {
            assert!(data.w.get(i, i) * data.h.get(i, i) > 1.0);
            for j in 0..3 {
                if i != j {
                    assert_eq!(data.w.get(i, j), 0.0);
                    assert_eq!(data.h.get(j, i), 0.0);
                }
            }
        }
    }
}
