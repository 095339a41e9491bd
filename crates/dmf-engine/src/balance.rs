use dmf_matrix::FactorizationData;

/// Whether factor norms are weighted by nonzero degree before balancing
/// (spec §4.12, grounded in `original_source/mf/matrix/op/balance_impl.cc`
/// computing both an L2 and an nnz-weighted column norm).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormWeighting {
    L2,
    Nzl2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceMethod {
    /// One scalar factor for the whole matrix pair.
    Simple,
    /// One factor per rank dimension.
    Optimal,
}

fn column_norm(w: &dmf_matrix::Dense, k: usize, weighting: NormWeighting, nnz1: &[u32]) -> f64 {
    let mut acc = 0.0;
    for i in 0..w.rows() {
        let v = w.get(i, k);
        let weight = match weighting {
            NormWeighting::L2 => 1.0,
            NormWeighting::Nzl2 => nnz1[i] as f64,
        };
        acc += weight * v * v;
    }
    acc.sqrt()
}

fn row_norm(h: &dmf_matrix::Dense, k: usize, weighting: NormWeighting, nnz2: &[u32]) -> f64 {
    let mut acc = 0.0;
    for j in 0..h.cols() {
        let v = h.get(k, j);
        let weight = match weighting {
            NormWeighting::L2 => 1.0,
            NormWeighting::Nzl2 => nnz2[j] as f64,
        };
        acc += weight * v * v;
    }
    acc.sqrt()
}

/// Rescales `W`/`H` so their norms match, without changing `W·H` (spec
/// §4.12, §8's "`W·H` preserved elementwise up to floating-point rounding"
/// and "`‖W·,k‖ = ‖Hk,·‖` to within 1 ULP" invariants).
///
/// `Simple` computes one scalar `f = (‖H‖/‖W‖)^(1/4)` from the
/// whole-matrix norms and applies `W *= f`, `H /= f`; `Optimal` computes
/// one `f_k` per rank dimension `k` and scales column `k` of `W` / row `k`
/// of `H` independently. A dimension whose `W` column and `H` row are both
/// entirely zero produces `f_k = NaN` (`0/0`), which collapses that
/// dimension to zero rather than propagating `NaN` into the factors (spec
/// §4.12, §7 `NumericWarning`).
pub fn balance(data: &mut FactorizationData, method: BalanceMethod, weighting: NormWeighting) -> Vec<f64> {
    let rank = data.rank();
    let w_norms: Vec<f64> = (0..rank).map(|k| column_norm(&data.w, k, weighting, &data.nnz1)).collect();
    let h_norms: Vec<f64> = (0..rank).map(|k| row_norm(&data.h, k, weighting, &data.nnz2)).collect();

    let factors: Vec<f64> = match method {
        BalanceMethod::Simple => {
            let total_w: f64 = w_norms.iter().map(|v| v * v).sum::<f64>().sqrt();
            let total_h: f64 = h_norms.iter().map(|v| v * v).sum::<f64>().sqrt();
            let f = (total_h / total_w).powf(0.25);
            vec![if f.is_nan() { 0.0 } else { f }; rank]
        }
        BalanceMethod::Optimal => w_norms
            .iter()
            .zip(&h_norms)
            .map(|(&wn, &hn)| {
                let f = (hn / wn).powf(0.25);
                if f.is_nan() {
                    0.0
                } else {
                    f
                }
            })
            .collect(),
    };

    for k in 0..rank {
        let f = factors[k];
        for i in 0..data.w.rows() {
            let v = data.w.get(i, k);
            data.w.set(i, k, v * f);
        }
        if f != 0.0 {
            for j in 0..data.h.cols() {
                let v = data.h.get(k, j);
                data.h.set(k, j, v / f);
            }
        } else {
            for j in 0..data.h.cols() {
                data.h.set(k, j, 0.0);
            }
        }
    }

    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmf_matrix::{Dense, Order as DenseOrder, SparseCoo};

    fn data_with(w: Dense, h: Dense) -> FactorizationData {
        let v = SparseCoo::from_triples_unsorted(w.rows(), h.cols(), vec![], true);
        FactorizationData::new(v, None, w, h, 1)
    }

    #[test]
    fn simple_balance_preserves_the_product() {
        let w = Dense::from_data(2, 1, DenseOrder::RowMajor, vec![2.0, 2.0]);
        let h = Dense::from_data(1, 2, DenseOrder::ColMajor, vec![8.0, 8.0]);
        let before_product = 2.0 * 8.0;
        let mut data = data_with(w, h);
        balance(&mut data, BalanceMethod::Simple, NormWeighting::L2);
        for i in 0..2 {
            for j in 0..2 {
                let product = data.w.get(i, 0) * data.h.get(0, j);
                assert!((product - before_product).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn optimal_balance_matches_norms_to_within_a_ulp() {
        let w = Dense::from_data(2, 2, DenseOrder::RowMajor, vec![1.0, 3.0, 1.0, 3.0]);
        let h = Dense::from_data(2, 2, DenseOrder::ColMajor, vec![4.0, 4.0, 1.0, 1.0]);
        let mut data = data_with(w, h);
        balance(&mut data, BalanceMethod::Optimal, NormWeighting::L2);
        for k in 0..2 {
            let wn = column_norm(&data.w, k, NormWeighting::L2, &data.nnz1);
            let hn = row_norm(&data.h, k, NormWeighting::L2, &data.nnz2);
            assert!((wn - hn).abs() < 1e-9, "k={k} wn={wn} hn={hn}");
        }
    }

    #[test]
    fn a_dimension_with_both_factors_entirely_zero_collapses_cleanly() {
        let w = Dense::from_data(2, 1, DenseOrder::RowMajor, vec![0.0, 0.0]);
        let h = Dense::from_data(1, 2, DenseOrder::ColMajor, vec![0.0, 0.0]);
        let mut data = data_with(w, h);
        let factors = balance(&mut data, BalanceMethod::Optimal, NormWeighting::L2);
        assert_eq!(factors, vec![0.0]);
        assert!(data.h.data().iter().all(|&v| v == 0.0));
    }
}
