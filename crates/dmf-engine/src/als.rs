use nalgebra::{DMatrix, DVector};

use dmf_matrix::FactorizationData;

/// Which L2 penalty ALS folds into the per-row normal equations (spec
/// §4.10): plain `λ`, or `λ` scaled by the row/column's own degree.
#[derive(Clone, Copy, Debug)]
pub enum AlsRegularize {
    L2(f64),
    NzL2(f64),
}

/// `offsets[i]..offsets[i+1]` bounds the nonzeros of row `i` in a
/// row-major-sorted `SparseCoo` (mirrors `dmf_matrix::distributed::default_offsets`'s
/// prefix-sum shape, but derived from the actual row labels rather than an
/// even split).
fn row_offsets(v: &dmf_matrix::SparseCoo) -> Vec<usize> {
    let mut offsets = vec![0usize; v.rows() + 1];
    for p in 0..v.nnz() {
        offsets[v.row_at(p) as usize + 1] += 1;
    }
    for i in 0..v.rows() {
        offsets[i + 1] += offsets[i];
    }
    offsets
}

/// As `row_offsets`, but for a column-major-sorted `SparseCoo` (`data.vc`).
fn col_offsets(v: &dmf_matrix::SparseCoo) -> Vec<usize> {
    let mut offsets = vec![0usize; v.cols() + 1];
    for p in 0..v.nnz() {
        offsets[v.col_at(p) as usize + 1] += 1;
    }
    for j in 0..v.cols() {
        offsets[j + 1] += offsets[j];
    }
    offsets
}

/// `leastSquares(A, b)` (spec §6): SVD-based least squares, tolerant of a
/// rank-deficient `A` (a row/column whose normal equations happen to be
/// singular, e.g. a factor dimension never touched by any of its
/// nonzeros). Falls back to zero when the SVD itself reports failure,
/// rather than propagating a solver error into the middle of an epoch.
pub fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
    let svd = a.clone().svd(true, true);
    svd.solve(b, 1e-10).unwrap_or_else(|_| DVector::zeros(b.len()))
}

/// One ALS half-step updating `W` in place from the fixed `H` (spec
/// §4.10). Requires `data.v` to be row-major sorted, which
/// `FactorizationData` always is.
pub fn als_update_w(data: &mut FactorizationData, reg: AlsRegularize) {
    let rank = data.rank();
    let offsets = row_offsets(&data.v);
    for i in 0..data.v.rows() {
        let (lo, hi) = (offsets[i], offsets[i + 1]);
        if lo == hi {
            continue;
        }
        let mut a = DMatrix::<f64>::zeros(rank, rank);
        let mut b = DVector::<f64>::zeros(rank);
        for p in lo..hi {
            let j = data.v.col_at(p) as usize;
            let x = data.v.val_at(p);
            let h_j = data.h.col(j);
            for z1 in 0..rank {
                b[z1] += x * h_j[z1];
                for z2 in 0..rank {
                    a[(z1, z2)] += h_j[z1] * h_j[z2];
                }
            }
        }
        let d = match reg {
            AlsRegularize::L2(lambda) => lambda,
            AlsRegularize::NzL2(lambda) => lambda * data.nnz1[i] as f64,
        };
        for z in 0..rank {
            a[(z, z)] += d;
        }
        let w_i = solve_least_squares(&a, &b);
        data.w.set_row(i, w_i.as_slice());
    }
}

/// One ALS half-step updating `H` in place from the fixed `W` (spec
/// §4.10). Requires `data.vc`, the column-major mirror of `V`, to be
/// present (the driver builds it once before alternating begins).
pub fn als_update_h(data: &mut FactorizationData, reg: AlsRegularize) {
    let rank = data.rank();
    let vc = data.vc.as_ref().expect("ALS H-step needs data.vc (column-major V)");
    let offsets = col_offsets(vc);
    for j in 0..vc.cols() {
        let (lo, hi) = (offsets[j], offsets[j + 1]);
        if lo == hi {
            continue;
        }
        let mut a = DMatrix::<f64>::zeros(rank, rank);
        let mut b = DVector::<f64>::zeros(rank);
        for p in lo..hi {
            let i = vc.row_at(p) as usize;
            let x = vc.val_at(p);
            let w_i = data.w.row(i);
            for z1 in 0..rank {
                b[z1] += x * w_i[z1];
                for z2 in 0..rank {
                    a[(z1, z2)] += w_i[z1] * w_i[z2];
                }
            }
        }
        let d = match reg {
            AlsRegularize::L2(lambda) => lambda,
            AlsRegularize::NzL2(lambda) => lambda * data.nnz2[j] as f64,
        };
        for z in 0..rank {
            a[(z, z)] += d;
        }
        let h_j = solve_least_squares(&a, &b);
        data.h.set_col(j, h_j.as_slice());
    }
}

/// `0/0` and `x/0` for `x != 0` both collapse to `0` (spec §4.10's
/// "treating 0/0 and ∞ as 0"), rather than propagating `NaN`/`inf` into
/// the factors.
fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// GNMF's closed-form multiplicative step, `H ← H · (WᵀV) / (WᵀWH)` (spec
/// §4.10), applied elementwise over the dense `r x n` numerator/denominator.
pub fn gnmf_update_h(data: &mut FactorizationData) {
    let rank = data.rank();
    let n = data.h.cols();
    let m = data.w.rows();

    let mut wt_v = vec![0.0f64; rank * n];
    for p in 0..data.v.nnz() {
        let i = data.v.row_at(p) as usize;
        let j = data.v.col_at(p) as usize;
        let x = data.v.val_at(p);
        let w_i = data.w.row(i);
        for z in 0..rank {
            wt_v[z * n + j] += x * w_i[z];
        }
    }

    let mut wt_w = vec![0.0f64; rank * rank];
    for i in 0..m {
        let w_i = data.w.row(i);
        for z1 in 0..rank {
            for z2 in 0..rank {
                wt_w[z1 * rank + z2] += w_i[z1] * w_i[z2];
            }
        }
    }

    for j in 0..n {
        let h_j = data.h.col(j);
        let mut updated = vec![0.0f64; rank];
        for z1 in 0..rank {
            let mut denom = 0.0;
            for z2 in 0..rank {
                denom += wt_w[z1 * rank + z2] * h_j[z2];
            }
            updated[z1] = h_j[z1] * safe_div(wt_v[z1 * n + j], denom);
        }
        data.h.set_col(j, &updated);
    }
}

/// Symmetric analog of `gnmf_update_h`, `W ← W · (VHᵀ) / (WHHᵀ)` (ground
/// truth: `mf/ap/gnmf_impl.cc`'s `gnmf_w`).
pub fn gnmf_update_w(data: &mut FactorizationData) {
    let rank = data.rank();
    let m = data.w.rows();
    let n = data.h.cols();

    let mut v_ht = vec![0.0f64; m * rank];
    for p in 0..data.v.nnz() {
        let i = data.v.row_at(p) as usize;
        let j = data.v.col_at(p) as usize;
        let x = data.v.val_at(p);
        let h_j = data.h.col(j);
        for z in 0..rank {
            v_ht[i * rank + z] += x * h_j[z];
        }
    }

    let mut h_ht = vec![0.0f64; rank * rank];
    for j in 0..n {
        let h_j = data.h.col(j);
        for z1 in 0..rank {
            for z2 in 0..rank {
                h_ht[z1 * rank + z2] += h_j[z1] * h_j[z2];
            }
        }
    }

    for i in 0..m {
        let w_i = data.w.row(i);
        let mut updated = vec![0.0f64; rank];
        for z1 in 0..rank {
            let mut denom = 0.0;
            for z2 in 0..rank {
                denom += w_i[z2] * h_ht[z2 * rank + z1];
            }
            updated[z1] = w_i[z1] * safe_div(v_ht[i * rank + z1], denom);
        }
        data.w.set_row(i, &updated);
    }
}

/// Lee & Seung's generalized-KL multiplicative update (spec §4.10),
/// updating `H` from the fixed `W`: `num_zj = Σ_p∈col j (x_p / <W_ip,
/// H_·j>)·W_ip,z`, `denom_z = Σ_i W_i,z`, `H_z,j *= num_zj / denom_z`.
/// Requires `data.vc` as `als_update_h` does.
pub fn gkl_update_h(data: &mut FactorizationData) {
    let rank = data.rank();
    let vc = data.vc.as_ref().expect("GKL H-step needs data.vc (column-major V)");
    let offsets = col_offsets(vc);

    let mut denom = vec![0.0f64; rank];
    for i in 0..data.w.rows() {
        let w_i = data.w.row(i);
        for z in 0..rank {
            denom[z] += w_i[z];
        }
    }

    for j in 0..vc.cols() {
        let (lo, hi) = (offsets[j], offsets[j + 1]);
        if lo == hi {
            continue;
        }
        let mut num = vec![0.0f64; rank];
        let h_j = data.h.col(j);
        for p in lo..hi {
            let i = vc.row_at(p) as usize;
            let x = vc.val_at(p);
            let w_i = data.w.row(i);
            let pred = w_i.iter().zip(&h_j).map(|(a, b)| a * b).sum::<f64>().max(1e-12);
            let ratio = x / pred;
            for z in 0..rank {
                num[z] += ratio * w_i[z];
            }
        }
        let mut updated = h_j.clone();
        for z in 0..rank {
            updated[z] *= safe_div(num[z], denom[z]);
        }
        data.h.set_col(j, &updated);
    }
}

/// Symmetric analog of `gkl_update_h`, updating `W` from the fixed `H`.
pub fn gkl_update_w(data: &mut FactorizationData) {
    let rank = data.rank();
    let offsets = row_offsets(&data.v);

    let mut denom = vec![0.0f64; rank];
    for j in 0..data.h.cols() {
        let h_j = data.h.col(j);
        for z in 0..rank {
            denom[z] += h_j[z];
        }
    }

    for i in 0..data.v.rows() {
        let (lo, hi) = (offsets[i], offsets[i + 1]);
        if lo == hi {
            continue;
        }
        let mut num = vec![0.0f64; rank];
        let w_i = data.w.row(i);
        for p in lo..hi {
            let j = data.v.col_at(p) as usize;
            let x = data.v.val_at(p);
            let h_j = data.h.col(j);
            let pred = w_i.iter().zip(&h_j).map(|(a, b)| a * b).sum::<f64>().max(1e-12);
            let ratio = x / pred;
            for z in 0..rank {
                num[z] += ratio * h_j[z];
            }
        }
        let mut updated = w_i.clone();
        for z in 0..rank {
            updated[z] *= safe_div(num[z], denom[z]);
        }
        data.w.set_row(i, &updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmf_matrix::{Dense, Order as DenseOrder, SparseCoo};

    fn diag_data() -> FactorizationData {
        let v = SparseCoo::from_triples_unsorted(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)], true);
        let vc = SparseCoo::from_triples_unsorted(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)], false);
        let w = Dense::from_data(2, 1, DenseOrder::RowMajor, vec![1.0, 1.0]);
        let h = Dense::from_data(1, 2, DenseOrder::ColMajor, vec![1.0, 1.0]);
        FactorizationData::new(v, Some(vc), w, h, 1)
    }

    #[test]
    fn als_w_step_recovers_the_generating_factor_with_no_regularization() {
        let mut data = diag_data();
        als_update_w(&mut data, AlsRegularize::L2(0.0));
        // With H fixed at [1,1] and a single nonzero of 2.0 per row,
        // the least-squares solution is W_i = 2.0 / 1 = 2.0.
        assert!((data.w.get(0, 0) - 2.0).abs() < 1e-8);
        assert!((data.w.get(1, 0) - 2.0).abs() < 1e-8);
    }

    #[test]
    fn als_h_step_recovers_the_generating_factor_with_no_regularization() {
        let mut data = diag_data();
        als_update_h(&mut data, AlsRegularize::L2(0.0));
        assert!((data.h.get(0, 0) - 2.0).abs() < 1e-8);
        assert!((data.h.get(0, 1) - 2.0).abs() < 1e-8);
    }

    #[test]
    fn gnmf_step_leaves_a_perfect_fit_unchanged() {
        let mut data = diag_data();
        data.w.set(0, 0, 2.0_f64.sqrt());
        data.w.set(1, 0, 2.0_f64.sqrt());
        data.h.set(0, 0, 2.0_f64.sqrt());
        data.h.set(0, 1, 2.0_f64.sqrt());
        let before = data.h.clone();
        gnmf_update_h(&mut data);
        for j in 0..2 {
            assert!((data.h.get(0, j) - before.get(0, j)).abs() < 1e-8);
        }
    }

    #[test]
    fn gnmf_w_step_leaves_a_perfect_fit_unchanged() {
        let mut data = diag_data();
        data.w.set(0, 0, 2.0_f64.sqrt());
        data.w.set(1, 0, 2.0_f64.sqrt());
        data.h.set(0, 0, 2.0_f64.sqrt());
        data.h.set(0, 1, 2.0_f64.sqrt());
        let before = data.w.clone();
        gnmf_update_w(&mut data);
        for i in 0..2 {
            assert!((data.w.get(i, 0) - before.get(i, 0)).abs() < 1e-8);
        }
    }

    #[test]
    fn gkl_update_h_leaves_a_perfect_fit_unchanged() {
        let mut data = diag_data();
        data.w.set(0, 0, 2.0_f64.sqrt());
        data.w.set(1, 0, 2.0_f64.sqrt());
        data.h.set(0, 0, 2.0_f64.sqrt());
        data.h.set(0, 1, 2.0_f64.sqrt());
        let before = data.h.clone();
        gkl_update_h(&mut data);
        for j in 0..2 {
            assert!((data.h.get(0, j) - before.get(0, j)).abs() < 1e-6);
        }
    }
}
