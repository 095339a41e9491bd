use dmf_matrix::{Dense, FactorizationData, SparseCoo};

/// Raw data-fit loss and regularizer term, kept separate so the driver can
/// report them individually (spec §4.13 supplement, grounded in
/// `mf/loss/*.h` which always computes the two pieces separately — e.g.
/// `nzl2.h`'s `l2Factors` beside the plain `nzsl.h` sum-of-squares).
#[derive(Clone, Copy, Debug, Default)]
pub struct LossParts {
    pub raw: f64,
    pub regularizer: f64,
}

impl LossParts {
    pub fn total(&self) -> f64 {
        self.raw + self.regularizer
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Sum of squared prediction error over every nonzero of `v` against an
/// arbitrary `w`/`h` pair, not necessarily the ones `v` was trained with.
/// Factored out of `raw_nzsl` so held-out test-set scoring can reuse the
/// current epoch's live `W`/`H` without cloning a whole `FactorizationData`
/// (spec §6 persisted-state contract's `loss.test` field).
pub fn raw_nzsl_on(v: &SparseCoo, w: &Dense, h: &Dense) -> f64 {
    (0..v.nnz())
        .map(|p| {
            let i = v.row_at(p) as usize;
            let j = v.col_at(p) as usize;
            let x = v.val_at(p);
            let err = x - dot(&w.row(i), &h.col(j));
            err * err
        })
        .sum()
}

fn raw_nzsl(data: &FactorizationData) -> f64 {
    raw_nzsl_on(&data.v, &data.w, &data.h)
}

fn l2_norm_sq(data: &FactorizationData) -> f64 {
    data.w.data().iter().map(|v| v * v).sum::<f64>() + data.h.data().iter().map(|v| v * v).sum::<f64>()
}

fn nzl2_norm_sq(data: &FactorizationData) -> f64 {
    let mut acc = 0.0;
    for i in 0..data.w.rows() {
        let row = data.w.row(i);
        acc += data.nnz1[i] as f64 * row.iter().map(|v| v * v).sum::<f64>();
    }
    for j in 0..data.h.cols() {
        let col = data.h.col(j);
        acc += data.nnz2[j] as f64 * col.iter().map(|v| v * v).sum::<f64>();
    }
    acc
}

/// `Nzsl`/`Sl`: no regularizer term.
pub fn nzsl_loss(data: &FactorizationData) -> LossParts {
    LossParts {
        raw: raw_nzsl(data),
        regularizer: 0.0,
    }
}

/// `NzslL2(lambda)`.
pub fn nzsl_l2_loss(data: &FactorizationData, lambda: f64) -> LossParts {
    LossParts {
        raw: raw_nzsl(data),
        regularizer: lambda * l2_norm_sq(data),
    }
}

/// `NzslNzl2(lambda)`.
pub fn nzsl_nzl2_loss(data: &FactorizationData, lambda: f64) -> LossParts {
    LossParts {
        raw: raw_nzsl(data),
        regularizer: lambda * nzl2_norm_sq(data),
    }
}

/// Generalized-KL loss (`x*ln(x/pred) - x + pred`, `0*ln(0)` treated as
/// `0`), unregularized.
pub fn gkl_loss(data: &FactorizationData) -> LossParts {
    let raw = (0..data.v.nnz())
        .map(|p| {
            let i = data.v.row_at(p) as usize;
            let j = data.v.col_at(p) as usize;
            let x = data.v.val_at(p);
            let pred = dot(&data.w.row(i), &data.h.col(j)).max(1e-12);
            if x <= 0.0 {
                pred
            } else {
                x * (x / pred).ln() - x + pred
            }
        })
        .sum();
    LossParts { raw, regularizer: 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmf_matrix::{Dense, Order as DenseOrder, SparseCoo};

    fn perfect_fit() -> FactorizationData {
        let v = SparseCoo::from_triples_unsorted(2, 2, vec![(0, 0, 1.0), (1, 1, 1.0)], true);
        let w = Dense::identity(2, DenseOrder::RowMajor);
        let h = Dense::identity(2, DenseOrder::ColMajor);
        FactorizationData::new(v, None, w, h, 1)
    }

    #[test]
    fn nzsl_loss_is_zero_at_a_perfect_fit() {
        let data = perfect_fit();
        assert_eq!(nzsl_loss(&data).raw, 0.0);
    }

    #[test]
    fn nzsl_l2_adds_a_positive_regularizer_even_at_a_perfect_fit() {
        let data = perfect_fit();
        let parts = nzsl_l2_loss(&data, 0.1);
        assert_eq!(parts.raw, 0.0);
        assert!(parts.regularizer > 0.0);
        assert_eq!(parts.total(), parts.regularizer);
    }

    #[test]
    fn gkl_loss_is_zero_at_a_perfect_fit() {
        let data = perfect_fit();
        assert!(gkl_loss(&data).raw.abs() < 1e-9);
    }
}
