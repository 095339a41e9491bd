use parking_lot::Mutex;

/// `update(V, W, H, i, j, x, eps)` (spec §4.7): given one nonzero, reads
/// `W[i, ·]`/`H[·, j]` and is expected to mutate them in place.
///
/// The source statically composes update/regularize/loss as template
/// parameters; spec §9 asks for a trait instead, monomorphised only for
/// the combination actually selected at startup (`dmf-cli` picks one
/// concrete `Box<dyn Update>` and hands it to the generic SGD kernel,
/// rather than instantiating every combination).
pub trait Update: Send + Sync {
    /// `nnz1_i`/`nnz2_j` are the degrees of row `i`/column `j`, needed by
    /// the `Nzl2`-family regularizers.
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32);
}

/// `regularize`, called once per epoch by PSGD/DSGD (spec §4.7), or once
/// per stratum by DSGD when `rescale_stratum_stepsize()` is true.
pub trait Regularize: Send + Sync {
    fn apply(&self, w: &mut dmf_matrix::Dense, h: &mut dmf_matrix::Dense, eps: f64);

    /// When true, the caller divides `eps` by `d` (the stratum count)
    /// before calling `apply` once per stratum instead of once per epoch
    /// (spec §4.6 step 4).
    fn rescale_stratum_stepsize(&self) -> bool {
        false
    }
}

impl Update for &dyn Update {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        (**self).apply(w_row, h_col, x, eps, nnz1_i, nnz2_j);
    }
}

impl Update for std::sync::Arc<dyn Update> {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        self.as_ref().apply(w_row, h_col, x, eps, nnz1_i, nnz2_j);
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Plain squared-loss gradient: `(x - <W_i, H_j>)^2`.
pub struct Nzsl;

impl Update for Nzsl {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, _nnz1_i: u32, _nnz2_j: u32) {
        let err = x - dot(w_row, h_col);
        for k in 0..w_row.len() {
            let w_k = w_row[k];
            let h_k = h_col[k];
            w_row[k] += 2.0 * eps * err * h_k;
            h_col[k] += 2.0 * eps * err * w_k;
        }
    }
}

/// `Sl`: squared loss with the same gradient as `Nzsl`, kept distinct
/// because it pairs with the plain (non-nonzero-weighted) L2 regularizer
/// rather than `Nzl2` (spec §4.7).
pub type Sl = Nzsl;

/// `Nzsl` plus `lambda * W_i` and `lambda * H_j`.
pub struct NzslL2 {
    pub lambda: f64,
}

impl Update for NzslL2 {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        let err = x - dot(w_row, h_col);
        for k in 0..w_row.len() {
            let w_k = w_row[k];
            let h_k = h_col[k];
            w_row[k] += 2.0 * eps * (err * h_k - self.lambda * w_k);
            h_col[k] += 2.0 * eps * (err * w_k - self.lambda * h_k);
        }
        let _ = (nnz1_i, nnz2_j);
    }
}

/// `Nzsl` plus `lambda * nnz1[i] * W_i` and `lambda * nnz2[j] * H_j`.
pub struct NzslNzl2 {
    pub lambda: f64,
}

impl Update for NzslNzl2 {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        let err = x - dot(w_row, h_col);
        let reg_w = self.lambda * nnz1_i as f64;
        let reg_h = self.lambda * nnz2_j as f64;
        for k in 0..w_row.len() {
            let w_k = w_row[k];
            let h_k = h_col[k];
            w_row[k] += 2.0 * eps * (err * h_k - reg_w * w_k);
            h_col[k] += 2.0 * eps * (err * w_k - reg_h * h_k);
        }
    }
}

/// `NzslNzl2`, but the first column of `W` and first row of `H` are
/// biases: regularised with their own `lambda_row`/`lambda_col` and
/// excluded from the interaction term for their own dimension (spec
/// §4.7). Index 0 of the passed slices is the bias component.
pub struct BiasedNzslNzl2 {
    pub lambda_w: f64,
    pub lambda_h: f64,
    pub lambda_row: f64,
    pub lambda_col: f64,
}

impl Update for BiasedNzslNzl2 {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        debug_assert!(w_row.len() == h_col.len() && w_row.len() >= 1);
        // interaction term excludes each side's own bias component: W's
        // bias (index 0) does not multiply H's latent factors and vice
        // versa, so the prediction is bias_w + bias_h + <W_1.., H_1..>.
        let interaction: f64 = (1..w_row.len()).map(|k| w_row[k] * h_col[k]).sum();
        let pred = w_row[0] + h_col[0] + interaction;
        let err = x - pred;

        let reg_w = self.lambda_w * nnz1_i as f64;
        let reg_h = self.lambda_h * nnz2_j as f64;

        w_row[0] += 2.0 * eps * (err - self.lambda_row * w_row[0]);
        h_col[0] += 2.0 * eps * (err - self.lambda_col * h_col[0]);

        for k in 1..w_row.len() {
            let w_k = w_row[k];
            let h_k = h_col[k];
            w_row[k] += 2.0 * eps * (err * h_k - reg_w * w_k);
            h_col[k] += 2.0 * eps * (err * w_k - reg_h * h_k);
        }
    }
}

/// Generalized KL-divergence (Lee & Seung) per-nonzero gradient.
pub struct Gkl;

impl Update for Gkl {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, _nnz1_i: u32, _nnz2_j: u32) {
        let pred = dot(w_row, h_col).max(1e-12);
        let ratio = x / pred;
        for k in 0..w_row.len() {
            let w_k = w_row[k];
            let h_k = h_col[k];
            w_row[k] += eps * h_k * (ratio - 1.0);
            h_col[k] += eps * w_k * (ratio - 1.0);
        }
    }
}

/// Multiplicative (GNMF-style) per-nonzero step: same fixed point as the
/// closed-form batch update in `alternating::gnmf_step`, expressed as a
/// per-nonzero multiplicative nudge so it can run inside the same SGD
/// kernel loop as the additive functors above.
pub struct Gnmf;

impl Update for Gnmf {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, _nnz1_i: u32, _nnz2_j: u32) {
        let pred = dot(w_row, h_col).max(1e-12);
        let ratio = (x / pred).max(0.0);
        for k in 0..w_row.len() {
            let w_k = w_row[k];
            let h_k = h_col[k];
            w_row[k] = (w_k * (1.0 - eps) + eps * w_k * ratio).max(0.0);
            h_col[k] = (h_k * (1.0 - eps) + eps * h_k * ratio).max(0.0);
        }
    }
}

/// No-op regularizer, for update functors (`Sl`/`Gkl`/`Gnmf`) whose
/// regularization, if any, is folded into the per-nonzero step itself.
pub struct NoRegularize;

impl Regularize for NoRegularize {
    fn apply(&self, _w: &mut dmf_matrix::Dense, _h: &mut dmf_matrix::Dense, _eps: f64) {}
}

/// Whole-matrix `W *= 1 - 2*eps*lambda`, same for `H` (spec §6's
/// `--regularize` contract, for update functors whose own step does not
/// already fold a penalty in).
pub struct L2Regularize {
    pub lambda: f64,
}

impl Regularize for L2Regularize {
    fn apply(&self, w: &mut dmf_matrix::Dense, h: &mut dmf_matrix::Dense, eps: f64) {
        let factor = 1.0 - 2.0 * eps * self.lambda;
        for v in w.data_mut() {
            *v *= factor;
        }
        for v in h.data_mut() {
            *v *= factor;
        }
    }
}

/// As `L2Regularize`, but row `i` of `W` / column `j` of `H` is shrunk by
/// `lambda * nnz1[i]` / `lambda * nnz2[j]` rather than a flat `lambda`
/// (spec §4.7's `Nzl2` family). `nnz1`/`nnz2` are snapshotted once at job
/// construction, matching the other nonzero-weighted functors.
pub struct Nzl2Regularize {
    pub lambda: f64,
    pub nnz1: Vec<u32>,
    pub nnz2: Vec<u32>,
    pub rescale_per_stratum: bool,
}

impl Regularize for Nzl2Regularize {
    fn apply(&self, w: &mut dmf_matrix::Dense, h: &mut dmf_matrix::Dense, eps: f64) {
        for i in 0..w.rows() {
            let factor = 1.0 - 2.0 * eps * self.lambda * self.nnz1[i] as f64;
            let mut row = w.row(i);
            for v in row.iter_mut() {
                *v *= factor;
            }
            w.set_row(i, &row);
        }
        for j in 0..h.cols() {
            let factor = 1.0 - 2.0 * eps * self.lambda * self.nnz2[j] as f64;
            let mut col = h.col(j);
            for v in col.iter_mut() {
                *v *= factor;
            }
            h.set_col(j, &col);
        }
    }

    fn rescale_stratum_stepsize(&self) -> bool {
        self.rescale_per_stratum
    }
}

/// Clamps every updated component to `|·|` after the wrapped step.
pub struct UpdateAbs<U>(pub U);

impl<U: Update> Update for UpdateAbs<U> {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        self.0.apply(w_row, h_col, x, eps, nnz1_i, nnz2_j);
        for v in w_row.iter_mut().chain(h_col.iter_mut()) {
            *v = v.abs();
        }
    }
}

/// Clamps every updated component to `[lo, hi]` after the wrapped step.
pub struct UpdateTruncate<U> {
    pub inner: U,
    pub lo: f64,
    pub hi: f64,
}

impl<U: Update> Update for UpdateTruncate<U> {
    fn apply(&self, w_row: &mut [f64], h_col: &mut [f64], x: f64, eps: f64, nnz1_i: u32, nnz2_j: u32) {
        self.inner.apply(w_row, h_col, x, eps, nnz1_i, nnz2_j);
        for v in w_row.iter_mut().chain(h_col.iter_mut()) {
            *v = v.clamp(self.lo, self.hi);
        }
    }
}

/// Acquires per-row and per-column mutexes around the step, for ASGD and
/// stratified PSGD where multiple tasks may touch the same `W` row or `H`
/// column concurrently (spec §4.7, §5). `row_lock`/`col_lock` are handed
/// in by the caller, indexed by the same `i`/`j` the kernel is updating.
pub struct UpdateLock<U> {
    pub inner: U,
}

impl<U: Update> UpdateLock<U> {
    /// Runs the wrapped update while holding both locks; this is a
    /// separate method rather than an `Update` impl because `Update::apply`
    /// has no way to receive the lock table, only the row/column slices.
    pub fn apply_locked(
        &self,
        row_lock: &Mutex<()>,
        col_lock: &Mutex<()>,
        w_row: &mut [f64],
        h_col: &mut [f64],
        x: f64,
        eps: f64,
        nnz1_i: u32,
        nnz2_j: u32,
    ) {
        let _g1 = row_lock.lock();
        let _g2 = col_lock.lock();
        self.inner.apply(w_row, h_col, x, eps, nnz1_i, nnz2_j);
    }
}
