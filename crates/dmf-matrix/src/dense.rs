/// Storage order of a `Dense` matrix (spec §3: "row-major (W) or
/// column-major (H) order").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    RowMajor,
    ColMajor,
}

/// A dense `rows x cols` matrix of `f64`, O(1) element access (spec §3).
/// `W` is conventionally row-major (one row per training point's latent
/// vector, cache-friendly for the SGD inner loop's `W[i, ·]` reads); `H`
/// is conventionally column-major for the symmetric reason.
#[derive(Clone, Debug, PartialEq)]
pub struct Dense {
    rows: usize,
    cols: usize,
    order: Order,
    data: Vec<f64>,
}

impl Dense {
    pub fn zeros(rows: usize, cols: usize, order: Order) -> Self {
        Self {
            rows,
            cols,
            order,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_data(rows: usize, cols: usize, order: Order, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols);
        Self {
            rows,
            cols,
            order,
            data,
        }
    }

    pub fn identity(n: usize, order: Order) -> Self {
        let mut m = Self::zeros(n, n, order);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn order(&self) -> Order {
        self.order
    }

    #[inline]
    fn index(&self, r: usize, c: usize) -> usize {
        match self.order {
            Order::RowMajor => r * self.cols + c,
            Order::ColMajor => c * self.rows + r,
        }
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[self.index(r, c)]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        let idx = self.index(r, c);
        self.data[idx] = v;
    }

    #[inline]
    pub fn add_assign(&mut self, r: usize, c: usize, delta: f64) {
        let idx = self.index(r, c);
        self.data[idx] += delta;
    }

    /// Row `i` as `(start, stride, len)` is awkward in safe Rust when the
    /// matrix is column-major, so `row`/`col` each return an owned `Vec`.
    /// Hot kernels that only read a handful of entries use `get` directly.
    pub fn row(&self, r: usize) -> Vec<f64> {
        (0..self.cols).map(|c| self.get(r, c)).collect()
    }

    pub fn col(&self, c: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, c)).collect()
    }

    pub fn set_row(&mut self, r: usize, values: &[f64]) {
        assert_eq!(values.len(), self.cols);
        for (c, v) in values.iter().enumerate() {
            self.set(r, c, *v);
        }
    }

    pub fn set_col(&mut self, c: usize, values: &[f64]) {
        assert_eq!(values.len(), self.rows);
        for (r, v) in values.iter().enumerate() {
            self.set(r, c, *v);
        }
    }

    /// Row `r` as a contiguous mutable slice, bypassing the borrow checker.
    /// Safety: `self` must be `Order::RowMajor`, `r < self.rows`, and the
    /// caller must not alias this slice with any other live slice it
    /// obtains from the same `Dense` (row-disjoint callers, e.g. PSGD's
    /// Hogwild workers operating on distinct rows of `W`, are sound).
    pub unsafe fn row_mut_unchecked(&self, r: usize) -> &mut [f64] {
        debug_assert_eq!(self.order, Order::RowMajor);
        debug_assert!(r < self.rows);
        let ptr = self.data.as_ptr().add(r * self.cols) as *mut f64;
        std::slice::from_raw_parts_mut(ptr, self.cols)
    }

    /// Column `c` as a contiguous mutable slice. Safety: as
    /// `row_mut_unchecked`, but requires `Order::ColMajor` and `c < self.cols`.
    pub unsafe fn col_mut_unchecked(&self, c: usize) -> &mut [f64] {
        debug_assert_eq!(self.order, Order::ColMajor);
        debug_assert!(c < self.cols);
        let ptr = self.data.as_ptr().add(c * self.rows) as *mut f64;
        std::slice::from_raw_parts_mut(ptr, self.rows)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_and_col_major_agree_elementwise() {
        let mut rm = Dense::zeros(2, 3, Order::RowMajor);
        let mut cm = Dense::zeros(2, 3, Order::ColMajor);
        for r in 0..2 {
            for c in 0..3 {
                let v = (r * 10 + c) as f64;
                rm.set(r, c, v);
                cm.set(r, c, v);
            }
        }
        for r in 0..2 {
            for c in 0..3 {
                assert_eq!(rm.get(r, c), cm.get(r, c));
            }
        }
    }

    #[test]
    fn identity_has_ones_on_diagonal() {
        let m = Dense::identity(3, Order::RowMajor);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(m.get(i, j), if i == j { 1.0 } else { 0.0 });
            }
        }
    }
}
