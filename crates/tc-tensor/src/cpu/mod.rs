pub(crate) mod contract;

use crate::backend::{GemmBackend, Transpose};
use crate::error::{Result, TensorError};

/// Pure-Rust CPU GEMM backend.
///
/// Untransposed, unit-scale, overwriting multiplies of dense matrices take
/// the contraction kernel in `contract`; everything else runs a general
/// strided loop with full transpose/alpha/beta semantics. Gradient-style
/// calls always land on the general path since they need accumulation or a
/// transposed operand.
#[derive(Debug, Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GemmBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn gemm(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        lda: usize,
        b: &[f32],
        ldb: usize,
        beta: f32,
        c: &mut [f32],
        ldc: usize,
    ) -> Result<()> {
        validate_args(trans_a, trans_b, m, n, k, a.len(), lda, b.len(), ldb, c.len(), ldc)?;

        // The scalar comparison is intentionally exact: only calls that ask
        // for the mathematically identical operation are rerouted.
        #[allow(clippy::float_cmp)]
        let fast = trans_a == Transpose::No
            && trans_b == Transpose::No
            && alpha == 1.0
            && beta == 0.0
            && lda == k
            && ldb == n
            && ldc == n;

        if fast {
            contract::contract_f32(a, b, c, m, n, k);
        } else {
            gemm_strided(trans_a, trans_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc);
        }
        Ok(())
    }
}

/// General strided multiply-accumulate.
///
/// Honors transpose flags, leading dimensions and both scalars. `c` is
/// never read when `beta == 0`, so it may start uninitialized.
#[allow(clippy::too_many_arguments)]
fn gemm_strided(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    // A is stored [m, lda] or, transposed, [k, lda]; likewise for B.
    let a_at = |row: usize, col: usize| -> f32 {
        match trans_a {
            Transpose::No => a[row * lda + col],
            Transpose::Yes => a[col * lda + row],
        }
    };
    let b_at = |row: usize, col: usize| -> f32 {
        match trans_b {
            Transpose::No => b[row * ldb + col],
            Transpose::Yes => b[col * ldb + row],
        }
    };

    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a_at(i, p) * b_at(p, j);
            }
            let out = &mut c[i * ldc + j];
            *out = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * *out
            };
        }
    }
}

/// Tight element count needed for a stored [rows, cols] view with row
/// stride `ld`: the last row does not need to be padded out to `ld`.
fn required_len(rows: usize, cols: usize, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        (rows - 1) * ld + cols
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_args(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    a_len: usize,
    lda: usize,
    b_len: usize,
    ldb: usize,
    c_len: usize,
    ldc: usize,
) -> Result<()> {
    // Stored extents of each operand, before the implicit transpose.
    let (a_rows, a_cols) = if trans_a.is_trans() { (k, m) } else { (m, k) };
    let (b_rows, b_cols) = if trans_b.is_trans() { (n, k) } else { (k, n) };

    if lda < a_cols {
        return Err(TensorError::GemmPrecondition(format!(
            "lda={} is smaller than the stored A row length {}",
            lda, a_cols
        )));
    }
    if ldb < b_cols {
        return Err(TensorError::GemmPrecondition(format!(
            "ldb={} is smaller than the stored B row length {}",
            ldb, b_cols
        )));
    }
    if ldc < n {
        return Err(TensorError::GemmPrecondition(format!(
            "ldc={} is smaller than the C row length {}",
            ldc, n
        )));
    }
    if a_len < required_len(a_rows, a_cols, lda) {
        return Err(TensorError::GemmPrecondition(format!(
            "A holds {} elements but a [{}x{}] view with lda={} needs {}",
            a_len,
            a_rows,
            a_cols,
            lda,
            required_len(a_rows, a_cols, lda)
        )));
    }
    if b_len < required_len(b_rows, b_cols, ldb) {
        return Err(TensorError::GemmPrecondition(format!(
            "B holds {} elements but a [{}x{}] view with ldb={} needs {}",
            b_len,
            b_rows,
            b_cols,
            ldb,
            required_len(b_rows, b_cols, ldb)
        )));
    }
    if c_len < required_len(m, n, ldc) {
        return Err(TensorError::GemmPrecondition(format!(
            "C holds {} elements but a [{}x{}] view with ldc={} needs {}",
            c_len,
            m,
            n,
            ldc,
            required_len(m, n, ldc)
        )));
    }
    Ok(())
}
