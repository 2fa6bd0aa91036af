use std::fmt::Debug;

use crate::backend::{GemmBackend, Transpose};
use crate::error::Result;

/// Operation selector understood by device matrix-multiply handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    /// Use the operand as stored.
    N,
    /// Use the operand transposed.
    T,
}

impl From<Transpose> for DeviceOp {
    fn from(t: Transpose) -> Self {
        match t {
            Transpose::No => DeviceOp::N,
            Transpose::Yes => DeviceOp::T,
        }
    }
}

/// External device matrix-multiply handle.
///
/// Implemented by the embedding framework over its device runtime (CUDA,
/// Metal, Vulkan, ...). Calls are synchronous from this layer's point of
/// view: `matmul` returns once the computation has completed or has been
/// enqueued on a stream whose ordering the device guarantees. Failures
/// surface through the returned error; no retry happens here.
pub trait DeviceMatmul: Send + Sync + Debug {
    /// Compute `C := alpha * op(A) * op(B) + beta * C` on the device.
    #[allow(clippy::too_many_arguments)]
    fn matmul(
        &self,
        op_a: DeviceOp,
        op_b: DeviceOp,
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
    ) -> Result<()>;
}

/// GEMM backend that forwards every call to a device handle.
///
/// Translates the dispatcher's transpose flags to the handle's operation
/// enum and passes all dimension, stride and scalar arguments through
/// unchanged. No numeric work happens on this path.
#[derive(Debug)]
pub struct GpuBackend {
    handle: Box<dyn DeviceMatmul>,
}

impl GpuBackend {
    pub fn new(handle: Box<dyn DeviceMatmul>) -> Self {
        GpuBackend { handle }
    }
}

impl GemmBackend for GpuBackend {
    fn name(&self) -> &str {
        "gpu"
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
        self.handle.matmul(
            trans_a.into(),
            trans_b.into(),
            m,
            n,
            k,
            alpha,
            a,
            lda,
            b,
            ldb,
            beta,
            c,
            ldc,
        )
    }
}
