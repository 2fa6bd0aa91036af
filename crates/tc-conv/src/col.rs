//! Column workspace shared by the convolution batch loop.

/// Scratch buffer holding the im2col expansion of one batch item.
///
/// Logically shaped [channels, kernel_h, kernel_w, out_h, out_w]; the same
/// storage is read as the [channels * kernel_h * kernel_w, out_h * out_w]
/// matrix at the GEMM boundary. A kernel invocation owns the buffer for its
/// whole duration and overwrites it on every batch iteration, so batch
/// items must not share it concurrently.
#[derive(Debug)]
pub struct ColBuffer {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl ColBuffer {
    /// Allocate a workspace for the given geometry.
    pub fn new(channels: usize, kernel_h: usize, kernel_w: usize, out_h: usize, out_w: usize) -> Self {
        let rows = channels * kernel_h * kernel_w;
        let cols = out_h * out_w;
        ColBuffer {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Row count of the matrix view (channels * kernel_h * kernel_w).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count of the matrix view (out_h * out_w).
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The 2-D matrix view of the workspace.
    pub fn matrix(&self) -> &[f32] {
        &self.data
    }

    /// Mutable matrix view; each transform overwrites it in full.
    pub fn matrix_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}
