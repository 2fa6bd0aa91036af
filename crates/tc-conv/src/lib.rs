//! `tc-conv` - GEMM-based 2-D convolution kernels for tensor-compute.
//!
//! Convolution is decomposed into an image-to-column transform followed by
//! matrix multiplication through a `GemmBackend`; the backward kernel runs
//! the mirrored GEMM + column-to-image pipeline and accumulates both
//! gradients across the batch.

pub mod col;
pub mod conv;
pub mod error;
pub mod im2col;
pub mod shape;

pub use col::ColBuffer;
pub use conv::{Conv2d, Conv2dParams};
pub use error::{OpError, Result};
pub use im2col::{col2im, im2col};
pub use shape::{conv2d_output_shape, conv2d_output_size};
