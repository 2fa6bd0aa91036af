//! Output-shape inference for the convolution operator.
//!
//! The kernels themselves read output extents from the caller-allocated
//! output tensor; these helpers are what callers use to size that tensor.

use tc_tensor::Shape;

use crate::error::{OpError, Result};

/// Output extent of one spatial axis.
///
/// `(in_size + 2*padding - kernel) / stride + 1`, or 0 when the padded
/// input cannot fit the kernel.
pub fn conv2d_output_size(in_size: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    let padded = in_size + 2 * padding;
    if padded < kernel {
        return 0;
    }
    (padded - kernel) / stride + 1
}

/// Full [batch, out_channels, out_h, out_w] output shape for a convolution
/// of `input_dims` ([batch, channels, height, width]) with `filter_dims`
/// ([out_channels, channels, kernel_h, kernel_w]).
pub fn conv2d_output_shape(
    input_dims: &[usize],
    filter_dims: &[usize],
    strides: [usize; 2],
    paddings: [usize; 2],
) -> Result<Shape> {
    if input_dims.len() != 4 {
        return Err(OpError::BadRank {
            name: "input",
            expected: 4,
            got: input_dims.len(),
        });
    }
    if filter_dims.len() != 4 {
        return Err(OpError::BadRank {
            name: "filter",
            expected: 4,
            got: filter_dims.len(),
        });
    }
    if strides[0] == 0 || strides[1] == 0 {
        return Err(OpError::BadParams(format!(
            "strides must be nonzero, got {:?}",
            strides
        )));
    }
    if input_dims[1] != filter_dims[1] {
        return Err(OpError::ShapeMismatch {
            name: "filter",
            expected: vec![filter_dims[0], input_dims[1], filter_dims[2], filter_dims[3]],
            got: filter_dims.to_vec(),
        });
    }

    let out_h = conv2d_output_size(input_dims[2], filter_dims[2], strides[0], paddings[0]);
    let out_w = conv2d_output_size(input_dims[3], filter_dims[3], strides[1], paddings[1]);
    Ok(Shape::new(vec![input_dims[0], filter_dims[0], out_h, out_w]))
}
