//! GEMM-based 2-D convolution and its gradient.
//!
//! Forward decomposes into im2col followed by one matrix multiply per
//! batch item; backward mirrors it with a transposed multiply feeding
//! col2im for the input gradient and an accumulating multiply for the
//! filter gradient.

use tc_tensor::{GemmBackend, Tensor, Transpose};

use crate::col::ColBuffer;
use crate::error::{OpError, Result};
use crate::im2col::{col2im, im2col};

/// Stride and padding attributes, ordered [vertical, horizontal].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub strides: [usize; 2],
    pub paddings: [usize; 2],
}

impl Conv2dParams {
    fn validate(&self) -> Result<()> {
        if self.strides[0] == 0 || self.strides[1] == 0 {
            return Err(OpError::BadParams(format!(
                "strides must be nonzero, got {:?}",
                self.strides
            )));
        }
        Ok(())
    }
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            strides: [1, 1],
            paddings: [0, 0],
        }
    }
}

/// Resolved extents of one convolution call.
///
/// Output spatial extents come from the caller-allocated output tensor;
/// checking them against strides/paddings/kernel size is the shape
/// inference stage's job, not this kernel's.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
    out_channels: usize,
    kernel_h: usize,
    kernel_w: usize,
    out_h: usize,
    out_w: usize,
}

impl Geometry {
    fn resolve(input: &Tensor, filter: &Tensor, output: &Tensor) -> Result<Geometry> {
        let in_dims = input.shape().dims();
        let f_dims = filter.shape().dims();
        let out_dims = output.shape().dims();

        if in_dims.len() != 4 {
            return Err(OpError::BadRank {
                name: "input",
                expected: 4,
                got: in_dims.len(),
            });
        }
        if f_dims.len() != 4 {
            return Err(OpError::BadRank {
                name: "filter",
                expected: 4,
                got: f_dims.len(),
            });
        }
        if out_dims.len() != 4 {
            return Err(OpError::BadRank {
                name: "output",
                expected: 4,
                got: out_dims.len(),
            });
        }
        if f_dims[1] != in_dims[1] {
            return Err(OpError::ShapeMismatch {
                name: "filter",
                expected: vec![f_dims[0], in_dims[1], f_dims[2], f_dims[3]],
                got: f_dims.to_vec(),
            });
        }
        if out_dims[0] != in_dims[0] || out_dims[1] != f_dims[0] {
            return Err(OpError::ShapeMismatch {
                name: "output",
                expected: vec![in_dims[0], f_dims[0], out_dims[2], out_dims[3]],
                got: out_dims.to_vec(),
            });
        }

        Ok(Geometry {
            batch: in_dims[0],
            channels: in_dims[1],
            height: in_dims[2],
            width: in_dims[3],
            out_channels: f_dims[0],
            kernel_h: f_dims[2],
            kernel_w: f_dims[3],
            out_h: out_dims[2],
            out_w: out_dims[3],
        })
    }
}

/// 2-D convolution kernel over a `GemmBackend`.
///
/// Holds only the operator attributes; every call owns its own column
/// workspace, sized for one batch item and reused across the sequential
/// batch loop.
#[derive(Debug, Clone)]
pub struct Conv2d {
    params: Conv2dParams,
}

impl Conv2d {
    pub fn new(params: Conv2dParams) -> Self {
        Conv2d { params }
    }

    pub fn params(&self) -> &Conv2dParams {
        &self.params
    }

    /// Compute output feature maps.
    ///
    /// - `input`: [batch, channels, height, width]
    /// - `filter`: [out_channels, channels, kernel_h, kernel_w]
    /// - `output`: caller-allocated [batch, out_channels, out_h, out_w],
    ///   overwritten in full.
    ///
    /// Per batch item: im2col into the workspace, then one multiply of the
    /// [out_channels, channels*kernel_h*kernel_w] filter matrix against the
    /// column matrix, written straight into the output slice.
    pub fn forward(
        &self,
        backend: &dyn GemmBackend,
        input: &Tensor,
        filter: &Tensor,
        output: &mut Tensor,
    ) -> Result<()> {
        self.params.validate()?;
        let g = Geometry::resolve(input, filter, output)?;

        let k = g.channels * g.kernel_h * g.kernel_w;
        let n = g.out_h * g.out_w;
        let mut col = ColBuffer::new(g.channels, g.kernel_h, g.kernel_w, g.out_h, g.out_w);

        // The filter tensor is already the [out_channels, k] matrix when
        // read row-major.
        let filter_mat = filter.data_f32();

        for i in 0..g.batch {
            let in_slice = input.slice_dim0(i, i + 1)?;
            im2col(
                in_slice,
                g.channels,
                g.height,
                g.width,
                g.kernel_h,
                g.kernel_w,
                self.params.strides,
                self.params.paddings,
                g.out_h,
                g.out_w,
                col.matrix_mut(),
            )?;

            let out_slice = output.slice_dim0_mut(i, i + 1)?;
            backend.gemm(
                Transpose::No,
                Transpose::No,
                g.out_channels,
                n,
                k,
                1.0,
                filter_mat,
                k,
                col.matrix(),
                n,
                0.0,
                out_slice,
                n,
            )?;
        }
        Ok(())
    }

    /// Compute gradients with respect to input and filter.
    ///
    /// - `output_grad`: [batch, out_channels, out_h, out_w]
    /// - `input_grad` / `filter_grad`: caller-allocated, shaped like
    ///   `input` / `filter`; both are zeroed here and then accumulated
    ///   across the batch.
    ///
    /// The two multiplies of one batch item share the column workspace, so
    /// their order is fixed: the input-gradient path consumes the
    /// gradient-direction columns before im2col regenerates the workspace
    /// from the original input for the filter-gradient path.
    pub fn backward(
        &self,
        backend: &dyn GemmBackend,
        input: &Tensor,
        filter: &Tensor,
        output_grad: &Tensor,
        input_grad: &mut Tensor,
        filter_grad: &mut Tensor,
    ) -> Result<()> {
        self.params.validate()?;
        let g = Geometry::resolve(input, filter, output_grad)?;

        if input_grad.shape() != input.shape() {
            return Err(OpError::ShapeMismatch {
                name: "input_grad",
                expected: input.shape().dims().to_vec(),
                got: input_grad.shape().dims().to_vec(),
            });
        }
        if filter_grad.shape() != filter.shape() {
            return Err(OpError::ShapeMismatch {
                name: "filter_grad",
                expected: filter.shape().dims().to_vec(),
                got: filter_grad.shape().dims().to_vec(),
            });
        }

        let k = g.channels * g.kernel_h * g.kernel_w;
        let n = g.out_h * g.out_w;
        let mut col = ColBuffer::new(g.channels, g.kernel_h, g.kernel_w, g.out_h, g.out_w);

        let filter_mat = filter.data_f32();

        // Both gradients accumulate across batch items.
        input_grad.fill(0.0);
        filter_grad.fill(0.0);

        for i in 0..g.batch {
            let dout = output_grad.slice_dim0(i, i + 1)?;

            // Gradient-direction columns: filter^T [k, out_channels] times
            // the output-gradient slice [out_channels, n].
            backend.gemm(
                Transpose::Yes,
                Transpose::No,
                k,
                n,
                g.out_channels,
                1.0,
                filter_mat,
                k,
                dout,
                n,
                0.0,
                col.matrix_mut(),
                n,
            )?;

            let din = input_grad.slice_dim0_mut(i, i + 1)?;
            col2im(
                col.matrix(),
                g.channels,
                g.height,
                g.width,
                g.kernel_h,
                g.kernel_w,
                self.params.strides,
                self.params.paddings,
                g.out_h,
                g.out_w,
                din,
            )?;

            // Regenerate forward-direction columns from the original input;
            // nothing from the forward pass is cached.
            let in_slice = input.slice_dim0(i, i + 1)?;
            im2col(
                in_slice,
                g.channels,
                g.height,
                g.width,
                g.kernel_h,
                g.kernel_w,
                self.params.strides,
                self.params.paddings,
                g.out_h,
                g.out_w,
                col.matrix_mut(),
            )?;

            // filter_grad += dout [out_channels, n] times col^T [n, k].
            backend.gemm(
                Transpose::No,
                Transpose::Yes,
                g.out_channels,
                k,
                n,
                1.0,
                dout,
                n,
                col.matrix(),
                n,
                1.0,
                filter_grad.data_f32_mut(),
                k,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::conv2d_output_shape;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tc_tensor::{CpuBackend, Shape};

    fn backend() -> CpuBackend {
        CpuBackend::new()
    }

    fn random_tensor(rng: &mut StdRng, dims: Vec<usize>) -> Tensor {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor::new(data, Shape::new(dims))
    }

    /// Direct seven-loop convolution used as the oracle.
    fn direct_conv(
        input: &Tensor,
        filter: &Tensor,
        strides: [usize; 2],
        paddings: [usize; 2],
        out_h: usize,
        out_w: usize,
    ) -> Vec<f32> {
        let in_dims = input.shape().dims();
        let f_dims = filter.shape().dims();
        let (batch, channels, height, width) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
        let (out_channels, kernel_h, kernel_w) = (f_dims[0], f_dims[2], f_dims[3]);
        let x = input.data_f32();
        let w = filter.data_f32();

        let mut out = vec![0.0f32; batch * out_channels * out_h * out_w];
        for bi in 0..batch {
            for oc in 0..out_channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let mut sum = 0.0f32;
                        for c in 0..channels {
                            for kh in 0..kernel_h {
                                for kw in 0..kernel_w {
                                    let ih = (oh * strides[0] + kh) as isize - paddings[0] as isize;
                                    let iw = (ow * strides[1] + kw) as isize - paddings[1] as isize;
                                    if ih >= 0
                                        && (ih as usize) < height
                                        && iw >= 0
                                        && (iw as usize) < width
                                    {
                                        let x_idx = ((bi * channels + c) * height + ih as usize)
                                            * width
                                            + iw as usize;
                                        let w_idx =
                                            ((oc * channels + c) * kernel_h + kh) * kernel_w + kw;
                                        sum += x[x_idx] * w[w_idx];
                                    }
                                }
                            }
                        }
                        out[((bi * out_channels + oc) * out_h + oh) * out_w + ow] = sum;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_forward_textbook_case() {
        let conv = Conv2d::new(Conv2dParams::default());
        let input = Tensor::new(
            (1..=9).map(|v| v as f32).collect(),
            Shape::new(vec![1, 1, 3, 3]),
        );
        let filter = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 1, 2, 2]));
        let mut output = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));

        conv.forward(&backend(), &input, &filter, &mut output).unwrap();
        assert_eq!(output.data_f32(), &[37.0, 47.0, 67.0, 77.0]);
    }

    #[test]
    fn test_forward_matches_direct_conv() {
        let mut rng = StdRng::seed_from_u64(7);
        let conv = Conv2d::new(Conv2dParams {
            strides: [2, 1],
            paddings: [1, 1],
        });
        let input = random_tensor(&mut rng, vec![2, 3, 5, 4]);
        let filter = random_tensor(&mut rng, vec![4, 3, 3, 2]);
        let out_shape = conv2d_output_shape(
            input.shape().dims(),
            filter.shape().dims(),
            [2, 1],
            [1, 1],
        )
        .unwrap();
        let (out_h, out_w) = (out_shape.dim(2), out_shape.dim(3));
        let mut output = Tensor::zeros(out_shape);

        conv.forward(&backend(), &input, &filter, &mut output).unwrap();

        let expected = direct_conv(&input, &filter, [2, 1], [1, 1], out_h, out_w);
        for (got, want) in output.data_f32().iter().zip(&expected) {
            assert_relative_eq!(*got, *want, max_relative = 1e-5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_forward_batch_independence() {
        let mut rng = StdRng::seed_from_u64(11);
        let conv = Conv2d::new(Conv2dParams::default());
        let input = random_tensor(&mut rng, vec![2, 2, 4, 4]);
        let filter = random_tensor(&mut rng, vec![3, 2, 2, 2]);

        let mut batched = Tensor::zeros(Shape::new(vec![2, 3, 3, 3]));
        conv.forward(&backend(), &input, &filter, &mut batched).unwrap();

        for i in 0..2 {
            let single_in = Tensor::new(
                input.slice_dim0(i, i + 1).unwrap().to_vec(),
                Shape::new(vec![1, 2, 4, 4]),
            );
            let mut single_out = Tensor::zeros(Shape::new(vec![1, 3, 3, 3]));
            conv.forward(&backend(), &single_in, &filter, &mut single_out)
                .unwrap();
            assert_eq!(
                batched.slice_dim0(i, i + 1).unwrap(),
                single_out.data_f32()
            );
        }
    }

    #[test]
    fn test_backward_single_tap_filter() {
        // A 1x1 filter of weight 2 makes the gradients exact by hand:
        // input_grad = 2 * dout, filter_grad = sum(input * dout).
        let conv = Conv2d::new(Conv2dParams::default());
        let input = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 1, 2, 2]));
        let filter = Tensor::new(vec![2.0], Shape::new(vec![1, 1, 1, 1]));
        let output_grad = Tensor::ones(Shape::new(vec![1, 1, 2, 2]));

        let mut input_grad = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        let mut filter_grad = Tensor::zeros(Shape::new(vec![1, 1, 1, 1]));
        conv.backward(
            &backend(),
            &input,
            &filter,
            &output_grad,
            &mut input_grad,
            &mut filter_grad,
        )
        .unwrap();

        assert_eq!(input_grad.data_f32(), &[2.0, 2.0, 2.0, 2.0]);
        assert_eq!(filter_grad.data_f32(), &[10.0]);
    }

    fn loss(conv: &Conv2d, input: &Tensor, filter: &Tensor, out_shape: &Shape) -> f32 {
        let mut output = Tensor::zeros(out_shape.clone());
        conv.forward(&backend(), input, filter, &mut output).unwrap();
        output.data_f32().iter().sum()
    }

    fn check_gradients(params: Conv2dParams, input_dims: Vec<usize>, filter_dims: Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(23);
        let conv = Conv2d::new(params);
        let input = random_tensor(&mut rng, input_dims.clone());
        let filter = random_tensor(&mut rng, filter_dims.clone());
        let out_shape =
            conv2d_output_shape(&input_dims, &filter_dims, params.strides, params.paddings)
                .unwrap();

        // d(sum of outputs)/d(anything) uses an all-ones output gradient.
        let output_grad = Tensor::ones(out_shape.clone());
        let mut input_grad = Tensor::zeros(input.shape().clone());
        let mut filter_grad = Tensor::zeros(filter.shape().clone());
        conv.backward(
            &backend(),
            &input,
            &filter,
            &output_grad,
            &mut input_grad,
            &mut filter_grad,
        )
        .unwrap();

        let eps = 1e-2f32;
        for idx in 0..input.numel() {
            let mut plus = input.clone();
            plus.data_f32_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_f32_mut()[idx] -= eps;
            let numeric =
                (loss(&conv, &plus, &filter, &out_shape) - loss(&conv, &minus, &filter, &out_shape))
                    / (2.0 * eps);
            assert_relative_eq!(
                input_grad.data_f32()[idx],
                numeric,
                max_relative = 1e-2,
                epsilon = 1e-3
            );
        }
        for idx in 0..filter.numel() {
            let mut plus = filter.clone();
            plus.data_f32_mut()[idx] += eps;
            let mut minus = filter.clone();
            minus.data_f32_mut()[idx] -= eps;
            let numeric =
                (loss(&conv, &input, &plus, &out_shape) - loss(&conv, &input, &minus, &out_shape))
                    / (2.0 * eps);
            assert_relative_eq!(
                filter_grad.data_f32()[idx],
                numeric,
                max_relative = 1e-2,
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        check_gradients(
            Conv2dParams::default(),
            vec![1, 2, 3, 3],
            vec![2, 2, 2, 2],
        );
    }

    #[test]
    fn test_backward_matches_finite_differences_strided_padded() {
        check_gradients(
            Conv2dParams {
                strides: [2, 2],
                paddings: [1, 1],
            },
            vec![2, 1, 4, 4],
            vec![1, 1, 3, 3],
        );
    }

    #[test]
    fn test_backward_accumulates_over_batch() {
        let mut rng = StdRng::seed_from_u64(31);
        let conv = Conv2d::new(Conv2dParams::default());
        let input = random_tensor(&mut rng, vec![2, 1, 3, 3]);
        let filter = random_tensor(&mut rng, vec![1, 1, 2, 2]);
        let output_grad = random_tensor(&mut rng, vec![2, 1, 2, 2]);

        let mut input_grad = Tensor::zeros(Shape::new(vec![2, 1, 3, 3]));
        let mut filter_grad = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        conv.backward(
            &backend(),
            &input,
            &filter,
            &output_grad,
            &mut input_grad,
            &mut filter_grad,
        )
        .unwrap();

        // The filter gradient of the batch is the sum of per-item runs;
        // each input-gradient slice matches its own single-item run.
        let mut filter_grad_sum = vec![0.0f32; 4];
        for i in 0..2 {
            let single_in = Tensor::new(
                input.slice_dim0(i, i + 1).unwrap().to_vec(),
                Shape::new(vec![1, 1, 3, 3]),
            );
            let single_dout = Tensor::new(
                output_grad.slice_dim0(i, i + 1).unwrap().to_vec(),
                Shape::new(vec![1, 1, 2, 2]),
            );
            let mut single_din = Tensor::zeros(Shape::new(vec![1, 1, 3, 3]));
            let mut single_dw = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
            conv.backward(
                &backend(),
                &single_in,
                &filter,
                &single_dout,
                &mut single_din,
                &mut single_dw,
            )
            .unwrap();

            assert_eq!(
                input_grad.slice_dim0(i, i + 1).unwrap(),
                single_din.data_f32()
            );
            for (acc, v) in filter_grad_sum.iter_mut().zip(single_dw.data_f32()) {
                *acc += v;
            }
        }
        for (got, want) in filter_grad.data_f32().iter().zip(&filter_grad_sum) {
            assert_relative_eq!(*got, *want, max_relative = 1e-5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_forward_rejects_bad_shapes() {
        let conv = Conv2d::new(Conv2dParams::default());
        let be = backend();

        // Channel mismatch between input and filter.
        let input = Tensor::zeros(Shape::new(vec![1, 2, 3, 3]));
        let filter = Tensor::zeros(Shape::new(vec![1, 3, 2, 2]));
        let mut output = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        let err = conv.forward(&be, &input, &filter, &mut output).unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { name: "filter", .. }));

        // Output batch mismatch.
        let filter = Tensor::zeros(Shape::new(vec![1, 2, 2, 2]));
        let mut output = Tensor::zeros(Shape::new(vec![2, 1, 2, 2]));
        let err = conv.forward(&be, &input, &filter, &mut output).unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { name: "output", .. }));

        // Non-4d input.
        let input3 = Tensor::zeros(Shape::new(vec![2, 3, 3]));
        let mut output = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        let err = conv.forward(&be, &input3, &filter, &mut output).unwrap_err();
        assert!(matches!(err, OpError::BadRank { name: "input", .. }));
    }

    #[test]
    fn test_backward_rejects_mismatched_gradient_buffers() {
        let conv = Conv2d::new(Conv2dParams::default());
        let input = Tensor::zeros(Shape::new(vec![1, 1, 3, 3]));
        let filter = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        let output_grad = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));

        let mut input_grad = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        let mut filter_grad = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        let err = conv
            .backward(
                &backend(),
                &input,
                &filter,
                &output_grad,
                &mut input_grad,
                &mut filter_grad,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            OpError::ShapeMismatch {
                name: "input_grad",
                ..
            }
        ));
    }

    #[test]
    fn test_forward_through_device_handle() {
        use tc_tensor::{DeviceMatmul, DeviceOp, GpuBackend, Transpose as T};

        /// Handle that runs the multiply on the CPU path, standing in for a
        /// real device queue.
        #[derive(Debug)]
        struct LoopbackHandle(CpuBackend);

        impl DeviceMatmul for LoopbackHandle {
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
            ) -> tc_tensor::Result<()> {
                let to_t = |op: DeviceOp| match op {
                    DeviceOp::N => T::No,
                    DeviceOp::T => T::Yes,
                };
                self.0.gemm(
                    to_t(op_a),
                    to_t(op_b),
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

        let conv = Conv2d::new(Conv2dParams::default());
        let input = Tensor::new(
            (1..=9).map(|v| v as f32).collect(),
            Shape::new(vec![1, 1, 3, 3]),
        );
        let filter = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 1, 2, 2]));

        let gpu = GpuBackend::new(Box::new(LoopbackHandle(CpuBackend::new())));
        let mut gpu_out = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        conv.forward(&gpu, &input, &filter, &mut gpu_out).unwrap();

        let mut cpu_out = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        conv.forward(&backend(), &input, &filter, &mut cpu_out).unwrap();

        assert_eq!(gpu_out.data_f32(), cpu_out.data_f32());
    }
}
