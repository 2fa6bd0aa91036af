//! Image-to-column and column-to-image transforms.
//!
//! `im2col` gathers every convolution receptive field of a single
//! [channels, height, width] feature map into the columns of a
//! [channels * kernel_h * kernel_w, out_h * out_w] matrix. `col2im` is the
//! gradient-direction inverse: it scatter-accumulates such a matrix back
//! into an image-shaped buffer. Both use the zero-padding policy: reads
//! outside the input are taken as zero, writes outside the image are
//! discarded.

use crate::error::{OpError, Result};

#[allow(clippy::too_many_arguments)]
fn check_geometry(
    image_len: usize,
    channels: usize,
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
    strides: [usize; 2],
    out_h: usize,
    out_w: usize,
    col_len: usize,
) -> Result<()> {
    if strides[0] == 0 || strides[1] == 0 {
        return Err(OpError::BadParams(format!(
            "strides must be nonzero, got {:?}",
            strides
        )));
    }
    let expected_image = channels * height * width;
    if image_len != expected_image {
        return Err(OpError::BufferSize {
            name: "image",
            expected: expected_image,
            got: image_len,
        });
    }
    let expected_col = channels * kernel_h * kernel_w * out_h * out_w;
    if col_len != expected_col {
        return Err(OpError::BufferSize {
            name: "col",
            expected: expected_col,
            got: col_len,
        });
    }
    Ok(())
}

/// Gather convolution windows of `input` into the column matrix `col`.
///
/// `col[c, kh, kw, oh, ow] = input[c, oh*stride_h + kh - pad_h,
/// ow*stride_w + kw - pad_w]` when that coordinate lands inside the input,
/// else 0. Every element of `col` is written, so the buffer may start
/// uninitialized or stale.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    input: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
    strides: [usize; 2],
    paddings: [usize; 2],
    out_h: usize,
    out_w: usize,
    col: &mut [f32],
) -> Result<()> {
    check_geometry(
        input.len(),
        channels,
        height,
        width,
        kernel_h,
        kernel_w,
        strides,
        out_h,
        out_w,
        col.len(),
    )?;

    let [stride_h, stride_w] = strides;
    let [pad_h, pad_w] = paddings;
    let spatial = out_h * out_w;

    for c in 0..channels {
        let image = &input[c * height * width..(c + 1) * height * width];
        for kh in 0..kernel_h {
            for kw in 0..kernel_w {
                let row = (c * kernel_h + kh) * kernel_w + kw;
                let col_row = &mut col[row * spatial..(row + 1) * spatial];
                for oh in 0..out_h {
                    let ih = (oh * stride_h + kh) as isize - pad_h as isize;
                    for ow in 0..out_w {
                        let iw = (ow * stride_w + kw) as isize - pad_w as isize;
                        let in_bounds = ih >= 0
                            && (ih as usize) < height
                            && iw >= 0
                            && (iw as usize) < width;
                        col_row[oh * out_w + ow] = if in_bounds {
                            image[ih as usize * width + iw as usize]
                        } else {
                            0.0
                        };
                    }
                }
            }
        }
    }
    Ok(())
}

/// Scatter-accumulate the column matrix `col` back into `image_grad`.
///
/// `image_grad[c, oh*stride_h + kh - pad_h, ow*stride_w + kw - pad_w] +=
/// col[c, kh, kw, oh, ow]` for every in-bounds coordinate; contributions
/// that fall into the padding are discarded. This accumulates rather than
/// overwrites, so the caller zeroes `image_grad` once before folding a
/// batch into it.
#[allow(clippy::too_many_arguments)]
pub fn col2im(
    col: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
    strides: [usize; 2],
    paddings: [usize; 2],
    out_h: usize,
    out_w: usize,
    image_grad: &mut [f32],
) -> Result<()> {
    check_geometry(
        image_grad.len(),
        channels,
        height,
        width,
        kernel_h,
        kernel_w,
        strides,
        out_h,
        out_w,
        col.len(),
    )?;

    let [stride_h, stride_w] = strides;
    let [pad_h, pad_w] = paddings;
    let spatial = out_h * out_w;

    for c in 0..channels {
        let image = &mut image_grad[c * height * width..(c + 1) * height * width];
        for kh in 0..kernel_h {
            for kw in 0..kernel_w {
                let row = (c * kernel_h + kh) * kernel_w + kw;
                let col_row = &col[row * spatial..(row + 1) * spatial];
                for oh in 0..out_h {
                    let ih = (oh * stride_h + kh) as isize - pad_h as isize;
                    if ih < 0 || ih as usize >= height {
                        continue;
                    }
                    for ow in 0..out_w {
                        let iw = (ow * stride_w + kw) as isize - pad_w as isize;
                        if iw < 0 || iw as usize >= width {
                            continue;
                        }
                        image[ih as usize * width + iw as usize] += col_row[oh * out_w + ow];
                    }
                }
            }
        }
    }
    Ok(())
}
