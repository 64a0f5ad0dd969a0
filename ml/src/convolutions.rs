//! Batched 2d convolutions and the plane manipulations needed to express
//! their gradients as convolutions again.
//!
//! All functions work on 4d arrays in Pytorch layout, i.e.
//! (samples, channels, height, width) for data and
//! (output channels, input channels, kernel height, kernel width) for kernels.
//! The convolution is a true convolution (the kernel is flipped), a
//! correlation is obtained by passing a kernel through [`rotate180`] first.
use crate::{
    errors::{LayerError, LayerResult},
    FeatureBatch, ImagePrecision,
};
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

/// Border handling of [`convolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvMode {
    /// Output only where the kernel fully overlaps the input.
    Valid,
    /// Implicit zero padding, every partial overlap contributes.
    Full,
}

/// Convolves every sample of `data` with the kernel bank.
///
/// Output shape is (N, Cout, H', W') with H' = H - kh + 1 for `Valid` and
/// H' = H + kh - 1 for `Full`, afterwards subsampled by `stride`
/// (positions 0, s, 2s, ... of the dense result are kept).
///
/// We use the im2col technique described here:
/// <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
pub fn convolve<'a, 'b, V, T>(
    data: V,
    kernel: T,
    mode: ConvMode,
    stride: (usize, usize),
) -> LayerResult<FeatureBatch>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
    T: AsArray<'b, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let kernel: ArrayView4<ImagePrecision> = kernel.into();

    let (num_samples, im_channels, _, _) = data.dim();
    let (num_filters, kernel_channels, kernel_height, kernel_width) = kernel.dim();

    if im_channels != kernel_channels {
        return Err(LayerError::ChannelMismatch {
            expected: kernel_channels,
            found: im_channels,
        });
    }
    if stride.0 == 0 || stride.1 == 0 {
        return Err(LayerError::InvalidParameter(format!(
            "stride must be positive, got {:?}",
            stride
        )));
    }
    if kernel_height == 0 || kernel_width == 0 {
        return Err(LayerError::InvalidParameter(
            "kernel planes must not be empty".to_string(),
        ));
    }

    let padded;
    let input = match mode {
        ConvMode::Valid => data.view(),
        ConvMode::Full => {
            padded = pad_spatial(data, (kernel_height - 1, kernel_width - 1));
            padded.view()
        }
    };

    let im_height = input.len_of(Axis(2));
    let im_width = input.len_of(Axis(3));
    if im_height < kernel_height || im_width < kernel_width {
        return Err(LayerError::ShapeError(format!(
            "kernel of size {}x{} does not fit into planes of size {}x{}",
            kernel_height, kernel_width, im_height, im_width
        )));
    }

    let new_im_height = (im_height - kernel_height) / stride.0 + 1;
    let new_im_width = (im_width - kernel_width) / stride.1 + 1;

    // weights.reshape(F, C*HH*WW), flipped so the product below convolves
    let filter_col = rotate180(kernel).into_shape((
        num_filters,
        kernel_channels * kernel_height * kernel_width,
    ))?;

    let mut output = Array4::zeros((num_samples, num_filters, new_im_height, new_im_width));
    for (sample, mut out) in input.outer_iter().zip(output.outer_iter_mut()) {
        let im_col = im2col(
            sample,
            (kernel_height, kernel_width),
            (new_im_height, new_im_width),
            stride,
        )?;
        let mul = filter_col.dot(&im_col);
        out.assign(&mul.into_shape((num_filters, new_im_height, new_im_width))?);
    }
    Ok(output)
}

/// Unrolls the receptive fields of one sample into a matrix of shape
/// (C*HH*WW, H'*W'). Row order matches a (F, C, HH, WW) kernel flattened in
/// standard layout.
fn im2col(
    sample: ArrayView3<ImagePrecision>,
    kernel_size: (usize, usize),
    output_size: (usize, usize),
    stride: (usize, usize),
) -> LayerResult<Array2<ImagePrecision>> {
    let (ker_height, ker_width) = kernel_size;
    let (new_h, new_w) = output_size;
    let im_channels = sample.len_of(Axis(0));

    let mut img_matrix = Array2::zeros((im_channels * ker_height * ker_width, new_h * new_w));
    for c in 0..im_channels {
        for i in 0..ker_height {
            for j in 0..ker_width {
                let patch = sample.slice(s![
                    c,
                    i..i + (new_h - 1) * stride.0 + 1;stride.0,
                    j..j + (new_w - 1) * stride.1 + 1;stride.1
                ]);
                let row = (c * ker_height + i) * ker_width + j;
                img_matrix
                    .row_mut(row)
                    .into_shape((new_h, new_w))?
                    .assign(&patch);
            }
        }
    }
    Ok(img_matrix)
}

/// Rotates every (sample, channel) plane by 180 degrees.
pub fn rotate180<'a, V>(data: V) -> Array4<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    data.slice(s![.., .., ..;-1, ..;-1])
        .as_standard_layout()
        .into_owned()
}

/// Exchanges the first two axes, so that samples become channels and vice versa.
pub fn swap_batch_channels<'a, V>(data: V) -> Array4<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    data.permuted_axes([1, 0, 2, 3])
        .as_standard_layout()
        .into_owned()
}

/// Surrounds every plane with `padding.0` rows of zeros at the top and bottom
/// and `padding.1` columns at the left and right.
pub fn pad_spatial<'a, V>(data: V, padding: (usize, usize)) -> Array4<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let (n, c, h, w) = data.dim();
    let (pad_h, pad_w) = padding;

    let mut padded = Array4::zeros((n, c, h + 2 * pad_h, w + 2 * pad_w));
    padded
        .slice_mut(s![.., .., pad_h..pad_h + h, pad_w..pad_w + w])
        .assign(&data);
    padded
}

/// Appends zero rows and columns at the bottom/right until the planes have
/// the requested size.
pub fn pad_trailing<'a, V>(data: V, size: (usize, usize)) -> LayerResult<Array4<ImagePrecision>>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let (n, c, h, w) = data.dim();
    if size.0 < h || size.1 < w {
        return Err(LayerError::ShapeError(format!(
            "cannot pad planes of size {}x{} to the smaller size {}x{}",
            h, w, size.0, size.1
        )));
    }

    let mut padded = Array4::zeros((n, c, size.0, size.1));
    padded.slice_mut(s![.., .., ..h, ..w]).assign(&data);
    Ok(padded)
}
