//! Transposed convolutions (also wrongly called deconvolution layers)
//! are learnable upsampling maps. A strided transposed convolution is a
//! full convolution over the input with zeros inserted between its elements.
//! More can be read here:
//! - https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers
//! - https://theano-pymc.readthedocs.io/en/latest/tutorial/conv_arithmetic.html
use crate::{
    convolutions::{convolve, ConvMode},
    errors::LayerResult,
    FeatureBatch, ImagePrecision,
};
use ndarray::*;

/// Inserts `stride - 1` zeros between neighbouring elements of every plane.
///
/// A plane of size (m, n) becomes ((m - 1) * s0 + 1, (n - 1) * s1 + 1), i.e.
/// the trailing zeros of a Kronecker expansion with an impulse are clipped.
pub fn stride_upsample<'a, V>(data: V, stride: (usize, usize)) -> FeatureBatch
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let (n, c, h, w) = data.dim();
    if stride == (1, 1) {
        return data.to_owned();
    }

    let mut upsampled = Array4::zeros((
        n,
        c,
        upsampled_len(h, stride.0),
        upsampled_len(w, stride.1),
    ));
    upsampled
        .slice_mut(s![.., .., ..;stride.0, ..;stride.1])
        .assign(&data);
    upsampled
}

fn upsampled_len(len: usize, stride: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len - 1) * stride + 1
    }
}

/// Performs a transposed convolution on the input batch. This upsamples the
/// planes to (H - 1) * stride + HH.
pub fn transposed_convolve<'a, 'b, V, T>(
    data: V,
    kernel: T,
    stride: (usize, usize),
) -> LayerResult<FeatureBatch>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
    T: AsArray<'b, ImagePrecision, Ix4>,
{
    convolve(&stride_upsample(data, stride), kernel, ConvMode::Full, (1, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_upsample() {
        let data = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();
        let upsampled = stride_upsample(&data, (2, 2));
        let expected = Array::from_shape_vec(
            (1, 1, 3, 3),
            vec![1., 0., 2., 0., 0., 0., 3., 0., 4.],
        )
        .unwrap();
        assert_eq!(upsampled, expected);
    }

    #[test]
    fn test_stride_upsample_shapes() {
        let data = Array4::<f32>::ones((2, 3, 3, 8));
        assert_eq!(stride_upsample(&data, (3, 3)).dim(), (2, 3, 7, 22));
        assert_eq!(stride_upsample(&data, (1, 2)).dim(), (2, 3, 3, 15));
        assert_eq!(stride_upsample(&data, (1, 1)), data);
        // zeros only add, never remove mass
        assert_eq!(stride_upsample(&data, (3, 2)).sum(), data.sum());
    }

    #[test]
    fn test_2d_conv_t() {
        let test_img = Array::from_shape_vec((1, 1, 2, 2), vec![55.0, 52.0, 57.0, 50.0]).unwrap();
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();

        let convolved_image = transposed_convolve(&test_img, &kernel, (1, 1)).unwrap();
        let output = Array::from_shape_vec(
            (1, 1, 3, 3),
            vec![55.0, 162.0, 104.0, 222.0, 540.0, 308.0, 171.0, 378.0, 200.0],
        )
        .unwrap();
        assert_eq!(convolved_image, output);
    }

    #[test]
    fn test_strided_conv_t_shape() {
        let codes = Array4::<f32>::zeros((4, 6, 8, 8));
        let kernel = Array4::<f32>::zeros((1, 6, 7, 7));
        let decoded = transposed_convolve(&codes, &kernel, (3, 3)).unwrap();
        assert_eq!(decoded.dim(), (4, 1, 28, 28));
    }
}
