//! Pooling over non-overlapping windows and the block operations used to
//! route gradients through it.
use crate::{
    errors::{LayerError, LayerResult},
    FeatureBatch, ImagePrecision,
};
use log::debug;
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

/// Added to the input before dividing by it in [`pool_positions`].
pub const POSITION_EPSILON: ImagePrecision = 1e-10;

/// Reduction applied to every pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Avg,
    Max,
}

/// Reduces every `factor` sized window of each plane to its maximum or mean.
///
/// Fails if a spatial dimension is not divisible by its factor.
pub fn pool<'a, V>(data: V, factor: (usize, usize), mode: PoolMode) -> LayerResult<FeatureBatch>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    match mode {
        PoolMode::Max => {
            let data: ArrayView4<ImagePrecision> = data.into();
            let standard = data.as_standard_layout();
            let blocks = into_blocks(standard.view(), factor)?;
            Ok(blocks
                .fold_axis(Axis(5), ImagePrecision::NEG_INFINITY, |&a, &b| a.max(b))
                .fold_axis(Axis(3), ImagePrecision::NEG_INFINITY, |&a, &b| a.max(b)))
        }
        PoolMode::Avg => Ok(block_sum(data, factor)? / window_size(factor) as ImagePrecision),
    }
}

/// Views a batch as (N, C, H / f0, f0, W / f1, f1) blocks.
fn into_blocks(
    data: ArrayView4<'_, ImagePrecision>,
    factor: (usize, usize),
) -> LayerResult<ArrayView6<'_, ImagePrecision>> {
    let (n, c, h, w) = data.dim();
    check_divisible((h, w), factor)?;
    Ok(data.into_shape((n, c, h / factor.0, factor.0, w / factor.1, factor.1))?)
}

/// Replicates every element into a `factor` sized block (a Kronecker product
/// with a block of ones).
pub fn expand<'a, V>(data: V, factor: (usize, usize)) -> FeatureBatch
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let (n, c, h, w) = data.dim();

    let mut expanded = Array4::zeros((n, c, h * factor.0, w * factor.1));
    for i in 0..factor.0 {
        for j in 0..factor.1 {
            expanded
                .slice_mut(s![.., .., i..;factor.0, j..;factor.1])
                .assign(&data);
        }
    }
    expanded
}

/// Sums every `factor` sized block, the adjoint of [`expand`].
pub fn block_sum<'a, V>(data: V, factor: (usize, usize)) -> LayerResult<FeatureBatch>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let standard = data.as_standard_layout();
    let blocks = into_blocks(standard.view(), factor)?;
    Ok(blocks.sum_axis(Axis(5)).sum_axis(Axis(3)))
}

/// Approximates the positions of the window maxima.
///
/// Every element that is not the maximum of its window is set to zero (a
/// same size max pool) and the result is divided by the input, both shifted
/// by [`POSITION_EPSILON`]. This yields 1 at the maximum and 0 elsewhere;
/// tied maxima all receive 1. NaN and infinite quotients are replaced by 0.
pub fn pool_positions<'a, V>(data: V, factor: (usize, usize)) -> LayerResult<FeatureBatch>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let pooled = pool(data, factor, PoolMode::Max)?;
    Ok(positions_from_pooled(data, &pooled, factor))
}

/// Same as [`pool_positions`] for an already max pooled batch.
pub(crate) fn positions_from_pooled(
    data: ArrayView4<ImagePrecision>,
    pooled: &FeatureBatch,
    factor: (usize, usize),
) -> FeatureBatch {
    let maxima = expand(pooled, factor);
    let mut positions = Zip::from(data).and(&maxima).map_collect(|&x, &max| {
        let shifted = x + POSITION_EPSILON;
        let same_size_max = if x == max { shifted } else { 0. };
        same_size_max / shifted
    });

    let anomalies = zero_non_finite(&mut positions);
    if anomalies > 0 {
        debug!(
            "Replaced {} non-finite pooling positions with 0 (inputs close to -{}).",
            anomalies, POSITION_EPSILON
        );
    }
    positions
}

/// Sets NaN and infinite entries to 0 and returns how many there were.
pub(crate) fn zero_non_finite<D: Dimension>(data: &mut Array<ImagePrecision, D>) -> usize {
    let mut replaced = 0;
    data.map_inplace(|x| {
        if !x.is_finite() {
            *x = 0.;
            replaced += 1;
        }
    });
    replaced
}

pub(crate) fn window_size(factor: (usize, usize)) -> usize {
    factor.0 * factor.1
}

fn check_divisible(size: (usize, usize), factor: (usize, usize)) -> LayerResult<()> {
    if factor.0 == 0 || factor.1 == 0 {
        return Err(LayerError::InvalidParameter(format!(
            "pooling factor must be positive, got {:?}",
            factor
        )));
    }
    if size.0 % factor.0 != 0 || size.1 % factor.1 != 0 {
        return Err(LayerError::ShapeError(format!(
            "planes of size {}x{} are not divisible by the pooling factor {:?}",
            size.0, size.1, factor
        )));
    }
    Ok(())
}
