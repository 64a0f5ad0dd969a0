use crate::{
    errors::{LayerError, LayerResult},
    layers::Layer,
    optimizer::UpdateParams,
    pooling::{block_sum, expand, pool, positions_from_pooled, window_size, PoolMode},
    FeatureBatch, ImagePrecision,
};
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

/// Pooling layer without learnable parameters.
///
/// Encoding layers shrink the planes by `factor`, decoding layers grow them
/// by the same factor (forward and backward swap roles).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolLayer {
    factor: (usize, usize),
    mode: PoolMode,
    decode: bool,
    #[serde(skip)]
    cache: Option<PoolCache>,
}

#[derive(Debug, Clone)]
struct PoolCache {
    output_dim: Ix4,
    /// Routing mask of the maxima, only for encoding max pooling.
    positions: Option<FeatureBatch>,
}

impl PoolLayer {
    pub fn new(factor: (usize, usize), mode: PoolMode) -> LayerResult<PoolLayer> {
        if factor.0 == 0 || factor.1 == 0 {
            return Err(LayerError::InvalidParameter(format!(
                "pooling factor must be positive, got {:?}",
                factor
            )));
        }
        Ok(PoolLayer {
            factor,
            mode,
            decode: false,
            cache: None,
        })
    }

    /// Returns the dual layer: same factor and mode, opposite direction.
    pub fn mirror(&self) -> PoolLayer {
        PoolLayer {
            factor: self.factor,
            mode: self.mode,
            decode: !self.decode,
            cache: None,
        }
    }

    pub fn factor(&self) -> (usize, usize) {
        self.factor
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// The routing mask cached by the last encoding max pool forward pass.
    pub fn positions(&self) -> Option<&FeatureBatch> {
        self.cache.as_ref().and_then(|cache| cache.positions.as_ref())
    }

    fn scale(&self) -> ImagePrecision {
        match self.mode {
            PoolMode::Avg => 1. / window_size(self.factor) as ImagePrecision,
            PoolMode::Max => 1.,
        }
    }
}

impl Layer for PoolLayer {
    fn forward(&mut self, data: &FeatureBatch) -> LayerResult<FeatureBatch> {
        let (output, positions) = if self.decode {
            (expand(data, self.factor) * self.scale(), None)
        } else {
            match self.mode {
                PoolMode::Avg => (pool(data, self.factor, PoolMode::Avg)?, None),
                PoolMode::Max => {
                    let pooled = pool(data, self.factor, PoolMode::Max)?;
                    let positions = positions_from_pooled(data.view(), &pooled, self.factor);
                    (pooled, Some(positions))
                }
            }
        };

        self.cache = Some(PoolCache {
            output_dim: output.raw_dim(),
            positions,
        });
        Ok(output)
    }

    fn backward(&mut self, gradient: &FeatureBatch) -> LayerResult<FeatureBatch> {
        let cache = self.cache.take().ok_or_else(|| {
            LayerError::StateError("pooling backward pass without a preceding forward pass".into())
        })?;
        if gradient.raw_dim() != cache.output_dim {
            return Err(LayerError::ShapeError(format!(
                "pooling layer produced {:?} but received a gradient of shape {:?}",
                cache.output_dim.slice(),
                gradient.shape()
            )));
        }

        if self.decode {
            return Ok(block_sum(gradient, self.factor)? * self.scale());
        }
        match cache.positions {
            Some(positions) => Ok(expand(gradient, self.factor) * &positions),
            None => Ok(expand(gradient, self.factor) * self.scale()),
        }
    }

    fn update(&mut self, _params: &UpdateParams) -> LayerResult<()> {
        Ok(())
    }

    fn is_decoder(&self) -> bool {
        self.decode
    }
}
