//! The trainable building blocks of the autoencoder.
//!
//! Each layer implements its own derivative: `forward` caches what `backward`
//! needs, `backward` turns the gradient with respect to its output into the
//! gradient with respect to its input (storing parameter gradients on the
//! way), and `update` applies the stored parameter gradients.
mod conv_layer;
mod pool_layer;

pub use conv_layer::*;
pub use pool_layer::*;

use crate::{errors::LayerResult, optimizer::UpdateParams, FeatureBatch};
use serde_derive::{Deserialize, Serialize};

/// The capabilities the network needs from a layer.
pub trait Layer {
    /// Computes the output of the layer and caches what `backward` needs.
    fn forward(&mut self, data: &FeatureBatch) -> LayerResult<FeatureBatch>;
    /// Consumes the forward cache, returns the gradient with respect to the
    /// input of the last forward call.
    fn backward(&mut self, gradient: &FeatureBatch) -> LayerResult<FeatureBatch>;
    /// Applies the parameter gradients of the last backward call.
    fn update(&mut self, params: &UpdateParams) -> LayerResult<()>;
    /// Whether the layer sits in the decoding half of a network.
    fn is_decoder(&self) -> bool;
}

/// The closed set of layers a network is assembled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkLayer {
    Conv(ConvLayer),
    Pool(PoolLayer),
}

impl NetworkLayer {
    /// Returns the structurally dual layer, its initial weights drawn from `rng`.
    pub fn mirror_with_rng<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> LayerResult<NetworkLayer> {
        Ok(match self {
            NetworkLayer::Conv(layer) => NetworkLayer::Conv(layer.mirror_with_rng(rng)?),
            NetworkLayer::Pool(layer) => NetworkLayer::Pool(layer.mirror()),
        })
    }

    pub fn as_conv(&self) -> Option<&ConvLayer> {
        match self {
            NetworkLayer::Conv(layer) => Some(layer),
            NetworkLayer::Pool(_) => None,
        }
    }

    pub fn as_pool(&self) -> Option<&PoolLayer> {
        match self {
            NetworkLayer::Conv(_) => None,
            NetworkLayer::Pool(layer) => Some(layer),
        }
    }
}

impl Layer for NetworkLayer {
    fn forward(&mut self, data: &FeatureBatch) -> LayerResult<FeatureBatch> {
        match self {
            NetworkLayer::Conv(layer) => layer.forward(data),
            NetworkLayer::Pool(layer) => layer.forward(data),
        }
    }

    fn backward(&mut self, gradient: &FeatureBatch) -> LayerResult<FeatureBatch> {
        match self {
            NetworkLayer::Conv(layer) => layer.backward(gradient),
            NetworkLayer::Pool(layer) => layer.backward(gradient),
        }
    }

    fn update(&mut self, params: &UpdateParams) -> LayerResult<()> {
        match self {
            NetworkLayer::Conv(layer) => layer.update(params),
            NetworkLayer::Pool(layer) => layer.update(params),
        }
    }

    fn is_decoder(&self) -> bool {
        match self {
            NetworkLayer::Conv(layer) => layer.is_decoder(),
            NetworkLayer::Pool(layer) => layer.is_decoder(),
        }
    }
}

impl From<ConvLayer> for NetworkLayer {
    fn from(layer: ConvLayer) -> Self {
        NetworkLayer::Conv(layer)
    }
}

impl From<PoolLayer> for NetworkLayer {
    fn from(layer: PoolLayer) -> Self {
        NetworkLayer::Pool(layer)
    }
}
