//! This module provides the nonlinearities of the convolutional layers,
//! namely relu, tanh and the logistic sigmoid, together with their
//! derivatives.
//!
//! All activation functions are exposed as free functions over arrays of any
//! dimension as well as through the [`Activation`] enum the layers store.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

use crate::{errors::LayerError, ImagePrecision};

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Logistic sigmoid 1 / (1 + exp(-x))
pub fn sigmoid<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| 1. / (1. + (-x).exp()))
}

/// Squared hyperbolic secant, the derivative of tanh.
pub fn sech2<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| (1. / x.cosh()).powi(2))
}

/// Nonlinearity applied after the convolution of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    /// Applies the nonlinearity to the pre-activation sum.
    pub fn activate<D: Dimension>(
        &self,
        pre_activation: &Array<ImagePrecision, D>,
    ) -> Array<ImagePrecision, D> {
        match self {
            Activation::Relu => relu(pre_activation),
            Activation::Tanh => pre_activation.mapv(|x| x.tanh()),
            Activation::Sigmoid => sigmoid(pre_activation),
        }
    }

    /// Derivative of the nonlinearity, evaluated at the pre-activation sum.
    /// The relu derivative at 0 is taken as 0.
    pub fn derivative<D: Dimension>(
        &self,
        pre_activation: &Array<ImagePrecision, D>,
    ) -> Array<ImagePrecision, D> {
        match self {
            Activation::Relu => pre_activation.mapv(|x| if x > 0. { 1. } else { 0. }),
            Activation::Tanh => sech2(pre_activation),
            Activation::Sigmoid => sigmoid(pre_activation).mapv(|s| s * (1. - s)),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Relu
    }
}

impl FromStr for Activation {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(LayerError::InvalidParameter(format!(
                "unknown activation '{}', expected relu, tanh or sigmoid",
                other
            ))),
        }
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
        };
        write!(f, "{}", name)
    }
}
