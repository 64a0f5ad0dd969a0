pub mod activation_functions;
pub mod config;
pub mod convolutions;
pub mod dataset;
pub mod errors;
pub mod layers;
pub mod models;
pub mod optimizer;
pub mod pooling;
pub mod training;
pub mod transposed_convolutions;

use ndarray::{Array3, Array4};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Batch of feature planes, indexed (sample, channel, row, column).
pub type FeatureBatch = Array4<ImagePrecision>;
/// Kernel bank, indexed (output feature, input channel, row, column).
pub type ConvKernel = Array4<WeightPrecision>;
/// One bias per output feature, shaped (features, 1, 1) to broadcast over planes.
pub type ConvBias = Array3<WeightPrecision>;
