//! The convolutional autoencoder: an encoder stack and its mirrored decoder.
use crate::{
    config::TrainingParams,
    errors::{LayerError, LayerResult},
    layers::{Layer, NetworkLayer},
    ConvKernel, FeatureBatch, ImagePrecision,
};
use log::{debug, info};
use ndarray::*;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Model file not accessible. Filesystem reported error\n {0}.")]
    Io(#[from] std::io::Error),
    #[error("Model could not be (de)serialized:\n {0}.")]
    Encoding(#[from] bincode::Error),
    #[error(transparent)]
    Layer(#[from] LayerError),
}

/// Autoencoder assembled from a list of encoder layers.
///
/// The layers are stored in execution order: the encoder layers (input
/// facing first) followed by their mirrors in reverse order, so the last
/// decoder layer is the mirror of the first encoder layer and produces
/// images of the input shape again.
///
/// Images enter and leave the network as (sample, row, column, channel)
/// batches; internally all layers work on (sample, channel, row, column).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvAutoEncoder {
    layers: Vec<NetworkLayer>,
    encode_index: usize,
}

impl ConvAutoEncoder {
    pub fn new(encoder_layers: Vec<NetworkLayer>) -> LayerResult<ConvAutoEncoder> {
        ConvAutoEncoder::with_rng(encoder_layers, &mut rand::thread_rng())
    }

    /// Builds the network, drawing the initial decoder weights from `rng`.
    /// An empty list gives an empty network that can only be filled by
    /// [`ConvAutoEncoder::load_state`].
    pub fn with_rng<R: Rng + ?Sized>(
        encoder_layers: Vec<NetworkLayer>,
        rng: &mut R,
    ) -> LayerResult<ConvAutoEncoder> {
        let mut mirrors = Vec::with_capacity(encoder_layers.len());
        for layer in encoder_layers.iter().rev() {
            if layer.is_decoder() {
                return Err(LayerError::InvalidParameter(
                    "encoder layers must not be decoding layers".to_string(),
                ));
            }
            mirrors.push(layer.mirror_with_rng(&mut *rng)?);
        }

        let encode_index = encoder_layers.len();
        let mut layers = encoder_layers;
        layers.extend(mirrors);
        debug!(
            "Built autoencoder with {} encoding and {} decoding layers",
            encode_index,
            layers.len() - encode_index
        );
        Ok(ConvAutoEncoder {
            layers,
            encode_index,
        })
    }

    /// Runs a batch of images through encoder and decoder.
    pub fn reconstruct<'a, V>(&mut self, images: V) -> LayerResult<Array4<ImagePrecision>>
    where
        V: AsArray<'a, ImagePrecision, Ix4>,
    {
        let images: ArrayView4<ImagePrecision> = images.into();
        self.ensure_layers()?;

        let mut data = to_planes(images);
        for layer in self.layers.iter_mut() {
            data = layer.forward(&data)?;
        }

        let reconstruction = to_images(data);
        if reconstruction.dim() != images.dim() {
            return Err(LayerError::ShapeError(format!(
                "reconstruction has shape {:?}, input has shape {:?}",
                reconstruction.shape(),
                images.shape()
            )));
        }
        Ok(reconstruction)
    }

    /// Propagates the gradient of the error with respect to the last
    /// reconstruction back through all layers, storing the parameter
    /// gradients. Returns the gradient with respect to the input images.
    pub fn backprop<'a, V>(&mut self, errors: V) -> LayerResult<Array4<ImagePrecision>>
    where
        V: AsArray<'a, ImagePrecision, Ix4>,
    {
        self.ensure_layers()?;

        let mut gradient = to_planes(errors.into());
        for layer in self.layers.iter_mut().rev() {
            gradient = layer.backward(&gradient)?;
        }
        Ok(to_images(gradient))
    }

    /// Applies the stored gradients with the learning rates decayed for
    /// `iteration`.
    pub fn update(&mut self, params: &TrainingParams, iteration: usize) -> LayerResult<()> {
        self.ensure_layers()?;

        let update_params = params.update_params(iteration);
        for layer in self.layers.iter_mut() {
            layer.update(&update_params)?;
        }
        Ok(())
    }

    /// Runs the encoding half only and returns the codes as
    /// (sample, channel, row, column) planes.
    pub fn encode<'a, V>(&mut self, images: V) -> LayerResult<FeatureBatch>
    where
        V: AsArray<'a, ImagePrecision, Ix4>,
    {
        self.ensure_layers()?;

        let mut data = to_planes(images.into());
        for layer in self.layers[..self.encode_index].iter_mut() {
            data = layer.forward(&data)?;
        }
        Ok(data)
    }

    /// Runs the decoding half only on codes produced by [`ConvAutoEncoder::encode`].
    pub fn decode(&mut self, codes: &FeatureBatch) -> LayerResult<Array4<ImagePrecision>> {
        self.ensure_layers()?;

        let mut data = codes.clone();
        for layer in self.layers[self.encode_index..].iter_mut() {
            data = layer.forward(&data)?;
        }
        Ok(to_images(data))
    }

    pub fn layers(&self) -> &[NetworkLayer] {
        &self.layers
    }

    /// Number of encoding layers, the position of the first decoding layer.
    pub fn encode_index(&self) -> usize {
        self.encode_index
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Kernel bank of the convolution closest to the input images.
    pub fn input_kernels(&self) -> Option<&ConvKernel> {
        self.layers[..self.encode_index]
            .iter()
            .find_map(|layer| layer.as_conv())
            .map(|conv| conv.kernels())
    }

    /// Moves the layers of `other` into this network. Only an empty network
    /// can be populated.
    pub fn load_state(&mut self, other: ConvAutoEncoder) -> LayerResult<()> {
        if !self.is_empty() {
            return Err(LayerError::StateError(
                "refusing to overwrite the layers of a non-empty network".to_string(),
            ));
        }
        if other.encode_index > other.layers.len() {
            return Err(LayerError::StateError(format!(
                "encode index {} is out of bounds for {} layers",
                other.encode_index,
                other.layers.len()
            )));
        }
        *self = other;
        Ok(())
    }

    pub fn to_bytes(&self) -> PersistenceResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> PersistenceResult<ConvAutoEncoder> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> PersistenceResult<()> {
        let bytes = self.to_bytes()?;
        fs::write(&path, &bytes)?;
        info!(
            "Saved model with {} layers ({} bytes) to {}",
            self.layers.len(),
            bytes.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Reads a saved model into this network, which has to be empty.
    pub fn load_model<P: AsRef<Path>>(&mut self, path: P) -> PersistenceResult<()> {
        let bytes = fs::read(&path)?;
        let model = ConvAutoEncoder::from_bytes(&bytes)?;
        self.load_state(model)?;
        info!(
            "Loaded model with {} layers from {}",
            self.layers.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    fn ensure_layers(&self) -> LayerResult<()> {
        if self.layers.is_empty() {
            Err(LayerError::EmptyNetwork)
        } else {
            Ok(())
        }
    }
}

/// (sample, row, column, channel) -> (sample, channel, row, column)
fn to_planes(images: ArrayView4<ImagePrecision>) -> FeatureBatch {
    images
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned()
}

/// (sample, channel, row, column) -> (sample, row, column, channel)
fn to_images(planes: FeatureBatch) -> Array4<ImagePrecision> {
    planes
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activation_functions::Activation,
        layers::{ConvLayer, ConvLayerConfig, PoolLayer},
        pooling::PoolMode,
    };
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::tempdir;

    fn images(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array::from_shape_fn(shape, |(n, i, j, c)| {
            (((n * 31 + i * 7 + j * 3 + c) % 17) as f32) / 17.
        })
    }

    fn mnist_network(rng: &mut StdRng) -> ConvAutoEncoder {
        let encoder = vec![
            ConvLayer::with_rng(ConvLayerConfig::new(6, 1, (7, 7), 3), rng)
                .unwrap()
                .into(),
            PoolLayer::new((2, 2), PoolMode::Max).unwrap().into(),
        ];
        ConvAutoEncoder::with_rng(encoder, rng).unwrap()
    }

    #[test]
    fn test_reconstruct_mnist_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut network = mnist_network(&mut rng);
        let batch = images((5, 28, 28, 1));

        let reconstruction = network.reconstruct(&batch).unwrap();
        assert_eq!(reconstruction.dim(), batch.dim());

        let codes = network.encode(&batch).unwrap();
        assert_eq!(codes.dim(), (5, 6, 4, 4));
        assert_eq!(network.decode(&codes).unwrap().dim(), batch.dim());
    }

    #[test]
    fn test_reconstruct_faces_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = vec![
            ConvLayer::with_rng(
                ConvLayerConfig::new(6, 1, (3, 3), 1).activation(Activation::Tanh),
                &mut rng,
            )
            .unwrap()
            .into(),
            PoolLayer::new((2, 2), PoolMode::Max).unwrap().into(),
        ];
        let mut network = ConvAutoEncoder::with_rng(encoder, &mut rng).unwrap();
        let batch = images((3, 32, 32, 1));

        let reconstruction = network.reconstruct(&batch).unwrap();
        assert_eq!(reconstruction.dim(), batch.dim());
        let gradient = network.backprop(&(&reconstruction - &batch)).unwrap();
        assert_eq!(gradient.dim(), batch.dim());
    }

    #[test]
    fn test_layer_order_mirrors_encoder() {
        let mut rng = StdRng::seed_from_u64(2);
        let network = mnist_network(&mut rng);

        assert_eq!(network.encode_index(), 2);
        let layers = network.layers();
        assert_eq!(layers.len(), 4);
        assert!(!layers[0].is_decoder() && !layers[1].is_decoder());
        assert!(layers[2].is_decoder() && layers[3].is_decoder());

        assert_eq!(layers[2].as_pool().unwrap().factor(), (2, 2));
        assert_eq!(layers[2].as_pool().unwrap().mode(), PoolMode::Max);
        let decoder_conv = layers[3].as_conv().unwrap();
        assert_eq!(decoder_conv.kernels().dim(), (1, 6, 7, 7));
        assert_eq!(decoder_conv.stride(), (3, 3));

        assert_eq!(network.input_kernels().unwrap().dim(), (6, 1, 7, 7));
    }

    #[test]
    fn test_encoder_list_starts_at_the_input() {
        let mut rng = StdRng::seed_from_u64(3);
        let encoder = vec![
            PoolLayer::new((2, 2), PoolMode::Max).unwrap().into(),
            ConvLayer::with_rng(ConvLayerConfig::new(6, 1, (7, 7), 3), &mut rng)
                .unwrap()
                .into(),
        ];
        let mut network = ConvAutoEncoder::with_rng(encoder, &mut rng).unwrap();

        // pooling first leaves 14x14 planes, the strided 7x7 decoder grows them back to 26x26
        assert!(matches!(
            network.reconstruct(&images((2, 28, 28, 1))),
            Err(LayerError::ShapeError(_))
        ));
    }

    #[test]
    fn test_empty_network() {
        let mut network = ConvAutoEncoder::new(vec![]).unwrap();
        assert!(network.is_empty());
        assert!(network.input_kernels().is_none());

        let batch = images((1, 4, 4, 1));
        assert!(matches!(
            network.reconstruct(&batch),
            Err(LayerError::EmptyNetwork)
        ));
        assert!(matches!(
            network.backprop(&batch),
            Err(LayerError::EmptyNetwork)
        ));
    }

    #[test]
    fn test_backprop_requires_reconstruct() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut network = mnist_network(&mut rng);
        assert!(matches!(
            network.backprop(&images((2, 28, 28, 1))),
            Err(LayerError::StateError(_))
        ));
    }

    #[test]
    fn test_training_reduces_error() {
        let mut rng = StdRng::seed_from_u64(4);
        let encoder = vec![ConvLayer::with_rng(
            ConvLayerConfig::new(4, 1, (3, 3), 1)
                .activation(Activation::Tanh)
                .init(0.1, 0.),
            &mut rng,
        )
        .unwrap()
        .into()];
        let mut network = ConvAutoEncoder::with_rng(encoder, &mut rng).unwrap();
        let params = TrainingParams {
            eps_w: 0.01,
            eps_b: 0.01,
            eps_intvl: 0,
            mu: 0.5,
            l2: 0.,
            rms_prop: false,
            ..Default::default()
        };
        let batch = images((4, 8, 8, 1)).mapv(|v| v - 0.5);
        let mse = |network: &mut ConvAutoEncoder| {
            let error = network.reconstruct(&batch).unwrap() - &batch;
            error.mapv(|e| e * e).mean().unwrap()
        };

        let before = mse(&mut network);
        for iteration in 0..100 {
            let error = network.reconstruct(&batch).unwrap() - &batch;
            network.backprop(&error).unwrap();
            network.update(&params, iteration).unwrap();
        }
        assert!(mse(&mut network) < before);
    }

    #[test]
    fn test_persistence_round_trip() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut network = mnist_network(&mut rng);
        let batch = images((2, 28, 28, 1));
        let params = TrainingParams::default();

        let error = network.reconstruct(&batch).unwrap() - &batch;
        network.backprop(&error).unwrap();
        network.update(&params, 0).unwrap();
        let expected = network.reconstruct(&batch).unwrap();

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.bin");
        network.save_model(&file_path).unwrap();

        let mut loaded = ConvAutoEncoder::default();
        loaded.load_model(&file_path).unwrap();
        assert_eq!(loaded.encode_index(), 2);
        assert_eq!(loaded.layers().len(), 4);
        assert_eq!(
            loaded.layers()[0].as_conv().unwrap().weight_state(),
            network.layers()[0].as_conv().unwrap().weight_state()
        );
        assert_eq!(loaded.reconstruct(&batch).unwrap(), expected);

        // only an empty network can be populated
        assert!(matches!(
            loaded.load_model(&file_path),
            Err(PersistenceError::Layer(LayerError::StateError(_)))
        ));
        dir.close().unwrap();
    }
}
