use crate::{
    activation_functions::Activation,
    convolutions::{convolve, pad_trailing, rotate180, swap_batch_channels, ConvMode},
    errors::{LayerError, LayerResult},
    layers::Layer,
    optimizer::{ParameterState, UpdateParams},
    transposed_convolutions::stride_upsample,
    ConvBias, ConvKernel, FeatureBatch, WeightPrecision,
};
use ndarray::*;
use ndarray_rand::{rand_distr::Normal, RandomExt};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

/// Everything needed to build a [`ConvLayer`] with random initial weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvLayerConfig {
    /// Number of feature maps the layer produces.
    pub num_kernels: usize,
    /// Number of input planes.
    pub channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub activation: Activation,
    /// Standard deviation of the zero mean gaussian the kernels are drawn from.
    pub init_w: WeightPrecision,
    /// Initial value of every bias.
    pub init_b: WeightPrecision,
    pub decode: bool,
}

impl ConvLayerConfig {
    /// Encoding relu layer with the same stride along both axes, kernels
    /// drawn with standard deviation 0.01 and zero biases.
    pub fn new(
        num_kernels: usize,
        channels: usize,
        kernel_size: (usize, usize),
        stride: usize,
    ) -> Self {
        ConvLayerConfig {
            num_kernels,
            channels,
            kernel_size,
            stride: (stride, stride),
            activation: Activation::Relu,
            init_w: 0.01,
            init_b: 0.,
            decode: false,
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn init(mut self, init_w: WeightPrecision, init_b: WeightPrecision) -> Self {
        self.init_w = init_w;
        self.init_b = init_b;
        self
    }

    pub fn strides(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn decode(mut self, decode: bool) -> Self {
        self.decode = decode;
        self
    }
}

/// Convolutional layer with a kernel bank of shape
/// (output features, input channels, kernel height, kernel width),
/// one bias per output feature and a nonlinearity.
///
/// Encoding layers perform a strided valid convolution. Decoding layers
/// insert `stride - 1` zeros between the input elements and perform a full
/// convolution, which upsamples the planes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvLayer {
    kernels: ConvKernel,
    /// Shape (output features, 1, 1) to broadcast over the planes.
    bias: ConvBias,
    stride: (usize, usize),
    activation: Activation,
    decode: bool,
    init_w: WeightPrecision,
    init_b: WeightPrecision,
    weight_state: ParameterState<Ix4>,
    bias_state: ParameterState<Ix3>,
    #[serde(skip)]
    cache: Option<ConvCache>,
    #[serde(skip)]
    gradients: Option<ConvGradients>,
}

#[derive(Debug, Clone)]
struct ConvCache {
    /// Input as it entered the convolution (stride upsampled when decoding).
    input: FeatureBatch,
    /// Convolution plus bias, before the nonlinearity.
    pre_activation: FeatureBatch,
}

#[derive(Debug, Clone)]
struct ConvGradients {
    kernels: ConvKernel,
    bias: ConvBias,
}

impl ConvLayer {
    pub fn new(config: ConvLayerConfig) -> LayerResult<ConvLayer> {
        ConvLayer::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        config: ConvLayerConfig,
        rng: &mut R,
    ) -> LayerResult<ConvLayer> {
        let (kernel_height, kernel_width) = config.kernel_size;
        if config.num_kernels == 0 || config.channels == 0 || kernel_height == 0 || kernel_width == 0
        {
            return Err(LayerError::InvalidParameter(format!(
                "kernel bank ({}, {}, {}, {}) must not be empty",
                config.num_kernels, config.channels, kernel_height, kernel_width
            )));
        }
        if !(config.init_w >= 0.) {
            return Err(LayerError::InvalidParameter(format!(
                "init_w must be a non-negative standard deviation, got {}",
                config.init_w
            )));
        }
        let dist = Normal::new(0., config.init_w).map_err(|e| {
            LayerError::InvalidParameter(format!("init_w = {}: {}", config.init_w, e))
        })?;

        let kernels = Array::random_using(
            (config.num_kernels, config.channels, kernel_height, kernel_width),
            dist,
            rng,
        );
        let bias = Array::from_elem((config.num_kernels, 1, 1), config.init_b);
        let mut layer = ConvLayer::from_parameters(
            kernels,
            bias,
            config.stride,
            config.activation,
            config.decode,
        )?;
        layer.init_w = config.init_w;
        layer.init_b = config.init_b;
        Ok(layer)
    }

    /// Builds a layer from explicit weights. The bias must have shape
    /// (output features, 1, 1).
    pub fn from_parameters(
        kernels: ConvKernel,
        bias: ConvBias,
        stride: (usize, usize),
        activation: Activation,
        decode: bool,
    ) -> LayerResult<ConvLayer> {
        if stride.0 == 0 || stride.1 == 0 {
            return Err(LayerError::InvalidParameter(format!(
                "stride must be positive, got {:?}",
                stride
            )));
        }
        if kernels.is_empty() {
            return Err(LayerError::InvalidParameter(
                "kernel bank must not be empty".to_string(),
            ));
        }
        let num_kernels = kernels.len_of(Axis(0));
        if bias.dim() != (num_kernels, 1, 1) {
            return Err(LayerError::ShapeError(format!(
                "bias of shape {:?} does not match {} kernels",
                bias.shape(),
                num_kernels
            )));
        }

        Ok(ConvLayer {
            weight_state: ParameterState::zeros(kernels.raw_dim()),
            bias_state: ParameterState::zeros(bias.raw_dim()),
            kernels,
            bias,
            stride,
            activation,
            decode,
            init_w: 0.01,
            init_b: 0.,
            cache: None,
            gradients: None,
        })
    }

    /// Configuration of this layer (initialisation settings included).
    pub fn config(&self) -> ConvLayerConfig {
        let (num_kernels, channels, kernel_height, kernel_width) = self.kernels.dim();
        ConvLayerConfig {
            num_kernels,
            channels,
            kernel_size: (kernel_height, kernel_width),
            stride: self.stride,
            activation: self.activation,
            init_w: self.init_w,
            init_b: self.init_b,
            decode: self.decode,
        }
    }

    /// Configuration of the dual layer: input and output features swapped,
    /// same kernel size and stride, opposite direction.
    pub fn mirror_config(&self) -> ConvLayerConfig {
        let config = self.config();
        ConvLayerConfig {
            num_kernels: config.channels,
            channels: config.num_kernels,
            decode: !config.decode,
            ..config
        }
    }

    /// Returns the dual layer with freshly initialised parameters.
    pub fn mirror(&self) -> LayerResult<ConvLayer> {
        ConvLayer::new(self.mirror_config())
    }

    pub fn mirror_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> LayerResult<ConvLayer> {
        ConvLayer::with_rng(self.mirror_config(), rng)
    }

    pub fn kernels(&self) -> &ConvKernel {
        &self.kernels
    }

    pub fn bias(&self) -> &ConvBias {
        &self.bias
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.len_of(Axis(0))
    }

    pub fn channels(&self) -> usize {
        self.kernels.len_of(Axis(1))
    }

    /// Kernel gradient of the last backward pass, averaged over the batch.
    pub fn weight_gradient(&self) -> Option<&ConvKernel> {
        self.gradients.as_ref().map(|g| &g.kernels)
    }

    /// Bias gradient of the last backward pass, averaged over the batch.
    pub fn bias_gradient(&self) -> Option<&ConvBias> {
        self.gradients.as_ref().map(|g| &g.bias)
    }

    pub fn weight_state(&self) -> &ParameterState<Ix4> {
        &self.weight_state
    }

    pub fn bias_state(&self) -> &ParameterState<Ix3> {
        &self.bias_state
    }
}

impl Layer for ConvLayer {
    fn forward(&mut self, data: &FeatureBatch) -> LayerResult<FeatureBatch> {
        let (input, maps) = if self.decode {
            let input = stride_upsample(data, self.stride);
            let maps = convolve(&input, &self.kernels, ConvMode::Full, (1, 1))?;
            (input, maps)
        } else {
            let maps = convolve(data, &self.kernels, ConvMode::Valid, self.stride)?;
            (data.clone(), maps)
        };

        let pre_activation = maps + &self.bias;
        let output = self.activation.activate(&pre_activation);
        self.cache = Some(ConvCache {
            input,
            pre_activation,
        });
        Ok(output)
    }

    fn backward(&mut self, gradient: &FeatureBatch) -> LayerResult<FeatureBatch> {
        let num_kernels = self.num_kernels();
        if gradient.len_of(Axis(1)) != num_kernels {
            return Err(LayerError::ChannelMismatch {
                expected: num_kernels,
                found: gradient.len_of(Axis(1)),
            });
        }
        let cache = self.cache.take().ok_or_else(|| {
            LayerError::StateError(
                "convolution backward pass without a preceding forward pass".into(),
            )
        })?;
        if gradient.dim() != cache.pre_activation.dim() {
            return Err(LayerError::ShapeError(format!(
                "convolution produced {:?} but received a gradient of shape {:?}",
                cache.pre_activation.shape(),
                gradient.shape()
            )));
        }

        let batch_size = gradient.len_of(Axis(0));
        let mut delta = gradient * &self.activation.derivative(&cache.pre_activation);

        if !self.decode {
            // undo the subsampling of the forward pass; positions the strided
            // grid never reached stay zero
            let (_, _, height, width) = cache.input.dim();
            let (_, _, kernel_height, kernel_width) = self.kernels.dim();
            delta = pad_trailing(
                &stride_upsample(&delta, self.stride),
                (height - kernel_height + 1, width - kernel_width + 1),
            )?;
        }

        let bias_gradient = delta
            .mean_axis(Axis(0))
            .ok_or_else(|| LayerError::ShapeError("empty batch".to_string()))?
            .sum_axis(Axis(2))
            .sum_axis(Axis(1))
            .into_shape(self.bias.raw_dim())?;

        // correlate inputs and deltas, the batch axis acting as channels
        let inputs = swap_batch_channels(&cache.input);
        let deltas = swap_batch_channels(&delta);
        let batch_size = batch_size as WeightPrecision;
        let kernel_gradient = if self.decode {
            convolve(&deltas, &rotate180(&inputs), ConvMode::Valid, (1, 1))? / batch_size
        } else {
            let swapped = convolve(&inputs, &rotate180(&deltas), ConvMode::Valid, (1, 1))?;
            rotate180(&swap_batch_channels(&swapped)) / batch_size
        };

        // adjoint of the forward convolution
        let flipped_kernels = rotate180(&swap_batch_channels(&self.kernels));
        let input_gradient = if self.decode {
            convolve(&delta, &flipped_kernels, ConvMode::Valid, self.stride)?
        } else {
            convolve(&delta, &flipped_kernels, ConvMode::Full, (1, 1))?
        };

        self.gradients = Some(ConvGradients {
            kernels: kernel_gradient,
            bias: bias_gradient,
        });
        Ok(input_gradient)
    }

    fn update(&mut self, params: &UpdateParams) -> LayerResult<()> {
        let gradients = self.gradients.take().ok_or_else(|| {
            LayerError::StateError("convolution update without a preceding backward pass".into())
        })?;
        self.weight_state
            .apply(&mut self.kernels, gradients.kernels, params.eps_w, params);
        self.bias_state
            .apply(&mut self.bias, gradients.bias, params.eps_b, params);
        Ok(())
    }

    fn is_decoder(&self) -> bool {
        self.decode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{optimizer::RmsProp, transposed_convolutions::transposed_convolve};
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn wave<Sh>(shape: Sh, phase: f32) -> FeatureBatch
    where
        Sh: ShapeBuilder<Dim = Ix4>,
    {
        let mut counter = 0.;
        Array::from_shape_simple_fn(shape, || {
            counter += 1.;
            (counter * 0.37 + phase).sin()
        })
    }

    fn loss(layer: &mut ConvLayer, data: &FeatureBatch, upstream: &FeatureBatch) -> f64 {
        let output = layer.forward(data).unwrap();
        output
            .iter()
            .zip(upstream.iter())
            .map(|(&o, &g)| o as f64 * g as f64)
            .sum()
    }

    /// Compares the analytic gradients of `L = <forward(x), upstream>` with
    /// central differences.
    fn check_gradients(mut layer: ConvLayer, data: FeatureBatch) {
        let output = layer.forward(&data).unwrap();
        let upstream = wave(output.raw_dim(), 1.3);
        let input_gradient = layer.backward(&upstream).unwrap();
        assert_eq!(input_gradient.dim(), data.dim());

        let batch_size = data.len_of(Axis(0)) as f64;
        let kernel_gradient = layer.weight_gradient().unwrap().clone();
        let bias_gradient = layer.bias_gradient().unwrap().clone();
        let h = 1e-2;
        let tolerance = 1e-2;

        for (index, analytic) in kernel_gradient.indexed_iter() {
            let original = layer.kernels[index];
            layer.kernels[index] = original + h;
            let plus = loss(&mut layer, &data, &upstream);
            layer.kernels[index] = original - h;
            let minus = loss(&mut layer, &data, &upstream);
            layer.kernels[index] = original;

            let numeric = (plus - minus) / (2. * h as f64) / batch_size;
            assert!(
                (numeric - *analytic as f64).abs() < tolerance,
                "kernel {:?}: numeric {} analytic {}",
                index,
                numeric,
                analytic
            );
        }

        for (index, analytic) in bias_gradient.indexed_iter() {
            let original = layer.bias[index];
            layer.bias[index] = original + h;
            let plus = loss(&mut layer, &data, &upstream);
            layer.bias[index] = original - h;
            let minus = loss(&mut layer, &data, &upstream);
            layer.bias[index] = original;

            let numeric = (plus - minus) / (2. * h as f64) / batch_size;
            assert!((numeric - *analytic as f64).abs() < tolerance);
        }

        let mut perturbed = data.clone();
        for (index, analytic) in input_gradient.indexed_iter() {
            let original = data[index];
            perturbed[index] = original + h;
            let plus = loss(&mut layer, &perturbed, &upstream);
            perturbed[index] = original - h;
            let minus = loss(&mut layer, &perturbed, &upstream);
            perturbed[index] = original;

            let numeric = (plus - minus) / (2. * h as f64);
            assert!(
                (numeric - *analytic as f64).abs() < tolerance,
                "input {:?}: numeric {} analytic {}",
                index,
                numeric,
                analytic
            );
        }
    }

    fn seeded_layer(config: ConvLayerConfig) -> ConvLayer {
        let mut rng = StdRng::seed_from_u64(7);
        ConvLayer::with_rng(config, &mut rng).unwrap()
    }

    #[test]
    fn test_forward_applies_bias_and_relu() {
        let kernels = Array4::from_elem((1, 1, 1, 1), 2.);
        let bias = Array3::from_elem((1, 1, 1), -1.);
        let mut layer =
            ConvLayer::from_parameters(kernels, bias, (1, 1), Activation::Relu, false).unwrap();

        let data = Array::from_shape_vec((1, 1, 2, 2), vec![0., 1., 0.25, 3.]).unwrap();
        let output = layer.forward(&data).unwrap();
        assert_eq!(
            output,
            Array::from_shape_vec((1, 1, 2, 2), vec![0., 1., 0., 5.]).unwrap()
        );
    }

    #[test]
    fn test_decoder_forward_is_transposed_convolution() {
        let kernels = Array::from_shape_fn((2, 3, 2, 3), |(f, c, i, j)| {
            0.1 * (1 + f + c + i * j) as f32
        });
        let bias = Array3::from_elem((2, 1, 1), 0.5);
        let mut layer =
            ConvLayer::from_parameters(kernels.clone(), bias, (2, 3), Activation::Relu, true)
                .unwrap();

        let codes = Array::from_shape_fn((2, 3, 3, 2), |(n, c, i, j)| (n + c + i + j) as f32);
        let output = layer.forward(&codes).unwrap();
        let expected = transposed_convolve(&codes, &kernels, (2, 3)).unwrap() + 0.5;
        assert_eq!(output.dim(), (2, 2, 6, 6));
        assert_abs_diff_eq!(output, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_encoding_gradients_with_stride() {
        // 8 rows leave one row the strided grid never reaches
        let config = ConvLayerConfig::new(3, 2, (3, 3), 2)
            .activation(Activation::Tanh)
            .init(0.3, 0.1);
        check_gradients(seeded_layer(config), wave((2, 2, 8, 7), 0.));
    }

    #[test]
    fn test_decoding_gradients_with_stride() {
        let config = ConvLayerConfig::new(2, 3, (3, 2), 2)
            .activation(Activation::Sigmoid)
            .init(0.3, -0.1)
            .decode(true);
        check_gradients(seeded_layer(config), wave((2, 3, 3, 4), 0.5));
    }

    #[test]
    fn test_gradients_without_stride() {
        let config = ConvLayerConfig::new(2, 1, (2, 3), 1)
            .activation(Activation::Tanh)
            .init(0.5, 0.);
        check_gradients(seeded_layer(config), wave((3, 1, 5, 6), 0.2));
        check_gradients(seeded_layer(config.decode(true)), wave((3, 1, 4, 3), 0.7));
    }

    #[test]
    fn test_input_gradient_shape_stride_one() {
        let mut layer = seeded_layer(ConvLayerConfig::new(4, 3, (5, 5), 1));
        let data = wave((2, 3, 12, 9), 0.);
        let output = layer.forward(&data).unwrap();
        assert_eq!(output.dim(), (2, 4, 8, 5));
        let gradient = layer.backward(&Array4::ones(output.raw_dim())).unwrap();
        assert_eq!(gradient.dim(), data.dim());
    }

    #[test]
    fn test_decoder_output_shape() {
        let mut layer = seeded_layer(ConvLayerConfig::new(6, 1, (7, 7), 3)).mirror().unwrap();
        assert!(layer.is_decoder());
        assert_eq!(layer.kernels().dim(), (1, 6, 7, 7));

        let codes = wave((2, 6, 8, 8), 0.);
        let output = layer.forward(&codes).unwrap();
        assert_eq!(output.dim(), (2, 1, 28, 28));
        let gradient = layer.backward(&output).unwrap();
        assert_eq!(gradient.dim(), codes.dim());
    }

    #[test]
    fn test_backward_channel_mismatch() {
        let mut layer = seeded_layer(ConvLayerConfig::new(3, 1, (2, 2), 1));
        layer.forward(&wave((1, 1, 4, 4), 0.)).unwrap();
        match layer.backward(&Array4::zeros((1, 2, 3, 3))) {
            Err(LayerError::ChannelMismatch { expected, found }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("expected a channel mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_channel_mismatch() {
        let mut layer = seeded_layer(ConvLayerConfig::new(3, 2, (2, 2), 1));
        assert!(matches!(
            layer.forward(&wave((1, 1, 4, 4), 0.)),
            Err(LayerError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_state_errors() {
        let mut layer = seeded_layer(ConvLayerConfig::new(1, 1, (2, 2), 1));
        let params = UpdateParams {
            eps_w: 0.1,
            eps_b: 0.1,
            mu: 0.,
            l2: 0.,
            rms_prop: None,
        };
        assert!(matches!(
            layer.backward(&Array4::zeros((1, 1, 2, 2))),
            Err(LayerError::StateError(_))
        ));
        assert!(matches!(layer.update(&params), Err(LayerError::StateError(_))));

        layer.forward(&wave((1, 1, 3, 3), 0.)).unwrap();
        layer.backward(&Array4::ones((1, 1, 2, 2))).unwrap();
        assert!(matches!(
            layer.backward(&Array4::ones((1, 1, 2, 2))),
            Err(LayerError::StateError(_))
        ));
        layer.update(&params).unwrap();
        assert!(matches!(layer.update(&params), Err(LayerError::StateError(_))));
    }

    #[test]
    fn test_plain_update_is_gradient_step() {
        let mut layer = seeded_layer(ConvLayerConfig::new(2, 1, (3, 3), 2).init(0.2, 0.05));
        let output = layer.forward(&wave((3, 1, 9, 9), 0.)).unwrap();
        layer.backward(&wave(output.raw_dim(), 2.)).unwrap();

        let eps_w = 0.05;
        let expected_kernels = layer.kernels() - &(layer.weight_gradient().unwrap() * eps_w);
        let expected_bias = layer.bias() - &(layer.bias_gradient().unwrap() * 0.5);
        layer
            .update(&UpdateParams {
                eps_w,
                eps_b: 0.5,
                mu: 0.,
                l2: 0.,
                rms_prop: None,
            })
            .unwrap();

        assert_eq!(layer.kernels(), &expected_kernels);
        assert_eq!(layer.bias(), &expected_bias);
    }

    #[test]
    fn test_rms_prop_state_is_tracked() {
        let mut layer = seeded_layer(ConvLayerConfig::new(2, 1, (2, 2), 1));
        let output = layer.forward(&wave((2, 1, 4, 4), 0.)).unwrap();
        layer.backward(&output).unwrap();
        let squared = layer.weight_gradient().unwrap().mapv(|g| 0.5 * g * g);
        let bias_squared = layer.bias_gradient().unwrap().mapv(|g| 0.5 * g * g);

        layer
            .update(&UpdateParams {
                eps_w: 0.01,
                eps_b: 0.01,
                mu: 0.9,
                l2: 0.,
                rms_prop: Some(RmsProp {
                    decay: 0.5,
                    epsilon: 0.01,
                }),
            })
            .unwrap();
        assert_abs_diff_eq!(layer.weight_state().mean_square(), &squared, epsilon = 1e-9);
        assert_abs_diff_eq!(layer.bias_state().mean_square(), &bias_squared, epsilon = 1e-9);
    }

    #[test]
    fn test_mirror_swaps_channels() {
        let layer = seeded_layer(
            ConvLayerConfig::new(6, 3, (5, 4), 2)
                .activation(Activation::Sigmoid)
                .init(0.02, 0.5),
        );
        let mirror = layer.mirror().unwrap();

        assert_eq!(mirror.kernels().dim(), (3, 6, 5, 4));
        assert_eq!((mirror.num_kernels(), mirror.channels()), (3, 6));
        assert_eq!(mirror.bias(), &Array3::from_elem((3, 1, 1), 0.5));
        assert_eq!(mirror.stride(), (2, 2));
        assert_eq!(mirror.activation(), Activation::Sigmoid);
        assert!(mirror.is_decoder());
        assert_eq!(mirror.mirror_config(), layer.config());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ConvLayer::new(ConvLayerConfig::new(0, 1, (3, 3), 1)).is_err());
        assert!(ConvLayer::new(ConvLayerConfig::new(1, 1, (3, 3), 0)).is_err());
        assert!(matches!(
            ConvLayer::new(ConvLayerConfig::new(1, 1, (3, 3), 1).init(-1., 0.)),
            Err(LayerError::InvalidParameter(_))
        ));
        assert!(ConvLayer::new(ConvLayerConfig::new(1, 1, (3, 3), 1).init(f32::NAN, 0.)).is_err());
        assert!(ConvLayer::new(ConvLayerConfig::new(1, 1, (3, 3), 1).init(0., 0.)).is_ok());
        assert!(ConvLayer::from_parameters(
            Array4::zeros((2, 1, 2, 2)),
            Array3::zeros((3, 1, 1)),
            (1, 1),
            Activation::Relu,
            false
        )
        .is_err());
    }
}
