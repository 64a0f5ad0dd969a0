//! Command line interface to train the convolutional autoencoder on an image
//! set, reconstruct images with a trained model and render its kernels.

use convae::{batch_to_image, kernels_to_image};
use env_logger::Builder;
use log::{info, warn};
use ml::{
    config::TrainingParams,
    dataset::NpzDatasetLoader,
    layers::{ConvLayer, ConvLayerConfig, NetworkLayer, PoolLayer},
    models::ConvAutoEncoder,
    pooling::PoolMode,
    training::{evaluate, train},
};
use ndarray::{s, Array4};
use quicli::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};
use structopt::StructOpt;

/// Network architecture and image set layout.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Preset {
    /// 28x28 digits stored one flattened image per row.
    Mnist,
    /// 32x32 faces stored with the samples along the last axis.
    Faces,
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mnist" => Ok(Preset::Mnist),
            "faces" => Ok(Preset::Faces),
            other => Err(format!("unknown preset '{}', expected mnist or faces", other)),
        }
    }
}

impl Preset {
    fn image_shape(self) -> (usize, usize, usize) {
        match self {
            Preset::Mnist => (28, 28, 1),
            Preset::Faces => (32, 32, 1),
        }
    }

    fn training_params(self) -> TrainingParams {
        match self {
            Preset::Mnist => TrainingParams::default(),
            Preset::Faces => TrainingParams::faces(),
        }
    }

    fn encoder_config(self) -> ConvLayerConfig {
        match self {
            Preset::Mnist => ConvLayerConfig::new(6, 1, (7, 7), 3),
            Preset::Faces => ConvLayerConfig::new(6, 1, (3, 3), 1),
        }
    }

    fn encoder_layers(self, rng: &mut StdRng) -> Result<Vec<NetworkLayer>, Error> {
        let conv = ConvLayer::with_rng(self.encoder_config(), rng)?;
        let pool = PoolLayer::new((2, 2), PoolMode::Max)?;
        Ok(vec![conv.into(), pool.into()])
    }

    fn load_images(
        self,
        path: &Path,
        array: &str,
        limit: Option<usize>,
    ) -> Result<Array4<f32>, Error> {
        let mut loader = NpzDatasetLoader::from_path(path)?;
        let images = match self {
            Preset::Mnist => loader.load_images(array, self.image_shape(), limit)?,
            Preset::Faces => loader.load_samples_last(array, limit)?,
        };
        Ok(images)
    }
}

/// Trains a new autoencoder on the images of an npz archive
#[derive(Debug, StructOpt)]
struct TrainOpts {
    /// Path to the npz archive holding the images
    #[structopt(parse(from_os_str))]
    data: PathBuf,
    /// Architecture and image layout, mnist or faces
    #[structopt(short = "p", long = "preset", default_value = "mnist")]
    preset: Preset,
    /// Name of the training images in the archive
    #[structopt(long = "array", default_value = "train_data")]
    array: String,
    /// Name of the test images in the archive, evaluated after training
    #[structopt(long = "test-array")]
    test_array: Option<String>,
    /// Uses at most this many training images
    #[structopt(long = "limit")]
    limit: Option<usize>,
    /// JSON file with training parameters, replaces those of the preset
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    /// Overrides the number of epochs
    #[structopt(short = "e", long = "epochs")]
    epochs: Option<usize>,
    /// Seed of the weight initialisation
    #[structopt(long = "seed")]
    seed: Option<u64>,
    /// Where the trained model is written
    #[structopt(
        short = "o",
        long = "output",
        default_value = "convae.model",
        parse(from_os_str)
    )]
    output: PathBuf,
    /// Writes a grid of reconstructed training images to this png file
    #[structopt(long = "images", parse(from_os_str))]
    images: Option<PathBuf>,
    /// Number of images in the reconstruction grid
    #[structopt(short = "n", long = "count", default_value = "12")]
    count: usize,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Reconstructs images with a trained model
#[derive(Debug, StructOpt)]
struct ReconstructOpts {
    /// Path to a model written by the train command
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// Path to the npz archive holding the images
    #[structopt(parse(from_os_str))]
    data: PathBuf,
    /// Output png with the reconstructions
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    /// Image layout, mnist or faces
    #[structopt(short = "p", long = "preset", default_value = "mnist")]
    preset: Preset,
    /// Name of the images in the archive
    #[structopt(long = "array", default_value = "test_data")]
    array: String,
    /// Number of images to reconstruct
    #[structopt(short = "n", long = "count", default_value = "12")]
    count: usize,
    /// Also writes the original images to this png file
    #[structopt(long = "originals", parse(from_os_str))]
    originals: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Renders the kernels of the input facing convolution of a model
#[derive(Debug, StructOpt)]
struct KernelOpts {
    /// Path to a model written by the train command
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// Output png
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Train convolutional autoencoders and look at what they learned.
#[derive(Debug, StructOpt)]
#[structopt(name = "ConvAE")]
enum ConvAe {
    #[structopt(name = "train", about = "Trains a new autoencoder on an image set.")]
    Train(TrainOpts),
    #[structopt(
        name = "reconstruct",
        about = "Reconstructs images with a trained autoencoder and reports the error."
    )]
    Reconstruct(ReconstructOpts),
    #[structopt(
        name = "kernels",
        about = "Renders the kernels of the first convolution of a trained autoencoder."
    )]
    Kernels(KernelOpts),
}

/// Trait for the subcommands of the command line interface
trait ConvAeOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

fn load_model(path: &Path) -> Result<ConvAutoEncoder, Error> {
    let mut network = ConvAutoEncoder::default();
    network.load_model(path)?;
    Ok(network)
}

impl ConvAeOpts for TrainOpts {
    fn run(&self) -> CliResult {
        let mut params = match &self.config {
            Some(path) => TrainingParams::from_json_file(path)?,
            None => self.preset.training_params(),
        };
        if let Some(epochs) = self.epochs {
            params.epochs = epochs;
        }
        params.validate()?;

        let data = self.preset.load_images(&self.data, &self.array, self.limit)?;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let encoder = self.preset.encoder_layers(&mut rng)?;
        let mut network = ConvAutoEncoder::with_rng(encoder, &mut rng)?;

        info!(
            "Training on {} images for {} epochs in batches of {}",
            data.len_of(ndarray::Axis(0)),
            params.epochs,
            params.batch_size
        );
        let report = train(&mut network, &data, &params, |epoch, error| {
            if !error.mse.is_finite() {
                warn!("Reconstruction error of epoch {} is not finite", epoch);
            }
        })?;
        info!("Training done after {} iterations", report.iterations);

        if let Some(test_array) = &self.test_array {
            let test = self.preset.load_images(&self.data, test_array, None)?;
            let error = evaluate(&mut network, &test)?;
            info!(
                "Average reconstruction error on {} test images: {:.4} (MSE {:.6})",
                test.len_of(ndarray::Axis(0)),
                error.mean,
                error.mse
            );
        }

        if let Some(path) = &self.images {
            let count = self.count.min(data.len_of(ndarray::Axis(0)));
            let reconstruction = network.reconstruct(data.slice(s![..count, .., .., ..]))?;
            batch_to_image(&reconstruction).save(path)?;
        }

        network.save_model(&self.output)?;
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvAeOpts for ReconstructOpts {
    fn run(&self) -> CliResult {
        let mut network = load_model(&self.model)?;
        let images = self
            .preset
            .load_images(&self.data, &self.array, Some(self.count))?;

        let reconstruction = network.reconstruct(&images)?;
        let error = &reconstruction - &images;
        info!(
            "Average reconstruction error on {} images: {:.4} (MSE {:.6})",
            images.len_of(ndarray::Axis(0)),
            error.mean().unwrap_or(0.),
            error.mapv(|e| e * e).mean().unwrap_or(0.)
        );

        batch_to_image(&reconstruction).save(&self.output)?;
        if let Some(path) = &self.originals {
            batch_to_image(&images).save(path)?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvAeOpts for KernelOpts {
    fn run(&self) -> CliResult {
        let network = load_model(&self.model)?;
        let kernels = network
            .input_kernels()
            .ok_or_else(|| format_err!("The model has no encoding convolution"))?;
        kernels_to_image(kernels).save(&self.output)?;
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvAeOpts for ConvAe {
    fn run(&self) -> CliResult {
        match self {
            ConvAe::Train(c) => c.run(),
            ConvAe::Reconstruct(c) => c.run(),
            ConvAe::Kernels(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            ConvAe::Train(c) => c.get_verbosity(),
            ConvAe::Reconstruct(c) => c.get_verbosity(),
            ConvAe::Kernels(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = ConvAe::from_args();
    args.setup_env_logger()?;
    args.run()
}
