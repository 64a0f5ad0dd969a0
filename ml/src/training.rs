//! Mini-batch training loop around [`ConvAutoEncoder`].
use crate::{
    config::TrainingParams, errors::LayerResult, models::ConvAutoEncoder, ImagePrecision,
};
use log::{debug, info};
use ndarray::*;

/// Errors of one pass over a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchError {
    /// Mean of the signed elementwise error `reconstruction - target`.
    pub mean: ImagePrecision,
    /// Mean squared error.
    pub mse: ImagePrecision,
}

impl BatchError {
    fn of(error: &Array4<ImagePrecision>) -> BatchError {
        BatchError {
            mean: error.mean().unwrap_or(0.),
            mse: error.mapv(|e| e * e).mean().unwrap_or(0.),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// Per epoch average of the batch errors.
    pub epoch_errors: Vec<BatchError>,
    /// Number of updates performed.
    pub iterations: usize,
}

/// One update: reconstruct, backpropagate `reconstruction - targets`, update.
pub fn train_step<'a, 'b, V, T>(
    network: &mut ConvAutoEncoder,
    inputs: V,
    targets: T,
    params: &TrainingParams,
    iteration: usize,
) -> LayerResult<BatchError>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
    T: AsArray<'b, ImagePrecision, Ix4>,
{
    let targets: ArrayView4<ImagePrecision> = targets.into();
    let error = network.reconstruct(inputs)? - &targets;
    network.backprop(&error)?;
    network.update(params, iteration)?;
    Ok(BatchError::of(&error))
}

/// Trains the network to reproduce `data` for `params.epochs` epochs.
///
/// Every epoch walks the images in order in batches of `params.batch_size`,
/// the last batch may be smaller. `on_epoch` is called with the epoch number
/// and its average error after every epoch.
pub fn train<'a, V, F>(
    network: &mut ConvAutoEncoder,
    data: V,
    params: &TrainingParams,
    mut on_epoch: F,
) -> LayerResult<TrainingReport>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
    F: FnMut(usize, &BatchError),
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let mut report = TrainingReport::default();
    if data.is_empty() {
        return Ok(report);
    }
    let batch_size = params.batch_size.max(1);

    for epoch in 0..params.epochs {
        let mut errors = Vec::new();
        for batch in data.axis_chunks_iter(Axis(0), batch_size) {
            let error = train_step(network, batch, batch, params, report.iterations)?;
            debug!(
                "Epoch: {:5} | Iteration: {:8} | Avg reconstruction error: {:.4} | MSE: {:.6}",
                epoch, report.iterations, error.mean, error.mse
            );
            report.iterations += 1;
            errors.push(error);
        }

        let count = errors.len() as ImagePrecision;
        let epoch_error = BatchError {
            mean: errors.iter().map(|e| e.mean).sum::<ImagePrecision>() / count,
            mse: errors.iter().map(|e| e.mse).sum::<ImagePrecision>() / count,
        };
        info!(
            "Epoch {} done after {} iterations, avg reconstruction error {:.4}, MSE {:.6}",
            epoch, report.iterations, epoch_error.mean, epoch_error.mse
        );
        on_epoch(epoch, &epoch_error);
        report.epoch_errors.push(epoch_error);
    }
    Ok(report)
}

/// Reconstruction error of `data` without touching the parameters.
pub fn evaluate<'a, V>(network: &mut ConvAutoEncoder, data: V) -> LayerResult<BatchError>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let data: ArrayView4<ImagePrecision> = data.into();
    let error = network.reconstruct(data)? - &data;
    Ok(BatchError::of(&error))
}
