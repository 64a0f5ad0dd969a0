//! Momentum SGD with L2 weight decay and optional RMSProp normalisation,
//! plus the learning rate schedule used by the training driver.
use log::debug;
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::WeightPrecision;

/// RMSProp settings: decay of the running mean square and the constant added
/// to its square root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsProp {
    pub decay: WeightPrecision,
    pub epsilon: WeightPrecision,
}

/// Hyperparameters of a single update step, with the learning rates already
/// decayed for the current iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateParams {
    /// Learning rate of the kernel banks.
    pub eps_w: WeightPrecision,
    /// Learning rate of the biases.
    pub eps_b: WeightPrecision,
    /// Momentum coefficient.
    pub mu: WeightPrecision,
    /// L2 regularisation coefficient.
    pub l2: WeightPrecision,
    /// `None` disables RMSProp.
    pub rms_prop: Option<RmsProp>,
}

/// Velocity and running mean square of one parameter array. Both start at
/// zero and have the shape of the parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState<D: Dimension> {
    velocity: Array<WeightPrecision, D>,
    mean_square: Array<WeightPrecision, D>,
}

impl<D: Dimension> ParameterState<D> {
    pub fn zeros(shape: D) -> Self {
        Self {
            velocity: Array::zeros(shape.clone()),
            mean_square: Array::zeros(shape),
        }
    }

    pub fn velocity(&self) -> &Array<WeightPrecision, D> {
        &self.velocity
    }

    pub fn mean_square(&self) -> &Array<WeightPrecision, D> {
        &self.mean_square
    }

    /// Applies one update to `parameter`:
    ///
    /// ```text
    /// ms = decay * ms + (1 - decay) * g^2        (RMSProp only)
    /// g  = g / (sqrt(ms) + epsilon)              (RMSProp only, NaN -> 0)
    /// v  = mu * v - lr * g - lr * l2 * p
    /// p  = p + v
    /// ```
    pub fn apply(
        &mut self,
        parameter: &mut Array<WeightPrecision, D>,
        mut gradient: Array<WeightPrecision, D>,
        learning_rate: WeightPrecision,
        params: &UpdateParams,
    ) {
        debug_assert_eq!(parameter.shape(), gradient.shape());

        if let Some(rms) = params.rms_prop {
            Zip::from(&mut self.mean_square)
                .and(&gradient)
                .for_each(|ms, &g| *ms = rms.decay * *ms + (1. - rms.decay) * g * g);

            let mut replaced = 0;
            Zip::from(&mut gradient)
                .and(&self.mean_square)
                .for_each(|g, &ms| {
                    *g /= ms.sqrt() + rms.epsilon;
                    if g.is_nan() {
                        *g = 0.;
                        replaced += 1;
                    }
                });
            if replaced > 0 {
                debug!(
                    "RMSProp normalisation produced {} NaN gradients, replaced with 0.",
                    replaced
                );
            }
        }

        Zip::from(&mut self.velocity)
            .and(&gradient)
            .and(&*parameter)
            .for_each(|v, &g, &p| {
                *v = params.mu * *v - learning_rate * g - learning_rate * params.l2 * p
            });
        *parameter += &self.velocity;
    }
}

/// Decays the learning rate `eps` for iteration `itr`.
///
/// `intvl == 0` keeps the rate constant. Otherwise the rate is
/// `eps / (1 + phi * min(itr, satr) / intvl)`; a missing `satr` never
/// saturates.
pub fn epsilon_decay(
    eps: WeightPrecision,
    phi: WeightPrecision,
    satr: Option<usize>,
    itr: usize,
    intvl: usize,
) -> WeightPrecision {
    if intvl == 0 {
        return eps;
    }
    let capped = match satr {
        Some(satr) => itr.min(satr),
        None => itr,
    };
    let i = capped as WeightPrecision / intvl as WeightPrecision;
    eps / (1. + i * phi)
}
