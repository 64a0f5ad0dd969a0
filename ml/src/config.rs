//! Training hyperparameters, read from a JSON document.
//!
//! The recognised keys are
//!
//! ```json
//! {
//!     "epochs": 30, "batch_size": 500,
//!     "eps_w": 0.0007, "eps_b": 0.0007,
//!     "eps_decay": 9, "eps_intvl": 30, "eps_satr": null,
//!     "mu": 0.7, "l2": 0.95,
//!     "RMSProp": true, "RMSProp_decay": 0.9, "minsq_RMSProp": 0
//! }
//! ```
//!
//! Missing keys take the values above (the MNIST setup). A `null` saturation
//! never stops the learning rate decay.
use crate::{
    optimizer::{epsilon_decay, RmsProp, UpdateParams},
    WeightPrecision,
};
use log::warn;
use serde_derive::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not readable. Filesystem reported error\n {0}.")]
    Io(#[from] std::io::Error),
    #[error("Config file is not a valid training parameter document:\n {0}.")]
    Format(#[from] serde_json::Error),
    #[error("Invalid training parameter: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub eps_w: WeightPrecision,
    pub eps_b: WeightPrecision,
    /// Decay rate `phi` of the learning rates.
    pub eps_decay: WeightPrecision,
    /// Number of iterations per decay step, 0 disables the decay.
    pub eps_intvl: usize,
    /// Iteration after which the learning rates stop decaying.
    pub eps_satr: Option<usize>,
    pub mu: WeightPrecision,
    pub l2: WeightPrecision,
    #[serde(rename = "RMSProp")]
    pub rms_prop: bool,
    #[serde(rename = "RMSProp_decay")]
    pub rms_prop_decay: WeightPrecision,
    #[serde(rename = "minsq_RMSProp")]
    pub minsq_rms_prop: WeightPrecision,
}

impl Default for TrainingParams {
    fn default() -> Self {
        TrainingParams {
            epochs: 30,
            batch_size: 500,
            eps_w: 0.0007,
            eps_b: 0.0007,
            eps_decay: 9.,
            eps_intvl: 30,
            eps_satr: None,
            mu: 0.7,
            l2: 0.95,
            rms_prop: true,
            rms_prop_decay: 0.9,
            minsq_rms_prop: 0.,
        }
    }
}

impl TrainingParams {
    /// Parameters of the Toronto faces setup.
    pub fn faces() -> Self {
        TrainingParams {
            epochs: 50,
            eps_w: 0.005,
            eps_b: 0.005,
            eps_intvl: 10,
            minsq_rms_prop: 0.01,
            ..Default::default()
        }
    }

    pub fn from_json_str(raw: &str) -> ConfigResult<TrainingParams> {
        let params: TrainingParams = serde_json::from_str(raw)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<TrainingParams> {
        let raw_file = fs::read_to_string(path)?;
        TrainingParams::from_json_str(&raw_file)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.eps_w < 0. || self.eps_b < 0. {
            return Err(ConfigError::Invalid(format!(
                "learning rates must not be negative, got eps_w = {}, eps_b = {}",
                self.eps_w, self.eps_b
            )));
        }
        if !(0. ..=1.).contains(&self.rms_prop_decay) {
            return Err(ConfigError::Invalid(format!(
                "RMSProp_decay must lie in [0, 1], got {}",
                self.rms_prop_decay
            )));
        }
        if self.rms_prop && self.minsq_rms_prop == 0. {
            warn!("RMSProp without minsq_RMSProp, zero gradients will be normalised by zero");
        }
        if self.eps_decay < 0. {
            warn!("Negative eps_decay {} increases the learning rates", self.eps_decay);
        }
        Ok(())
    }

    /// Hyperparameters of the update at `iteration`, learning rates decayed.
    pub fn update_params(&self, iteration: usize) -> UpdateParams {
        let decay = |eps| epsilon_decay(eps, self.eps_decay, self.eps_satr, iteration, self.eps_intvl);
        UpdateParams {
            eps_w: decay(self.eps_w),
            eps_b: decay(self.eps_b),
            mu: self.mu,
            l2: self.l2,
            rms_prop: if self.rms_prop {
                Some(RmsProp {
                    decay: self.rms_prop_decay,
                    epsilon: self.minsq_rms_prop,
                })
            } else {
                None
            },
        }
    }
}
