pub mod config;
pub use config::{CellsConfig, Config, GenerationConfig, PredictionConfig, StoreConfig};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RssiLocatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RssiLocatorError>;

/// Order in which evidence is folded into the posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BayesianMode {
    /// One access point per update, every fixed AP considered.
    Serial,
    /// Joint updates over batches of live-observed fixed APs.
    #[default]
    Parallel,
}

impl fmt::Display for BayesianMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BayesianMode::Serial => write!(f, "serial"),
            BayesianMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for BayesianMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(BayesianMode::Serial),
            "parallel" => Ok(BayesianMode::Parallel),
            other => Err(format!("unknown mode {other:?}, expected serial or parallel")),
        }
    }
}

/// Transform applied to raw histogram counts before they are stored as PMFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingKind {
    #[default]
    None,
    Gaussian,
}

impl fmt::Display for SmoothingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmoothingKind::None => write!(f, "none"),
            SmoothingKind::Gaussian => write!(f, "gaussian"),
        }
    }
}

impl FromStr for SmoothingKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SmoothingKind::None),
            "gaussian" => Ok(SmoothingKind::Gaussian),
            other => Err(format!("unknown smoothing {other:?}, expected none or gaussian")),
        }
    }
}

/// Validated knobs handed to the predictor for one prediction run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionSettings {
    pub mode: BayesianMode,
    pub pmf_bin_width: i32,
    pub cutoff_probability: f64,
    pub scans_for_averaging: usize, // consumed by whoever builds the observation, not the predictor
}

impl PredictionSettings {
    pub fn new(
        mode: BayesianMode,
        pmf_bin_width: i32,
        cutoff_probability: f64,
        scans_for_averaging: usize,
    ) -> Result<Self> {
        if pmf_bin_width < 1 {
            return Err(RssiLocatorError::InvalidConfiguration(format!(
                "pmf bin width must be at least 1, got {pmf_bin_width}"
            )));
        }
        if !(0.0..=1.0).contains(&cutoff_probability) {
            return Err(RssiLocatorError::InvalidConfiguration(format!(
                "cutoff probability must be within [0, 1], got {cutoff_probability}"
            )));
        }
        if scans_for_averaging == 0 {
            return Err(RssiLocatorError::InvalidConfiguration(
                "scans for averaging must be at least 1".into(),
            ));
        }
        Ok(Self { mode, pmf_bin_width, cutoff_probability, scans_for_averaging })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test] fn mode_parses_case_insensitively() { assert_eq!("SERIAL".parse::<BayesianMode>(), Ok(BayesianMode::Serial)); }
    #[test] fn mode_rejects_unknown() { assert!("batch".parse::<BayesianMode>().is_err()); }
    #[test] fn smoothing_round_trips_display() { assert_eq!(SmoothingKind::Gaussian.to_string().parse::<SmoothingKind>(), Ok(SmoothingKind::Gaussian)); }
    #[test] fn settings_accept_bounds() { assert!(PredictionSettings::new(BayesianMode::Serial, 1, 1.0, 1).is_ok()); }
    #[test] fn settings_reject_zero_bin_width() { assert!(matches!(PredictionSettings::new(BayesianMode::Serial, 0, 0.8, 3), Err(RssiLocatorError::InvalidConfiguration(_)))); }
    #[test] fn settings_reject_cutoff_above_one() { assert!(PredictionSettings::new(BayesianMode::Parallel, 1, 1.5, 3).is_err()); }
    #[test] fn settings_reject_nan_cutoff() { assert!(PredictionSettings::new(BayesianMode::Parallel, 1, f64::NAN, 3).is_err()); }
    #[test] fn settings_reject_zero_scans() { assert!(PredictionSettings::new(BayesianMode::Parallel, 1, 0.8, 0).is_err()); }
}
