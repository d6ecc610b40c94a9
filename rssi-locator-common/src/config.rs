use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::{BayesianMode, PredictionSettings, RssiLocatorError, SmoothingKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    #[serde(default)]
    pub mode: BayesianMode,
    #[serde(default = "default_bin_width")]
    pub pmf_bin_width: i32,
    #[serde(default = "default_cutoff")]
    pub cutoff_probability: f64,
    #[serde(default = "default_scans")]
    pub scans_for_averaging: usize,
}

fn default_bin_width() -> i32 {
    1
}
fn default_cutoff() -> f64 {
    0.8
}
fn default_scans() -> usize {
    3
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            mode: BayesianMode::default(),
            pmf_bin_width: default_bin_width(),
            cutoff_probability: default_cutoff(),
            scans_for_averaging: default_scans(),
        }
    }
}

impl PredictionConfig {
    pub fn to_settings(&self) -> crate::Result<PredictionSettings> {
        PredictionSettings::new(
            self.mode,
            self.pmf_bin_width,
            self.cutoff_probability,
            self.scans_for_averaging,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_min_bin_width")]
    pub min_bin_width: i32,
    #[serde(default = "default_max_bin_width")]
    pub max_bin_width: i32,
    #[serde(default)]
    pub smoothing: SmoothingKind,
    #[serde(default = "default_kernel_radius")]
    pub kernel_radius_multiplier: u32,
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i32,
    #[serde(default = "default_max_rssi")]
    pub max_rssi: i32,
}

fn default_min_bin_width() -> i32 {
    1
}
fn default_max_bin_width() -> i32 {
    10
}
fn default_kernel_radius() -> u32 {
    3
}
fn default_min_rssi() -> i32 {
    -100
}
fn default_max_rssi() -> i32 {
    0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_bin_width: default_min_bin_width(),
            max_bin_width: default_max_bin_width(),
            smoothing: SmoothingKind::default(),
            kernel_radius_multiplier: default_kernel_radius(),
            min_rssi: default_min_rssi(),
            max_rssi: default_max_rssi(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    pub data_dir: Option<String>, // falls back to the platform data dir when None
}

impl StoreConfig {
    pub fn resolve_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rssi-locator"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellsConfig {
    #[serde(default = "default_cells")]
    pub labels: Vec<String>,
}

fn default_cells() -> Vec<String> {
    (1..=10).map(|i| format!("C{i}")).collect()
}

impl Default for CellsConfig {
    fn default() -> Self {
        Self { labels: default_cells() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cells: CellsConfig,
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rssi-locator")
            .join("config.toml")
    }

    pub fn load() -> crate::Result<Self> {
        let path = if let Ok(env_path) = std::env::var("RSSI_LOCATOR_CONFIG") {
            PathBuf::from(env_path) // $RSSI_LOCATOR_CONFIG overrides default config path
        } else {
            Self::config_path()
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| RssiLocatorError::Config(e.to_string()))
    }

    pub fn save(&self) -> crate::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| RssiLocatorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
