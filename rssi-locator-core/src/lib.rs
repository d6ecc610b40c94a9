pub mod evaluate;
pub mod generate;
pub mod histogram;
pub mod manager;
pub mod model;
pub mod pmf;
pub mod predictor;
pub mod scan;
pub mod store;

pub use rssi_locator_common::{
    BayesianMode, PredictionSettings, Result, RssiLocatorError, SmoothingKind,
};
pub use evaluate::{evaluate, export_evaluation_json, EvaluationReport, WindowResult, WindowStatus};
pub use generate::{build_pmfs, generate_pmfs, GenerationOptions, GenerationSummary};
pub use histogram::{Histogram, HistogramBin, DEFAULT_MAX_RSSI, DEFAULT_MIN_RSSI};
pub use manager::{CellHistograms, HistogramManager, LoadStatus};
pub use model::{ApType, KnownAp, MeasurementKind, Sample};
pub use pmf::ApPmf;
pub use predictor::{likelihood, normalize_probabilities, BayesianPredictor, PmfModel, Posterior, Prediction};
pub use scan::{average_readings, average_scans, best_cell};
pub use store::{ApRegistry, Dataset, InMemoryStore, JsonFileStore, MeasurementSource, PmfStore};
