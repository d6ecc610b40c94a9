use log::{debug, info, warn};
use rssi_locator_common::{BayesianMode, PredictionSettings, Result};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::pmf::ApPmf;
use crate::store::{ApRegistry, PmfStore};

/// Stand-in reading for a model AP missing from the live scan (serial mode only).
pub const DEFAULT_RSSI: i32 = -100;
/// Likelihood when an AP has no usable PMF for a cell.
pub const LIKELIHOOD_FOR_MISSING: f64 = 0.01;
/// Likelihood when the PMF exists but the observed bin never occurred in training.
pub const LIKELIHOOD_FOR_ZERO_BIN: f64 = 0.1;
pub const MIN_ITERATIONS_BEFORE_CUTOFF: usize = 1;
pub const PARALLEL_BATCH_SIZE: usize = 5;

/// cell -> probability
pub type Posterior = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub posterior: Posterior,
    /// APs (serial) or batches (parallel) folded in before returning.
    pub updates: usize,
    pub reached_cutoff: bool,
}

impl Prediction {
    fn new(posterior: Posterior, updates: usize, reached_cutoff: bool) -> Self {
        Self { posterior, updates, reached_cutoff }
    }
}

/// P(rssi | cell, ap) from a stored PMF, with floors for missing evidence.
pub fn likelihood(pmf: Option<&ApPmf>, observed_rssi: i32) -> f64 {
    let Some(pmf) = pmf else {
        return LIKELIHOOD_FOR_MISSING;
    };
    let total = pmf.total_count();
    if total == 0 {
        return LIKELIHOOD_FOR_MISSING;
    }
    let ratio = f64::from(pmf.count_for_rssi(observed_rssi)) / total as f64;
    if ratio == 0.0 {
        LIKELIHOOD_FOR_ZERO_BIN
    } else {
        ratio
    }
}

/// Scales weights to sum to 1; uniform when they sum to zero (or worse).
pub fn normalize_probabilities(weights: &Posterior) -> Posterior {
    if weights.is_empty() {
        return Posterior::new();
    }
    let sum: f64 = weights.values().sum();
    if sum.is_nan() || sum <= 0.0 {
        warn!("Probabilities sum to {sum} during normalization, falling back to uniform");
        let uniform = 1.0 / weights.len() as f64;
        return weights.keys().map(|cell| (cell.clone(), uniform)).collect();
    }
    weights.iter().map(|(cell, w)| (cell.clone(), w / sum)).collect()
}

fn uniform_prior(cells: &[String]) -> Posterior {
    let cells: BTreeSet<&String> = cells.iter().collect();
    if cells.is_empty() {
        return Posterior::new();
    }
    let p = 1.0 / cells.len() as f64;
    cells.into_iter().map(|cell| (cell.clone(), p)).collect()
}

fn max_probability(posterior: &Posterior) -> f64 {
    posterior.values().copied().fold(0.0, f64::max)
}

fn format_posterior(posterior: &Posterior) -> String {
    posterior
        .iter()
        .map(|(cell, p)| format!("{cell}: {p:.3}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Snapshot of the PMFs for one bin width plus the fixed AP set they are used with.
#[derive(Debug, Clone)]
pub struct PmfModel {
    bin_width: i32,
    pmfs: HashMap<String, HashMap<String, ApPmf>>, // ap -> cell -> pmf
    fixed_aps: BTreeSet<String>,
}

impl PmfModel {
    /// `None` when there is nothing to predict with: no PMFs at this width or no fixed APs.
    pub fn new(bin_width: i32, records: Vec<ApPmf>, fixed_aps: BTreeSet<String>) -> Option<Self> {
        let mut pmfs: HashMap<String, HashMap<String, ApPmf>> = HashMap::new();
        for pmf in records.into_iter().filter(|p| p.bin_width == bin_width) {
            pmfs.entry(pmf.ap.clone()).or_default().insert(pmf.cell.clone(), pmf);
        }
        if pmfs.is_empty() {
            warn!("No PMF data found for bin width {bin_width}, cannot predict");
            return None;
        }
        if fixed_aps.is_empty() {
            warn!("No fixed APs in the model, cannot predict");
            return None;
        }
        Some(Self { bin_width, pmfs, fixed_aps })
    }

    pub fn bin_width(&self) -> i32 {
        self.bin_width
    }

    pub fn fixed_aps(&self) -> &BTreeSet<String> {
        &self.fixed_aps
    }

    pub fn likelihood(&self, ap: &str, cell: &str, observed_rssi: i32) -> f64 {
        let pmf = self.pmfs.get(ap).and_then(|by_cell| by_cell.get(cell));
        let l = likelihood(pmf, observed_rssi);
        debug!("Likelihood {l} for AP {ap} (RSSI {observed_rssi}) in cell {cell}");
        l
    }

    // one joint Bayes step: prior x product of likelihoods, then normalize
    fn update(&self, prior: &Posterior, evidence: &[(&str, i32)]) -> Posterior {
        let weights: Posterior = prior
            .iter()
            .map(|(cell, p)| {
                let joint: f64 = evidence
                    .iter()
                    .map(|&(ap, rssi)| self.likelihood(ap, cell, rssi))
                    .product();
                (cell.clone(), joint * p)
            })
            .collect();
        normalize_probabilities(&weights)
    }

    pub fn predict(&self, live: &HashMap<String, i32>, mode: BayesianMode, cutoff: f64, cells: &[String]) -> Prediction {
        let prior = uniform_prior(cells);
        if prior.is_empty() {
            return Prediction::new(prior, 0, false);
        }
        match mode {
            BayesianMode::Serial => self.serial(live, cutoff, prior),
            BayesianMode::Parallel => self.parallel(live, cutoff, prior),
        }
    }

    fn serial(&self, live: &HashMap<String, i32>, cutoff: f64, mut posterior: Posterior) -> Prediction {
        // every model AP takes part; an AP missing from the scan is evidence at DEFAULT_RSSI
        let mut order: Vec<(&str, i32)> = self
            .fixed_aps
            .iter()
            .map(|ap| (ap.as_str(), live.get(ap).copied().unwrap_or(DEFAULT_RSSI)))
            .collect();
        order.sort_by_key(|&(ap, rssi)| (Reverse(rssi), ap));
        debug!("Serial: {} model APs, cutoff {cutoff}", order.len());

        for (step, &(ap, rssi)) in order.iter().enumerate() {
            let iteration = step + 1;
            posterior = self.update(&posterior, &[(ap, rssi)]);
            debug!("Serial step {iteration} (AP {ap}, RSSI {rssi}): {}", format_posterior(&posterior));
            if iteration >= MIN_ITERATIONS_BEFORE_CUTOFF {
                let best = max_probability(&posterior);
                if best >= cutoff {
                    info!("Serial cutoff reached after {iteration} APs ({best:.3} >= {cutoff})");
                    return Prediction::new(posterior, iteration, true);
                }
            }
        }
        info!("Serial: all {} APs processed without reaching cutoff", order.len());
        Prediction::new(posterior, order.len(), false)
    }

    fn parallel(&self, live: &HashMap<String, i32>, cutoff: f64, mut posterior: Posterior) -> Prediction {
        let mut observed: Vec<(&str, i32)> = live
            .iter()
            .filter(|(ap, _)| self.fixed_aps.contains(*ap))
            .map(|(ap, &rssi)| (ap.as_str(), rssi))
            .collect();
        if observed.is_empty() {
            warn!("Parallel: no live APs belong to the fixed model, returning the uniform prior");
            return Prediction::new(posterior, 0, false);
        }
        observed.sort_by_key(|&(ap, rssi)| (Reverse(rssi), ap));

        let batches: Vec<&[(&str, i32)]> = observed.chunks(PARALLEL_BATCH_SIZE).collect();
        debug!("Parallel: {} observed model APs in {} batches, cutoff {cutoff}", observed.len(), batches.len());
        for (i, batch) in batches.iter().enumerate() {
            let number = i + 1;
            posterior = self.update(&posterior, batch);
            debug!("Parallel batch {number}: {}", format_posterior(&posterior));
            let best = max_probability(&posterior);
            if best >= cutoff {
                info!("Parallel cutoff reached after batch {number} ({best:.3} >= {cutoff})");
                return Prediction::new(posterior, number, true);
            }
        }
        info!("Parallel: all {} batches processed without reaching cutoff", batches.len());
        Prediction::new(posterior, batches.len(), false)
    }
}

/// Reads PMFs and the AP registry through the injected stores on every prediction.
pub struct BayesianPredictor {
    pmfs: Arc<dyn PmfStore>,
    registry: Arc<dyn ApRegistry>,
}

impl BayesianPredictor {
    pub fn new(pmfs: Arc<dyn PmfStore>, registry: Arc<dyn ApRegistry>) -> Self {
        Self { pmfs, registry }
    }

    pub fn load_model(&self, bin_width: i32) -> Result<Option<PmfModel>> {
        let records = self.pmfs.fetch_pmfs(bin_width)?;
        if records.is_empty() {
            warn!("No PMF data found for bin width {bin_width}, cannot predict");
            return Ok(None);
        }
        let fixed = self.registry.fetch_fixed_ap_identities()?;
        Ok(PmfModel::new(bin_width, records, fixed))
    }

    pub fn predict_detailed(
        &self,
        live: &HashMap<String, i32>,
        settings: &PredictionSettings,
        cells: &[String],
    ) -> Result<Option<Prediction>> {
        Ok(self
            .load_model(settings.pmf_bin_width)?
            .map(|model| model.predict(live, settings.mode, settings.cutoff_probability, cells)))
    }

    /// Posterior over `cells`; empty when prediction is impossible.
    pub fn predict(&self, live: &HashMap<String, i32>, settings: &PredictionSettings, cells: &[String]) -> Result<Posterior> {
        Ok(self
            .predict_detailed(live, settings, cells)?
            .map(|p| p.posterior)
            .unwrap_or_default())
    }
}
