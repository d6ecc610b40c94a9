use log::{debug, info, warn};
use rayon::prelude::*;
use rssi_locator_common::{GenerationConfig, Result, RssiLocatorError, SmoothingKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::histogram::{validate_range, DEFAULT_KERNEL_RADIUS_MULTIPLIER, DEFAULT_MAX_RSSI, DEFAULT_MIN_RSSI};
use crate::manager::{CellHistograms, HistogramManager};
use crate::pmf::ApPmf;
use crate::store::{ApRegistry, MeasurementSource, PmfStore};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub min_bin_width: i32,
    pub max_bin_width: i32,
    pub smoothing: SmoothingKind,
    pub kernel_radius_multiplier: u32,
    pub min_rssi: i32,
    pub max_rssi: i32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            min_bin_width: 1,
            max_bin_width: 10,
            smoothing: SmoothingKind::None,
            kernel_radius_multiplier: DEFAULT_KERNEL_RADIUS_MULTIPLIER,
            min_rssi: DEFAULT_MIN_RSSI,
            max_rssi: DEFAULT_MAX_RSSI,
        }
    }
}

impl GenerationOptions {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            min_bin_width: config.min_bin_width,
            max_bin_width: config.max_bin_width,
            smoothing: config.smoothing,
            kernel_radius_multiplier: config.kernel_radius_multiplier,
            min_rssi: config.min_rssi,
            max_rssi: config.max_rssi,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_bin_width < 1 || self.min_bin_width > self.max_bin_width {
            return Err(RssiLocatorError::InvalidConfiguration(format!(
                "bin width range must satisfy 1 <= min <= max, got {}..={}",
                self.min_bin_width, self.max_bin_width
            )));
        }
        validate_range(self.min_bin_width, self.min_rssi, self.max_rssi)
    }

    pub fn bin_widths(&self) -> RangeInclusive<i32> {
        self.min_bin_width..=self.max_bin_width
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub persisted_per_bin_width: BTreeMap<i32, usize>,
    /// Records dropped because every bin ended up zero.
    pub skipped_empty: usize,
    pub failed_bin_widths: Vec<i32>,
}

impl GenerationSummary {
    pub fn total_persisted(&self) -> usize {
        self.persisted_per_bin_width.values().sum()
    }
}

/// Turns loaded histograms into PMF records for FIXED APs only.
/// Returns the records and how many were dropped for summing to zero.
pub fn build_pmfs(histograms: &CellHistograms, fixed_aps: &BTreeSet<String>, options: &GenerationOptions) -> (Vec<ApPmf>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;
    for (cell, by_ap) in histograms {
        for (ap, histogram) in by_ap {
            if !fixed_aps.contains(ap) || histogram.total_count() == 0 {
                continue;
            }
            let bins = match options.smoothing {
                SmoothingKind::None => histogram.bins().clone(),
                SmoothingKind::Gaussian => histogram
                    .gaussian_smoothed_counts(f64::from(histogram.bin_width()), options.kernel_radius_multiplier),
            };
            if bins.values().all(|&c| c == 0) {
                debug!("Skipping all-zero PMF for AP {ap} in cell {cell}");
                skipped += 1;
                continue;
            }
            records.push(ApPmf::from_histogram(ap, cell, histogram, bins));
        }
    }
    (records, skipped)
}

fn build_for_width(
    source: &Arc<dyn MeasurementSource>,
    fixed_aps: &BTreeSet<String>,
    bin_width: i32,
    options: &GenerationOptions,
) -> Result<(Vec<ApPmf>, usize)> {
    let manager = HistogramManager::with_range(Arc::clone(source), bin_width, options.min_rssi, options.max_rssi)?;
    manager.load_and_process_all_histograms()?;
    Ok(build_pmfs(&manager.all_histograms_by_cell(), fixed_aps, options))
}

/// Builds and persists PMFs for every bin width in the configured range.
/// Widths are built in parallel; each width's batch is persisted in one call.
pub fn generate_pmfs(
    source: Arc<dyn MeasurementSource>,
    registry: &dyn ApRegistry,
    store: &dyn PmfStore,
    options: &GenerationOptions,
) -> Result<GenerationSummary> {
    options.validate()?;
    let fixed_aps = registry.fetch_fixed_ap_identities()?;
    if fixed_aps.is_empty() {
        warn!("No FIXED APs registered, no PMFs will be generated");
    }
    info!(
        "Generating PMFs for bin widths {}..={} ({} smoothing, {} fixed APs)",
        options.min_bin_width,
        options.max_bin_width,
        options.smoothing,
        fixed_aps.len()
    );

    let widths: Vec<i32> = options.bin_widths().collect();
    let built: Vec<(i32, Result<(Vec<ApPmf>, usize)>)> = widths
        .par_iter()
        .map(|&w| (w, build_for_width(&source, &fixed_aps, w, options)))
        .collect();

    let mut summary = GenerationSummary::default();
    for (bin_width, result) in built {
        match result {
            Ok((records, skipped)) => {
                if !records.is_empty() {
                    store.persist_pmfs(&records)?;
                }
                debug!("Bin width {bin_width}: persisted {} PMFs, skipped {skipped}", records.len());
                summary.persisted_per_bin_width.insert(bin_width, records.len());
                summary.skipped_empty += skipped;
            }
            Err(e) => {
                warn!("Skipping bin width {bin_width}: {e}");
                summary.failed_bin_widths.push(bin_width);
            }
        }
    }
    info!(
        "Generated {} PMFs across {} bin widths",
        summary.total_persisted(),
        summary.persisted_per_bin_width.len()
    );
    Ok(summary)
}
