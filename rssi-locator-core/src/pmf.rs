use rssi_locator_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::histogram::{bin_start, Histogram, DEFAULT_MAX_RSSI, DEFAULT_MIN_RSSI};

/// (ap, cell, bin width): at most one stored PMF per key.
pub type PmfKey = (String, String, i32);

/// Durable form of one histogram: the only evidence the predictor reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApPmf {
    pub ap: String,
    pub cell: String,
    pub bin_width: i32,
    pub bins_data: BTreeMap<i32, u32>, // bin start -> count
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i32,
    #[serde(default = "default_max_rssi")]
    pub max_rssi: i32,
}

fn default_min_rssi() -> i32 {
    DEFAULT_MIN_RSSI
}
fn default_max_rssi() -> i32 {
    DEFAULT_MAX_RSSI
}

impl ApPmf {
    pub fn new(ap: impl Into<String>, cell: impl Into<String>, bin_width: i32, bins_data: BTreeMap<i32, u32>) -> Self {
        Self {
            ap: ap.into(),
            cell: cell.into(),
            bin_width,
            bins_data,
            min_rssi: DEFAULT_MIN_RSSI,
            max_rssi: DEFAULT_MAX_RSSI,
        }
    }

    /// Takes the histogram's range and width; `bins_data` may be raw or smoothed counts.
    pub fn from_histogram(ap: &str, cell: &str, histogram: &Histogram, bins_data: BTreeMap<i32, u32>) -> Self {
        Self {
            ap: ap.to_string(),
            cell: cell.to_string(),
            bin_width: histogram.bin_width(),
            bins_data,
            min_rssi: histogram.min_rssi(),
            max_rssi: histogram.max_rssi(),
        }
    }

    pub fn key(&self) -> PmfKey {
        (self.ap.clone(), self.cell.clone(), self.bin_width)
    }

    /// Bin start for `rssi` after clamping it into the stored range.
    pub fn bin_start_for_rssi(&self, rssi: i32) -> i32 {
        if self.bin_width <= 0 || self.min_rssi > self.max_rssi {
            return self.min_rssi;
        }
        bin_start(rssi.clamp(self.min_rssi, self.max_rssi), self.min_rssi, self.bin_width)
    }

    pub fn total_count(&self) -> u64 {
        self.bins_data.values().map(|&c| u64::from(c)).sum()
    }

    pub fn count_for_rssi(&self, rssi: i32) -> u32 {
        self.bins_data
            .get(&self.bin_start_for_rssi(rssi))
            .copied()
            .unwrap_or(0)
    }

    /// count / total per bin; all zero when the record is empty.
    pub fn probabilities(&self) -> BTreeMap<i32, f64> {
        let total = self.total_count();
        self.bins_data
            .iter()
            .map(|(&start, &count)| {
                let p = if total == 0 { 0.0 } else { f64::from(count) / total as f64 };
                (start, p)
            })
            .collect()
    }
}

pub fn encode_bins(bins: &BTreeMap<i32, u32>) -> Result<String> {
    Ok(serde_json::to_string(bins)?)
}

pub fn decode_bins(text: &str) -> Result<BTreeMap<i32, u32>> {
    Ok(serde_json::from_str(text)?)
}
