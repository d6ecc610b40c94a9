use rssi_locator_common::{Result, RssiLocatorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MIN_RSSI: i32 = -100;
pub const DEFAULT_MAX_RSSI: i32 = 0;
pub const DEFAULT_KERNEL_RADIUS_MULTIPLIER: u32 = 3;

const NEGLIGIBLE_SUM: f64 = 1e-9;

/// Display row: inclusive RSSI range covered by one bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub range_start: i32,
    pub range_end: i32,
    pub count: u32,
}

/// Start of the bin that `rssi` falls in, for bins laid out from `min_rssi` in steps of `bin_width`.
/// Callers keep `rssi >= min_rssi` and `bin_width > 0`.
pub fn bin_start(rssi: i32, min_rssi: i32, bin_width: i32) -> i32 {
    min_rssi + (rssi - min_rssi).div_euclid(bin_width) * bin_width
}

pub(crate) fn validate_range(bin_width: i32, min_rssi: i32, max_rssi: i32) -> Result<()> {
    if bin_width <= 0 {
        return Err(RssiLocatorError::InvalidConfiguration(format!(
            "bin width must be positive, got {bin_width}"
        )));
    }
    if min_rssi > max_rssi {
        return Err(RssiLocatorError::InvalidConfiguration(format!(
            "min rssi {min_rssi} is above max rssi {max_rssi}"
        )));
    }
    Ok(())
}

/// Fixed-range RSSI histogram. Every bin start in range is present, possibly with a zero count.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bin_width: i32,
    min_rssi: i32,
    max_rssi: i32,
    bins: BTreeMap<i32, u32>,
    total_count: u32,
}

impl Histogram {
    pub fn new(measurements: &[i32], bin_width: i32, min_rssi: i32, max_rssi: i32) -> Result<Self> {
        validate_range(bin_width, min_rssi, max_rssi)?;
        let mut bins: BTreeMap<i32, u32> = (min_rssi..=max_rssi)
            .step_by(bin_width as usize)
            .map(|start| (start, 0))
            .collect();
        let mut total_count = 0;
        for &rssi in measurements {
            if rssi < min_rssi || rssi > max_rssi {
                continue; // out-of-range readings are dropped, not clamped
            }
            if let Some(count) = bins.get_mut(&bin_start(rssi, min_rssi, bin_width)) {
                *count += 1;
                total_count += 1;
            }
        }
        Ok(Self { bin_width, min_rssi, max_rssi, bins, total_count })
    }

    pub fn with_default_range(measurements: &[i32], bin_width: i32) -> Result<Self> {
        Self::new(measurements, bin_width, DEFAULT_MIN_RSSI, DEFAULT_MAX_RSSI)
    }

    pub fn bin_width(&self) -> i32 { self.bin_width }
    pub fn min_rssi(&self) -> i32 { self.min_rssi }
    pub fn max_rssi(&self) -> i32 { self.max_rssi }
    pub fn bins(&self) -> &BTreeMap<i32, u32> { &self.bins }
    pub fn total_count(&self) -> u32 { self.total_count }

    pub fn count_for_rssi(&self, rssi: i32) -> u32 {
        if rssi < self.min_rssi || rssi > self.max_rssi {
            return 0;
        }
        self.bins
            .get(&bin_start(rssi, self.min_rssi, self.bin_width))
            .copied()
            .unwrap_or(0)
    }

    pub fn pmf(&self) -> BTreeMap<i32, f64> {
        if self.total_count == 0 {
            return self.bins.keys().map(|&start| (start, 0.0)).collect();
        }
        let total = f64::from(self.total_count);
        self.bins
            .iter()
            .map(|(&start, &count)| (start, f64::from(count) / total))
            .collect()
    }

    /// Probability-weighted mean of bin centers; `min_rssi` when empty.
    pub fn approximate_average_rssi(&self) -> f64 {
        if self.total_count == 0 {
            return f64::from(self.min_rssi);
        }
        let half_width = f64::from(self.bin_width) / 2.0;
        self.pmf()
            .into_iter()
            .map(|(start, p)| (f64::from(start) + half_width) * p)
            .sum()
    }

    pub fn bin_ranges(&self) -> Vec<HistogramBin> {
        self.bins
            .iter()
            .map(|(&start, &count)| HistogramBin {
                range_start: start,
                range_end: (start + self.bin_width - 1).min(self.max_rssi),
                count,
            })
            .collect()
    }

    /// Convolves the counts with a discrete Gaussian over bin offsets, rescales to the
    /// original total and rounds. Returns a fresh map with the same bin starts.
    pub fn gaussian_smoothed_counts(&self, sigma: f64, kernel_radius_multiplier: u32) -> BTreeMap<i32, u32> {
        if self.bins.is_empty() || !(sigma > 0.0) || !sigma.is_finite() {
            return self.bins.clone();
        }
        if self.total_count == 0 {
            return self.bins.keys().map(|&start| (start, 0)).collect();
        }

        // taps further out than the bin count only ever land in the zero padding
        let kernel = gaussian_kernel(sigma, self.bin_width, kernel_radius_multiplier, self.bins.len());
        let center = (kernel.len() / 2) as isize;
        let counts: Vec<f64> = self.bins.values().map(|&c| f64::from(c)).collect();
        let n = counts.len() as isize;

        let smoothed: Vec<f64> = (0..n)
            .map(|i| {
                kernel
                    .iter()
                    .enumerate()
                    .filter_map(|(k, &weight)| {
                        let j = i + k as isize - center;
                        // taps past either end of the range contribute nothing
                        if (0..n).contains(&j) {
                            counts.get(j as usize).map(|&c| c * weight)
                        } else {
                            None
                        }
                    })
                    .sum()
            })
            .collect();

        let smoothed_sum: f64 = smoothed.iter().sum();
        if smoothed_sum <= NEGLIGIBLE_SUM {
            return self.bins.keys().map(|&start| (start, 0)).collect();
        }
        let scale = f64::from(self.total_count) / smoothed_sum;
        self.bins
            .keys()
            .zip(smoothed)
            .map(|(&start, value)| (start, (value * scale).round() as u32))
            .collect()
    }
}

/// Normalized Gaussian weights for offsets `-r..=r` bins,
/// `r = min(ceil(mult * sigma / bin_width), max_radius)`.
fn gaussian_kernel(sigma: f64, bin_width: i32, kernel_radius_multiplier: u32, max_radius: usize) -> Vec<f64> {
    if !(sigma > 0.0) || bin_width <= 0 {
        return vec![1.0];
    }
    let width = f64::from(bin_width);
    let radius = (f64::from(kernel_radius_multiplier) * sigma / width)
        .ceil()
        .min(max_radius as f64) as usize;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let distance = (i as f64 - radius as f64) * width;
            (-0.5 * (distance / sigma).powi(2)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    if sum > NEGLIGIBLE_SUM {
        kernel.iter_mut().for_each(|w| *w /= sum);
    } else {
        // degenerate sigma, collapse to a delta at the center
        kernel.iter_mut().for_each(|w| *w = 0.0);
        if let Some(mid) = kernel.get_mut(radius) {
            *mid = 1.0;
        }
    }
    kernel
}
