use log::{debug, info};
use rayon::prelude::*;
use rssi_locator_common::{PredictionSettings, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::model::{MeasurementKind, Sample};
use crate::predictor::{BayesianPredictor, PmfModel};
use crate::scan::{average_readings, best_cell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStatus {
    Correct,
    Incorrect,
    /// The predictor had nothing to work with (no PMFs or no fixed APs).
    NoPrediction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    /// Timestamp of the newest scan in the window.
    pub timestamp_millis: i64,
    pub actual_cell: String,
    pub predicted_cell: Option<String>,
    pub probability: Option<f64>,
    pub status: WindowStatus,
    pub averaged_scan: BTreeMap<String, i32>,
    pub posterior: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub total_windows: usize,
    pub correct: usize,
    pub accuracy_pct: f64,
    pub windows: Vec<WindowResult>,
}

impl EvaluationReport {
    fn from_windows(windows: Vec<WindowResult>) -> Self {
        let total_windows = windows.len();
        let correct = windows.iter().filter(|w| w.status == WindowStatus::Correct).count();
        let accuracy_pct = if total_windows > 0 {
            correct as f64 / total_windows as f64 * 100.0
        } else {
            0.0
        };
        Self { total_windows, correct, accuracy_pct, windows }
    }
}

// every reading of one scan event; an AP identity may repeat
type ScanEvent<'a> = Vec<(&'a str, i32)>;

// one cell's TESTING scans in timestamp order
#[derive(Default)]
struct CellScans<'a> {
    timestamps: Vec<i64>,
    scans: Vec<ScanEvent<'a>>,
}

// Scan events are built from samples, so none of them is ever empty.
fn group_scan_events(samples: &[Sample]) -> BTreeMap<&str, CellScans<'_>> {
    let mut events: BTreeMap<&str, BTreeMap<i64, ScanEvent<'_>>> = BTreeMap::new();
    for s in samples.iter().filter(|s| s.kind == MeasurementKind::Testing) {
        events
            .entry(s.cell.as_str())
            .or_default()
            .entry(s.timestamp_millis)
            .or_default()
            .push((s.ap.as_str(), s.rssi));
    }
    events
        .into_iter()
        .map(|(cell, by_time)| {
            let (timestamps, scans) = by_time.into_iter().unzip();
            (cell, CellScans { timestamps, scans })
        })
        .collect()
}

struct WindowJob<'a> {
    cell: &'a str,
    timestamp_millis: i64,
    scans: &'a [ScanEvent<'a>],
}

fn evaluate_window(job: &WindowJob<'_>, model: Option<&PmfModel>, settings: &PredictionSettings, cells: &[String]) -> WindowResult {
    let averaged = average_readings(job.scans.iter().flatten().copied());
    let mut result = WindowResult {
        timestamp_millis: job.timestamp_millis,
        actual_cell: job.cell.to_string(),
        predicted_cell: None,
        probability: None,
        status: WindowStatus::NoPrediction,
        averaged_scan: averaged.iter().map(|(ap, &rssi)| (ap.clone(), rssi)).collect(),
        posterior: BTreeMap::new(),
    };
    result.posterior = model
        .map(|m| m.predict(&averaged, settings.mode, settings.cutoff_probability, cells).posterior)
        .unwrap_or_default();
    match best_cell(&result.posterior, cells) {
        Some((cell, p)) => {
            result.status = if cell == job.cell { WindowStatus::Correct } else { WindowStatus::Incorrect };
            result.predicted_cell = Some(cell);
            result.probability = Some(p);
        }
        None => result.status = WindowStatus::NoPrediction,
    }
    result
}

/// Replays TESTING scans through the predictor in sliding windows of
/// `settings.scans_for_averaging` consecutive scans per cell.
pub fn evaluate(
    samples: &[Sample],
    predictor: &BayesianPredictor,
    settings: &PredictionSettings,
    cells: &[String],
) -> Result<EvaluationReport> {
    let window = settings.scans_for_averaging;
    let by_cell = group_scan_events(samples);
    let total_events: usize = by_cell.values().map(|c| c.scans.len()).sum();
    if window == 0 || total_events < window {
        info!("Not enough TESTING scans to evaluate ({total_events} scans, windows of {window})");
        return Ok(EvaluationReport::default());
    }

    let mut jobs = Vec::new();
    for (&cell, events) in &by_cell {
        let n = events.scans.len();
        if n < window {
            debug!("Cell {cell} has {n} TESTING scans, fewer than {window}; skipping");
            continue;
        }
        for end in (window - 1)..n {
            jobs.push(WindowJob {
                cell,
                timestamp_millis: events.timestamps[end],
                scans: &events.scans[end + 1 - window..=end],
            });
        }
    }

    // one model snapshot for every window
    let model = predictor.load_model(settings.pmf_bin_width)?;
    let windows: Vec<WindowResult> = jobs
        .par_iter()
        .map(|job| evaluate_window(job, model.as_ref(), settings, cells))
        .collect();
    let report = EvaluationReport::from_windows(windows);
    info!(
        "Evaluated {} windows: {} correct ({:.2}%)",
        report.total_windows, report.correct, report.accuracy_pct
    );
    Ok(report)
}

pub fn export_evaluation_json(output_path: &Path, report: &EvaluationReport) -> Result<()> {
    let mut file = std::fs::File::create(output_path)?;
    serde_json::to_writer_pretty(&mut file, report)?;
    Ok(())
}
