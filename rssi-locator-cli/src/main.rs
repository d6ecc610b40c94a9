use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};
use rssi_locator_common::{Config, PredictionConfig};
use rssi_locator_core::{
    average_scans, best_cell, evaluate, export_evaluation_json, generate_pmfs, BayesianMode, BayesianPredictor,
    GenerationOptions, HistogramManager, JsonFileStore, MeasurementSource, PmfStore, PredictionSettings,
    SmoothingKind,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn parse_reading(s: &str) -> Result<(String, i32), String> { // AP=RSSI, split on the last '='
    let (ap, rssi) = s.rsplit_once('=').ok_or_else(|| format!("expected AP=RSSI, got {s}"))?;
    let ap = ap.trim();
    if ap.is_empty() {
        return Err(format!("missing AP identity in {s}"));
    }
    let rssi: i32 = rssi.trim().parse().map_err(|_| format!("not an integer RSSI: {rssi}"))?;
    Ok((ap.to_string(), rssi))
}

fn parse_bin_width(s: &str) -> Result<i32, String> {
    let v: i32 = s.parse().map_err(|_| format!("not an integer: {s}"))?;
    if v >= 1 { Ok(v) } else { Err(format!("bin width must be at least 1, got {v}")) }
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("not a float: {s}"))?;
    if (0.0..=1.0).contains(&v) { Ok(v) } else { Err(format!("probability must be in [0.0, 1.0], got {v}")) }
}

#[derive(Parser)]
#[command(name = "rssi-locator", version, about = "Indoor cell localization from WiFi RSSI fingerprints")]
struct Cli {
    /// Store directory (defaults to the configured or platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a survey dataset (samples + known APs) into the store
    Import { path: PathBuf },
    /// Build PMFs for a range of bin widths from TRAINING samples
    Generate {
        #[arg(long, value_parser = parse_bin_width)] min_bin_width: Option<i32>,
        #[arg(long, value_parser = parse_bin_width)] max_bin_width: Option<i32>,
        #[arg(long)] smooth: Option<SmoothingKind>,
    },
    /// Predict the current cell from live readings or a file of scans
    Predict {
        #[arg(long)] mode: Option<BayesianMode>,
        #[arg(long, value_parser = parse_bin_width)] bin_width: Option<i32>,
        #[arg(long, value_parser = parse_probability)] cutoff: Option<f64>,
        #[arg(long = "rssi", value_parser = parse_reading)] readings: Vec<(String, i32)>,
        #[arg(long, conflicts_with = "readings")] scan_file: Option<PathBuf>,
    },
    /// Replay TESTING scans through the predictor and report accuracy
    Evaluate {
        #[arg(long)] mode: Option<BayesianMode>,
        #[arg(long, value_parser = parse_bin_width)] bin_width: Option<i32>,
        #[arg(long, value_parser = parse_probability)] cutoff: Option<f64>,
        #[arg(long)] scans: Option<usize>,
        #[arg(long)] export: Option<PathBuf>,
    },
    /// Show the histogram of one AP in one cell
    Histogram {
        #[arg(long)] cell: String,
        #[arg(long)] ap: String,
        #[arg(long, default_value_t = 1, value_parser = parse_bin_width)] bin_width: i32,
        #[arg(long)] smooth: bool,
    },
    /// List stored PMF bin widths and record counts
    Pmfs,
    /// Remove every stored PMF
    ClearPmfs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let config = Config::load().unwrap_or_else(|e| {
        warn!("Ignoring unreadable config: {e}");
        Config::default()
    });
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.store.resolve_data_dir());
    let store = Arc::new(
        JsonFileStore::open(&data_dir).with_context(|| format!("opening store at {}", data_dir.display()))?,
    );

    match cli.command {
        Commands::Import { path } => run_import(&store, &path)?,
        Commands::Generate { min_bin_width, max_bin_width, smooth } => {
            run_generate(&store, &config, min_bin_width, max_bin_width, smooth)?
        }
        Commands::Predict { mode, bin_width, cutoff, readings, scan_file } => {
            let settings = prediction_settings(&config.prediction, mode, bin_width, cutoff, None)?;
            run_predict(&store, &config, &settings, readings, scan_file.as_deref())?
        }
        Commands::Evaluate { mode, bin_width, cutoff, scans, export } => {
            let settings = prediction_settings(&config.prediction, mode, bin_width, cutoff, scans)?;
            run_evaluate(&store, &config, &settings, export.as_deref())?
        }
        Commands::Histogram { cell, ap, bin_width, smooth } => run_histogram(&store, &config, &cell, &ap, bin_width, smooth)?,
        Commands::Pmfs => run_pmfs(&store)?,
        Commands::ClearPmfs => {
            store.clear_pmfs()?;
            println!("All PMF records removed.");
        }
    }
    Ok(())
}

fn prediction_settings(
    base: &PredictionConfig,
    mode: Option<BayesianMode>,
    bin_width: Option<i32>,
    cutoff: Option<f64>,
    scans: Option<usize>,
) -> anyhow::Result<PredictionSettings> {
    let mut cfg = base.clone();
    if let Some(m) = mode { cfg.mode = m; }
    if let Some(w) = bin_width { cfg.pmf_bin_width = w; }
    if let Some(c) = cutoff { cfg.cutoff_probability = c; }
    if let Some(n) = scans { cfg.scans_for_averaging = n; }
    Ok(cfg.to_settings()?)
}

fn run_import(store: &JsonFileStore, path: &Path) -> anyhow::Result<()> {
    let dataset = store
        .import_dataset(path)
        .with_context(|| format!("importing {}", path.display()))?;
    println!("{:<16} {}", "Samples:", dataset.samples.len());
    println!("{:<16} {}", "Known APs:", dataset.known_aps.len());
    println!("{:<16} {}", "Store:", store.dir().display());
    Ok(())
}

fn run_generate(
    store: &Arc<JsonFileStore>,
    config: &Config,
    min_bin_width: Option<i32>,
    max_bin_width: Option<i32>,
    smooth: Option<SmoothingKind>,
) -> anyhow::Result<()> {
    let mut options = GenerationOptions::from_config(&config.generation);
    if let Some(w) = min_bin_width { options.min_bin_width = w; }
    if let Some(w) = max_bin_width { options.max_bin_width = w; }
    if let Some(s) = smooth { options.smoothing = s; }
    let source: Arc<dyn MeasurementSource> = store.clone();
    let summary = generate_pmfs(source, store.as_ref(), store.as_ref(), &options)?;
    for (width, count) in &summary.persisted_per_bin_width {
        println!("bin width {width:>3}: {count} PMFs");
    }
    if !summary.failed_bin_widths.is_empty() {
        println!("failed bin widths: {:?}", summary.failed_bin_widths);
    }
    println!("{:<16} {}", "Persisted:", summary.total_persisted());
    println!("{:<16} {}", "Skipped empty:", summary.skipped_empty);
    Ok(())
}

// SERIAL still walks every FIXED AP with the -100 stand-in, so an empty
// observation is usable there; PARALLEL would only echo the uniform prior.
fn check_observation(live: &HashMap<String, i32>, mode: BayesianMode) -> anyhow::Result<()> {
    if !live.is_empty() {
        return Ok(());
    }
    match mode {
        BayesianMode::Serial => {
            warn!("Empty observation: every FIXED AP is treated as unheard");
            Ok(())
        }
        BayesianMode::Parallel => {
            anyhow::bail!("No readings given: pass --rssi AP=RSSI or --scan-file (or use --mode serial)")
        }
    }
}

fn load_live_scan(
    readings: Vec<(String, i32)>,
    scan_file: Option<&Path>,
    scans_for_averaging: usize,
) -> anyhow::Result<HashMap<String, i32>> {
    let Some(path) = scan_file else {
        return Ok(readings.into_iter().collect());
    };
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let scans: Vec<HashMap<String, i32>> =
        serde_json::from_str(&content).with_context(|| format!("{} is not a list of AP->RSSI scans", path.display()))?;
    let start = scans.len().saturating_sub(scans_for_averaging);
    info!("Averaging the last {} of {} scans", scans.len() - start, scans.len());
    Ok(average_scans(&scans[start..]))
}

fn run_predict(
    store: &Arc<JsonFileStore>,
    config: &Config,
    settings: &PredictionSettings,
    readings: Vec<(String, i32)>,
    scan_file: Option<&Path>,
) -> anyhow::Result<()> {
    let live = load_live_scan(readings, scan_file, settings.scans_for_averaging)?;
    check_observation(&live, settings.mode)?;
    let predictor = BayesianPredictor::new(store.clone(), store.clone());
    let cells = &config.cells.labels;
    let posterior = predictor.predict(&live, settings, cells)?;
    if posterior.is_empty() {
        println!("No prediction possible (no PMFs for bin width {} or no FIXED APs).", settings.pmf_bin_width);
        return Ok(());
    }
    let mut ranked: Vec<(&String, &f64)> = posterior.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(a.1));
    for (cell, p) in ranked {
        println!("{cell:<12} {p:.4}");
    }
    if let Some((cell, p)) = best_cell(&posterior, cells) {
        println!("{:<16} {cell} ({p:.3}, {} mode)", "Best cell:", settings.mode);
    }
    Ok(())
}

fn run_evaluate(
    store: &Arc<JsonFileStore>,
    config: &Config,
    settings: &PredictionSettings,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let predictor = BayesianPredictor::new(store.clone(), store.clone());
    let report = evaluate(&store.fetch_samples()?, &predictor, settings, &config.cells.labels)?;
    if report.total_windows == 0 {
        println!("Not enough TESTING scans for {}-scan windows.", settings.scans_for_averaging);
    }
    for w in &report.windows {
        println!(
            "{:>14} true {:<6} pred {:<6} prob {:<6} {:?}",
            w.timestamp_millis,
            w.actual_cell,
            w.predicted_cell.as_deref().unwrap_or("N/A"),
            w.probability.map(|p| format!("{p:.3}")).unwrap_or_else(|| "N/A".into()),
            w.status
        );
    }
    println!("{:<16} {}", "Windows:", report.total_windows);
    println!("{:<16} {}", "Correct:", report.correct);
    println!("{:<16} {:.2}%", "Accuracy:", report.accuracy_pct);
    if let Some(path) = export {
        export_evaluation_json(path, &report)?;
        println!("{:<16} {}", "Exported:", path.display());
    }
    Ok(())
}

fn run_histogram(
    store: &Arc<JsonFileStore>,
    config: &Config,
    cell: &str,
    ap: &str,
    bin_width: i32,
    smooth: bool,
) -> anyhow::Result<()> {
    let generation = &config.generation;
    let manager = HistogramManager::with_range(store.clone(), bin_width, generation.min_rssi, generation.max_rssi)?;
    manager.load_and_process_all_histograms()?;
    let Some(histogram) = manager.get_histogram(cell, ap) else {
        anyhow::bail!("No TRAINING data for AP {ap} in cell {cell}");
    };
    let smoothed = smooth.then(|| histogram.gaussian_smoothed_counts(f64::from(bin_width), generation.kernel_radius_multiplier));
    for bin in histogram.bin_ranges().iter().filter(|b| b.count > 0 || smoothed.is_some()) {
        match smoothed.as_ref().and_then(|s| s.get(&bin.range_start)) {
            Some(s) => println!("[{:>4}, {:>4}] {:>5} {:>5}", bin.range_start, bin.range_end, bin.count, s),
            None => println!("[{:>4}, {:>4}] {:>5}", bin.range_start, bin.range_end, bin.count),
        }
    }
    println!("{:<16} {}", "Readings:", histogram.total_count());
    println!("{:<16} {:.1}", "Approx. mean:", histogram.approximate_average_rssi());
    Ok(())
}

fn run_pmfs(store: &JsonFileStore) -> anyhow::Result<()> {
    let summary = store.pmf_summary()?;
    if summary.is_empty() {
        println!("No PMFs stored.");
    }
    for (width, count) in summary {
        println!("bin width {width:>3}: {count} PMFs");
    }
    Ok(())
}
