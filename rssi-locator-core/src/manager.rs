use log::{debug, error, info, warn};
use rssi_locator_common::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::histogram::{validate_range, Histogram, DEFAULT_MAX_RSSI, DEFAULT_MIN_RSSI};
use crate::store::MeasurementSource;

/// cell -> AP identity -> histogram
pub type CellHistograms = BTreeMap<String, BTreeMap<String, Histogram>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded { cells: usize, histograms: usize },
    /// Load finished but there was no training data.
    Empty,
    /// Another load was in flight; nothing changed.
    AlreadyLoading,
}

#[derive(Default)]
struct Snapshot {
    histograms: Arc<CellHistograms>,
    data_loaded: bool,
}

struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Groups training samples by (cell, AP) and keeps one histogram per group.
pub struct HistogramManager {
    source: Arc<dyn MeasurementSource>,
    bin_width: i32,
    min_rssi: i32,
    max_rssi: i32,
    snapshot: RwLock<Snapshot>,
    loading: AtomicBool,
}

impl HistogramManager {
    pub fn new(source: Arc<dyn MeasurementSource>, bin_width: i32) -> Result<Self> {
        Self::with_range(source, bin_width, DEFAULT_MIN_RSSI, DEFAULT_MAX_RSSI)
    }

    pub fn with_range(source: Arc<dyn MeasurementSource>, bin_width: i32, min_rssi: i32, max_rssi: i32) -> Result<Self> {
        validate_range(bin_width, min_rssi, max_rssi)?;
        Ok(Self {
            source,
            bin_width,
            min_rssi,
            max_rssi,
            snapshot: RwLock::new(Snapshot::default()),
            loading: AtomicBool::new(false),
        })
    }

    pub fn bin_width(&self) -> i32 {
        self.bin_width
    }

    pub fn is_data_loaded(&self) -> bool {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).data_loaded
    }

    fn publish(&self, histograms: CellHistograms, data_loaded: bool) {
        let mut snap = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snap = Snapshot { histograms: Arc::new(histograms), data_loaded };
    }

    /// Rebuilds every histogram from the source's TRAINING samples. A call made while
    /// another is running returns `AlreadyLoading` and leaves state alone. On failure
    /// the cached histograms are dropped and the error is returned.
    pub fn load_and_process_all_histograms(&self) -> Result<LoadStatus> {
        if self
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Histograms are already being loaded");
            return Ok(LoadStatus::AlreadyLoading);
        }
        let _flag = LoadingFlag(&self.loading);
        debug!("Loading TRAINING histograms with bin width {}", self.bin_width);

        match self.build() {
            Ok(histograms) if histograms.is_empty() => {
                warn!("No TRAINING data found, nothing to build histograms from");
                self.publish(CellHistograms::new(), true);
                Ok(LoadStatus::Empty)
            }
            Ok(histograms) => {
                let cells = histograms.len();
                let count: usize = histograms.values().map(BTreeMap::len).sum();
                self.publish(histograms, true);
                info!("Built {count} histograms across {cells} cells (bin width {})", self.bin_width);
                Ok(LoadStatus::Loaded { cells, histograms: count })
            }
            Err(e) => {
                error!("Failed to load histograms: {e}");
                self.publish(CellHistograms::new(), false);
                Err(e)
            }
        }
    }

    fn build(&self) -> Result<CellHistograms> {
        let samples = self.source.fetch_training_samples()?;
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<i32>>> = BTreeMap::new();
        for s in samples {
            grouped
                .entry(s.cell)
                .or_default()
                .entry(s.ap)
                .or_default()
                .push(s.rssi);
        }
        let mut out = CellHistograms::new();
        for (cell, by_ap) in grouped {
            let mut cell_histograms = BTreeMap::new();
            for (ap, readings) in by_ap {
                if readings.is_empty() {
                    continue;
                }
                let h = Histogram::new(&readings, self.bin_width, self.min_rssi, self.max_rssi)?;
                cell_histograms.insert(ap, h);
            }
            if !cell_histograms.is_empty() {
                out.insert(cell, cell_histograms);
            }
        }
        Ok(out)
    }

    pub fn get_histogram(&self, cell: &str, ap: &str) -> Option<Histogram> {
        let snap = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        if !snap.data_loaded {
            warn!("Histogram for {ap} in {cell} requested before histograms were loaded");
            return None;
        }
        snap.histograms.get(cell)?.get(ap).cloned()
    }

    pub fn all_histograms_by_cell(&self) -> Arc<CellHistograms> {
        let snap = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        if !snap.data_loaded {
            warn!("All histograms requested before histograms were loaded");
        }
        Arc::clone(&snap.histograms)
    }

    pub fn clear_data(&self) {
        self.publish(CellHistograms::new(), false);
        debug!("Cleared loaded histogram data");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MeasurementKind, Sample};
    use crate::store::InMemoryStore;
    use rssi_locator_common::RssiLocatorError;
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn sample(cell: &str, ap: &str, rssi: i32, kind: MeasurementKind) -> Sample {
        Sample { ap: ap.into(), rssi, cell: cell.into(), timestamp_millis: 0, kind }
    }

    fn store_with(samples: Vec<Sample>) -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store.add_samples(samples);
        Arc::new(store)
    }

    struct FlakySource {
        offline: AtomicBool,
        inner: InMemoryStore,
    }

    impl MeasurementSource for FlakySource {
        fn fetch_samples(&self) -> Result<Vec<Sample>> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(RssiLocatorError::Storage("database offline".into()));
            }
            self.inner.fetch_samples()
        }
    }

    // blocks inside fetch until released, so a second load can race the first
    struct GatedSource {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        inner: InMemoryStore,
    }

    impl MeasurementSource for GatedSource {
        fn fetch_samples(&self) -> Result<Vec<Sample>> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.fetch_samples()
        }
    }

    #[test]
    fn groups_training_samples_by_cell_and_ap() {
        let store = store_with(vec![
            sample("C1", "a", -50, MeasurementKind::Training),
            sample("C1", "a", -52, MeasurementKind::Training),
            sample("C1", "b", -70, MeasurementKind::Training),
            sample("C2", "a", -80, MeasurementKind::Training),
            sample("C3", "a", -40, MeasurementKind::Testing),
        ]);
        let manager = HistogramManager::new(store, 1).unwrap();
        assert!(!manager.is_data_loaded());
        let status = manager.load_and_process_all_histograms().unwrap();
        assert_eq!(status, LoadStatus::Loaded { cells: 2, histograms: 3 });
        assert!(manager.is_data_loaded());
        assert_eq!(manager.get_histogram("C1", "a").unwrap().total_count(), 2);
        assert!(manager.get_histogram("C3", "a").is_none()); // testing data is ignored
        let all = manager.all_histograms_by_cell();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["C1", "C2"]);
    }

    #[test]
    fn uses_configured_bin_width_and_range() {
        let store = store_with(vec![sample("C1", "a", -55, MeasurementKind::Training)]);
        let manager = HistogramManager::with_range(store, 5, -90, -30).unwrap();
        manager.load_and_process_all_histograms().unwrap();
        let h = manager.get_histogram("C1", "a").unwrap();
        assert_eq!((h.bin_width(), h.min_rssi(), h.max_rssi()), (5, -90, -30));
        assert_eq!(h.bins()[&-55], 1);
    }

    #[test]
    fn no_training_data_is_loaded_and_empty() {
        let store = store_with(vec![sample("C1", "a", -50, MeasurementKind::Testing)]);
        let manager = HistogramManager::new(store, 1).unwrap();
        assert_eq!(manager.load_and_process_all_histograms().unwrap(), LoadStatus::Empty);
        assert!(manager.is_data_loaded());
        assert!(manager.all_histograms_by_cell().is_empty());
    }

    #[test]
    fn lookup_before_load_returns_none() {
        let store = store_with(vec![sample("C1", "a", -50, MeasurementKind::Training)]);
        let manager = HistogramManager::new(store, 1).unwrap();
        assert!(manager.get_histogram("C1", "a").is_none());
        assert!(manager.all_histograms_by_cell().is_empty());
    }

    #[test]
    fn failed_load_clears_previous_data() {
        let inner = InMemoryStore::new();
        inner.add_samples([sample("C1", "a", -50, MeasurementKind::Training)]);
        let source = Arc::new(FlakySource { offline: AtomicBool::new(false), inner });
        let manager = HistogramManager::new(source.clone(), 1).unwrap();
        manager.load_and_process_all_histograms().unwrap();
        assert!(manager.get_histogram("C1", "a").is_some());

        source.offline.store(true, Ordering::SeqCst);
        assert!(matches!(manager.load_and_process_all_histograms(), Err(RssiLocatorError::Storage(_))));
        assert!(!manager.is_data_loaded());
        assert!(manager.all_histograms_by_cell().is_empty());
    }

    #[test]
    fn clear_data_resets_to_unloaded() {
        let store = store_with(vec![sample("C1", "a", -50, MeasurementKind::Training)]);
        let manager = HistogramManager::new(store, 1).unwrap();
        manager.load_and_process_all_histograms().unwrap();
        manager.clear_data();
        assert!(!manager.is_data_loaded());
        assert!(manager.get_histogram("C1", "a").is_none());
    }

    #[test]
    fn rejects_bad_bin_width_up_front() {
        assert!(HistogramManager::new(store_with(vec![]), 0).is_err());
    }

    #[test]
    fn overlapping_load_is_a_no_op() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let inner = InMemoryStore::new();
        inner.add_samples([sample("C1", "a", -50, MeasurementKind::Training)]);
        let source = GatedSource { entered: Mutex::new(entered_tx), release: Mutex::new(release_rx), inner };
        let manager = HistogramManager::new(Arc::new(source), 1).unwrap();

        std::thread::scope(|scope| {
            let first = scope.spawn(|| manager.load_and_process_all_histograms());
            entered_rx.recv().unwrap();
            assert_eq!(manager.load_and_process_all_histograms().unwrap(), LoadStatus::AlreadyLoading);
            assert!(!manager.is_data_loaded());
            release_tx.send(()).unwrap();
            let status = first.join().unwrap().unwrap();
            assert_eq!(status, LoadStatus::Loaded { cells: 1, histograms: 1 });
        });
        assert!(manager.is_data_loaded());

        // flag is released, so a later load runs again
        release_tx.send(()).unwrap();
        assert!(matches!(manager.load_and_process_all_histograms().unwrap(), LoadStatus::Loaded { .. }));
    }
}
