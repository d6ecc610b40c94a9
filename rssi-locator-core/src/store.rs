use log::{debug, warn};
use rssi_locator_common::{Result, RssiLocatorError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::model::{KnownAp, MeasurementKind, Sample};
use crate::pmf::{decode_bins, encode_bins, ApPmf, PmfKey};

// --- collaborator seams ---

pub trait MeasurementSource: Send + Sync {
    fn fetch_samples(&self) -> Result<Vec<Sample>>;

    fn fetch_training_samples(&self) -> Result<Vec<Sample>> {
        Ok(self
            .fetch_samples()?
            .into_iter()
            .filter(|s| s.kind == MeasurementKind::Training)
            .collect())
    }
}

pub trait PmfStore: Send + Sync {
    fn fetch_pmfs(&self, bin_width: i32) -> Result<Vec<ApPmf>>;
    fn fetch_all_pmfs(&self) -> Result<Vec<ApPmf>>;
    /// Insert-or-replace keyed by (ap, cell, bin width), all or nothing.
    fn persist_pmfs(&self, pmfs: &[ApPmf]) -> Result<()>;
    fn delete_pmf(&self, ap: &str, cell: &str, bin_width: i32) -> Result<bool>;
    fn clear_pmfs(&self) -> Result<()>;

    /// Record count per stored bin width.
    fn pmf_summary(&self) -> Result<BTreeMap<i32, usize>> {
        let mut out = BTreeMap::new();
        for pmf in self.fetch_all_pmfs()? {
            *out.entry(pmf.bin_width).or_insert(0) += 1;
        }
        Ok(out)
    }
}

pub trait ApRegistry: Send + Sync {
    fn fetch_known_aps(&self) -> Result<Vec<KnownAp>>;

    fn fetch_fixed_ap_identities(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .fetch_known_aps()?
            .into_iter()
            .filter(KnownAp::is_fixed)
            .map(|ap| ap.ap)
            .collect())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// SSID is best effort: a later sighting without one keeps the earlier value
fn upsert_known_ap(registry: &mut BTreeMap<String, KnownAp>, ap: KnownAp) {
    match registry.get_mut(&ap.ap) {
        Some(existing) => {
            existing.ap_type = ap.ap_type;
            if ap.ssid.is_some() {
                existing.ssid = ap.ssid;
            }
        }
        None => {
            registry.insert(ap.ap.clone(), ap);
        }
    }
}

// --- in-memory store ---

#[derive(Default)]
pub struct InMemoryStore {
    samples: Mutex<Vec<Sample>>,
    known_aps: Mutex<BTreeMap<String, KnownAp>>,
    pmfs: Mutex<BTreeMap<PmfKey, ApPmf>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_samples(&self, samples: impl IntoIterator<Item = Sample>) {
        lock(&self.samples).extend(samples);
    }

    pub fn upsert_known_aps(&self, aps: impl IntoIterator<Item = KnownAp>) {
        let mut registry = lock(&self.known_aps);
        for ap in aps {
            upsert_known_ap(&mut registry, ap);
        }
    }
}

impl MeasurementSource for InMemoryStore {
    fn fetch_samples(&self) -> Result<Vec<Sample>> {
        Ok(lock(&self.samples).clone())
    }
}

impl ApRegistry for InMemoryStore {
    fn fetch_known_aps(&self) -> Result<Vec<KnownAp>> {
        Ok(lock(&self.known_aps).values().cloned().collect())
    }
}

impl PmfStore for InMemoryStore {
    fn fetch_pmfs(&self, bin_width: i32) -> Result<Vec<ApPmf>> {
        Ok(lock(&self.pmfs)
            .values()
            .filter(|p| p.bin_width == bin_width)
            .cloned()
            .collect())
    }

    fn fetch_all_pmfs(&self) -> Result<Vec<ApPmf>> {
        Ok(lock(&self.pmfs).values().cloned().collect())
    }

    fn persist_pmfs(&self, pmfs: &[ApPmf]) -> Result<()> {
        let mut table = lock(&self.pmfs);
        for pmf in pmfs {
            table.insert(pmf.key(), pmf.clone());
        }
        Ok(())
    }

    fn delete_pmf(&self, ap: &str, cell: &str, bin_width: i32) -> Result<bool> {
        let key = (ap.to_string(), cell.to_string(), bin_width);
        Ok(lock(&self.pmfs).remove(&key).is_some())
    }

    fn clear_pmfs(&self) -> Result<()> {
        lock(&self.pmfs).clear();
        Ok(())
    }
}

// --- JSON file store ---

/// Import document: everything a survey produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub known_aps: Vec<KnownAp>,
}

// at-rest row; bins kept as JSON text so one bad record does not poison the table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPmf {
    ap: String,
    cell: String,
    bin_width: i32,
    bins_data: String,
    #[serde(default = "default_min_rssi")]
    min_rssi: i32,
    #[serde(default = "default_max_rssi")]
    max_rssi: i32,
}

fn default_min_rssi() -> i32 {
    crate::histogram::DEFAULT_MIN_RSSI
}
fn default_max_rssi() -> i32 {
    crate::histogram::DEFAULT_MAX_RSSI
}

impl StoredPmf {
    fn from_pmf(pmf: &ApPmf) -> Result<Self> {
        Ok(Self {
            ap: pmf.ap.clone(),
            cell: pmf.cell.clone(),
            bin_width: pmf.bin_width,
            bins_data: encode_bins(&pmf.bins_data)?,
            min_rssi: pmf.min_rssi,
            max_rssi: pmf.max_rssi,
        })
    }

    fn key(&self) -> PmfKey {
        (self.ap.clone(), self.cell.clone(), self.bin_width)
    }

    fn decode(&self) -> Option<ApPmf> {
        match decode_bins(&self.bins_data) {
            Ok(bins_data) => Some(ApPmf {
                ap: self.ap.clone(),
                cell: self.cell.clone(),
                bin_width: self.bin_width,
                bins_data,
                min_rssi: self.min_rssi,
                max_rssi: self.max_rssi,
            }),
            Err(e) => {
                warn!(
                    "Ignoring malformed PMF for AP {} in cell {} (bin width {}): {e}",
                    self.ap, self.cell, self.bin_width
                );
                None
            }
        }
    }
}

const SAMPLES_FILE: &str = "samples.json";
const KNOWN_APS_FILE: &str = "known_aps.json";
const PMFS_FILE: &str = "pmfs.json";

/// Directory of JSON tables. Every write replaces a whole file via rename.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rssi-locator")
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_table<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            RssiLocatorError::Storage(format!("{} is not a valid table: {e}", path.display()))
        })
    }

    // Serializes rows into `<name>.tmp`; readers see nothing until commit.
    fn stage_table<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<PathBuf> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        std::fs::write(&tmp, serde_json::to_string_pretty(rows)?)?;
        Ok(tmp)
    }

    fn commit_table(&self, name: &str, staged: &Path) -> Result<()> {
        let path = self.dir.join(name);
        std::fs::rename(staged, &path)?;
        debug!("Replaced {}", path.display());
        Ok(())
    }

    fn write_table<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<()> {
        let staged = self.stage_table(name, rows)?;
        self.commit_table(name, &staged)
    }

    fn merged_known_aps(&self, aps: impl IntoIterator<Item = KnownAp>) -> Result<Vec<KnownAp>> {
        let mut registry: BTreeMap<String, KnownAp> = self
            .read_table::<KnownAp>(KNOWN_APS_FILE)?
            .into_iter()
            .map(|ap| (ap.ap.clone(), ap))
            .collect();
        for ap in aps {
            upsert_known_ap(&mut registry, ap);
        }
        Ok(registry.into_values().collect())
    }

    pub fn replace_samples(&self, samples: &[Sample]) -> Result<()> {
        let _guard = lock(&self.write_lock);
        self.write_table(SAMPLES_FILE, samples)
    }

    pub fn upsert_known_aps(&self, aps: impl IntoIterator<Item = KnownAp>) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let rows = self.merged_known_aps(aps)?;
        self.write_table(KNOWN_APS_FILE, &rows)
    }

    /// Replaces stored samples with the dataset's and merges its AP registry.
    /// Both tables are staged before either is replaced; if staging fails
    /// the previous samples and registry stay as they were.
    pub fn import_dataset(&self, path: &Path) -> Result<Dataset> {
        let content = std::fs::read_to_string(path)?;
        let dataset: Dataset = serde_json::from_str(&content)?;

        let _guard = lock(&self.write_lock);
        let known_aps = self.merged_known_aps(dataset.known_aps.iter().cloned())?;
        let staged_samples = self.stage_table(SAMPLES_FILE, &dataset.samples)?;
        let staged_aps = match self.stage_table(KNOWN_APS_FILE, &known_aps) {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&staged_samples) {
                    warn!("Could not remove {}: {cleanup}", staged_samples.display());
                }
                return Err(e);
            }
        };
        self.commit_table(SAMPLES_FILE, &staged_samples)?;
        self.commit_table(KNOWN_APS_FILE, &staged_aps)?;
        debug!(
            "Imported {} samples and {} known APs from {}",
            dataset.samples.len(),
            dataset.known_aps.len(),
            path.display()
        );
        Ok(dataset)
    }

    fn read_pmf_rows(&self) -> Result<Vec<StoredPmf>> {
        self.read_table(PMFS_FILE)
    }
}

impl MeasurementSource for JsonFileStore {
    fn fetch_samples(&self) -> Result<Vec<Sample>> {
        self.read_table(SAMPLES_FILE)
    }
}

impl ApRegistry for JsonFileStore {
    fn fetch_known_aps(&self) -> Result<Vec<KnownAp>> {
        self.read_table(KNOWN_APS_FILE)
    }
}

impl PmfStore for JsonFileStore {
    fn fetch_pmfs(&self, bin_width: i32) -> Result<Vec<ApPmf>> {
        Ok(self
            .read_pmf_rows()?
            .iter()
            .filter(|row| row.bin_width == bin_width)
            .filter_map(StoredPmf::decode)
            .collect())
    }

    fn fetch_all_pmfs(&self) -> Result<Vec<ApPmf>> {
        Ok(self.read_pmf_rows()?.iter().filter_map(StoredPmf::decode).collect())
    }

    fn persist_pmfs(&self, pmfs: &[ApPmf]) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut table: BTreeMap<PmfKey, StoredPmf> = self
            .read_pmf_rows()?
            .into_iter()
            .map(|row| (row.key(), row))
            .collect();
        for pmf in pmfs {
            table.insert(pmf.key(), StoredPmf::from_pmf(pmf)?);
        }
        let rows: Vec<StoredPmf> = table.into_values().collect();
        self.write_table(PMFS_FILE, &rows)
    }

    fn delete_pmf(&self, ap: &str, cell: &str, bin_width: i32) -> Result<bool> {
        let _guard = lock(&self.write_lock);
        let mut rows = self.read_pmf_rows()?;
        let before = rows.len();
        rows.retain(|row| !(row.ap == ap && row.cell == cell && row.bin_width == bin_width));
        if rows.len() == before {
            return Ok(false);
        }
        self.write_table(PMFS_FILE, &rows)?;
        Ok(true)
    }

    fn clear_pmfs(&self) -> Result<()> {
        let _guard = lock(&self.write_lock);
        self.write_table::<StoredPmf>(PMFS_FILE, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApType;

    fn pmf(ap: &str, cell: &str, bin_width: i32, bins: &[(i32, u32)]) -> ApPmf {
        ApPmf::new(ap, cell, bin_width, bins.iter().copied().collect())
    }

    fn known(ap: &str, ssid: Option<&str>, ap_type: ApType) -> KnownAp {
        KnownAp { ap: ap.into(), ssid: ssid.map(Into::into), ap_type }
    }

    fn sample(ap: &str, rssi: i32, kind: MeasurementKind) -> Sample {
        Sample { ap: ap.into(), rssi, cell: "C1".into(), timestamp_millis: 1, kind }
    }

    #[test]
    fn training_filter_drops_testing_samples() {
        let store = InMemoryStore::new();
        store.add_samples([sample("a", -50, MeasurementKind::Training), sample("a", -51, MeasurementKind::Testing)]);
        let training = store.fetch_training_samples().unwrap();
        assert_eq!(training.len(), 1);
        assert_eq!(training[0].rssi, -50);
    }

    #[test]
    fn fixed_identities_exclude_mobile_aps() {
        let store = InMemoryStore::new();
        store.upsert_known_aps([known("a", None, ApType::Fixed), known("b", None, ApType::Mobile)]);
        assert_eq!(store.fetch_fixed_ap_identities().unwrap(), BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn ssid_is_last_write_wins_but_not_erased() {
        let store = InMemoryStore::new();
        store.upsert_known_aps([known("a", Some("home"), ApType::Fixed)]);
        store.upsert_known_aps([known("a", Some("home-5g"), ApType::Fixed)]);
        store.upsert_known_aps([known("a", None, ApType::Mobile)]);
        let aps = store.fetch_known_aps().unwrap();
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].ssid.as_deref(), Some("home-5g"));
        assert_eq!(aps[0].ap_type, ApType::Mobile);
    }

    #[test]
    fn memory_persist_replaces_by_key() {
        let store = InMemoryStore::new();
        store.persist_pmfs(&[pmf("a", "C1", 1, &[(-50, 3)]), pmf("a", "C1", 2, &[(-50, 3)])]).unwrap();
        store.persist_pmfs(&[pmf("a", "C1", 1, &[(-60, 9)])]).unwrap();
        let width_one = store.fetch_pmfs(1).unwrap();
        assert_eq!(width_one.len(), 1);
        assert_eq!(width_one[0].bins_data.get(&-60), Some(&9));
        assert_eq!(store.pmf_summary().unwrap(), BTreeMap::from([(1, 1), (2, 1)]));
    }

    #[test]
    fn memory_delete_and_clear() {
        let store = InMemoryStore::new();
        store.persist_pmfs(&[pmf("a", "C1", 1, &[(-50, 3)]), pmf("b", "C1", 1, &[(-50, 3)])]).unwrap();
        assert!(store.delete_pmf("a", "C1", 1).unwrap());
        assert!(!store.delete_pmf("a", "C1", 1).unwrap());
        assert_eq!(store.fetch_all_pmfs().unwrap().len(), 1);
        store.clear_pmfs().unwrap();
        assert!(store.fetch_all_pmfs().unwrap().is_empty());
    }

    #[test]
    fn file_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("db")).unwrap();
        assert!(store.fetch_samples().unwrap().is_empty());
        assert!(store.fetch_known_aps().unwrap().is_empty());
        assert!(store.fetch_all_pmfs().unwrap().is_empty());
    }

    #[test]
    fn file_store_persists_pmfs_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.persist_pmfs(&[pmf("a", "C1", 10, &[(-50, 8), (-60, 2)])]).unwrap();
            store.persist_pmfs(&[pmf("a", "C1", 10, &[(-50, 1)]), pmf("a", "C2", 10, &[(-60, 4)])]).unwrap();
        }
        let store = JsonFileStore::open(dir.path()).unwrap();
        let pmfs = store.fetch_pmfs(10).unwrap();
        assert_eq!(pmfs.len(), 2);
        let c1 = pmfs.iter().find(|p| p.cell == "C1").unwrap();
        assert_eq!(c1.total_count(), 1);
        assert!(store.fetch_pmfs(5).unwrap().is_empty());
        assert!(!dir.path().join("pmfs.json.tmp").exists());
    }

    #[test]
    fn malformed_pmf_row_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let rows = r#"[
            {"ap": "a", "cell": "C1", "bin_width": 1, "bins_data": "{\"-50\": 4}"},
            {"ap": "b", "cell": "C1", "bin_width": 1, "bins_data": "not json"}
        ]"#;
        std::fs::write(dir.path().join("pmfs.json"), rows).unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let pmfs = store.fetch_pmfs(1).unwrap();
        assert_eq!(pmfs.len(), 1);
        assert_eq!(pmfs[0].ap, "a");
        assert_eq!(pmfs[0].min_rssi, -100);
    }

    #[test]
    fn unreadable_table_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("samples.json"), "{ nope").unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(matches!(store.fetch_samples(), Err(RssiLocatorError::Storage(_))));
    }

    #[test]
    fn import_replaces_samples_and_merges_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("db")).unwrap();
        store.upsert_known_aps([known("old", Some("x"), ApType::Fixed)]).unwrap();
        store.replace_samples(&[sample("old", -70, MeasurementKind::Training)]).unwrap();

        let dataset = Dataset {
            samples: vec![sample("a", -40, MeasurementKind::Training), sample("a", -45, MeasurementKind::Testing)],
            known_aps: vec![known("a", Some("lab"), ApType::Fixed)],
        };
        let path = dir.path().join("survey.json");
        std::fs::write(&path, serde_json::to_string(&dataset).unwrap()).unwrap();
        store.import_dataset(&path).unwrap();

        assert_eq!(store.fetch_samples().unwrap().len(), 2);
        assert_eq!(store.fetch_training_samples().unwrap().len(), 1);
        assert_eq!(store.fetch_fixed_ap_identities().unwrap().len(), 2);
    }

    fn write_dataset(dir: &Path) -> PathBuf {
        let dataset = Dataset {
            samples: vec![sample("new", -40, MeasurementKind::Training)],
            known_aps: vec![known("new", None, ApType::Fixed)],
        };
        let path = dir.join("survey.json");
        std::fs::write(&path, serde_json::to_string(&dataset).unwrap()).unwrap();
        path
    }

    #[test]
    fn failed_registry_write_leaves_samples_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("db")).unwrap();
        store.replace_samples(&[sample("old", -70, MeasurementKind::Training)]).unwrap();
        store.upsert_known_aps([known("old", None, ApType::Fixed)]).unwrap();
        // a directory where the staged registry file should go makes that write fail
        std::fs::create_dir(store.dir().join("known_aps.json.tmp")).unwrap();

        let survey = write_dataset(dir.path());
        assert!(matches!(store.import_dataset(&survey), Err(RssiLocatorError::Io(_))));

        let samples = store.fetch_samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].ap, "old");
        assert_eq!(store.fetch_fixed_ap_identities().unwrap(), BTreeSet::from(["old".to_string()]));
        assert!(!store.dir().join("samples.json.tmp").exists());
    }

    #[test]
    fn unreadable_registry_aborts_import_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("db")).unwrap();
        store.replace_samples(&[sample("old", -70, MeasurementKind::Training)]).unwrap();
        std::fs::write(store.dir().join("known_aps.json"), "[ broken").unwrap();

        let survey = write_dataset(dir.path());
        assert!(matches!(store.import_dataset(&survey), Err(RssiLocatorError::Storage(_))));
        assert_eq!(store.fetch_samples().unwrap()[0].ap, "old");
        assert!(!store.dir().join("samples.json.tmp").exists());
    }

    #[test]
    fn file_store_delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.persist_pmfs(&[pmf("a", "C1", 1, &[(-50, 3)]), pmf("a", "C2", 1, &[(-50, 3)])]).unwrap();
        assert!(store.delete_pmf("a", "C2", 1).unwrap());
        assert!(!store.delete_pmf("a", "C9", 1).unwrap());
        assert_eq!(store.pmf_summary().unwrap(), BTreeMap::from([(1, 1)]));
        store.clear_pmfs().unwrap();
        assert!(store.fetch_all_pmfs().unwrap().is_empty());
    }
}
