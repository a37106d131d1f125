#![forbid(unsafe_code)]

//! Discovery of saved models under a directory tree, and the registry cache
//! that lets a later listing skip the walk.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use cv_data::DatasetRegistry;
use cv_model::{DERAILED_MARKER, ModelDescriptor, ModelError, ModelSnapshot, WantedEpoch};
use cv_record::record_file_name;
use cv_results::ModelRecord;
use cv_runtime::{EvidenceKind, EvidenceLedger};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use cv_model::last_samples;

pub const DEFAULT_REGISTRY_FILE: &str = "models.json";
pub const STATE_FILE: &str = "state.bin";
const SKIPPED_PATH_PART: &str = "dump";

/// Attributes kept per model in the registry cache. Filters can only use
/// these.
pub const FILTER_KEYS: &[&str] = &[
    "job",
    "type",
    "arch",
    "arch_code",
    "set",
    "h/o",
    "features",
    "K",
    "L",
    "sigma",
    "sigma_train",
    "beta",
    "gamma",
    "done",
    "epochs",
    "finished",
    "is_resumed",
    "optim",
    "lr",
    "options",
];

/// dir -> attribute -> value
pub type RegistryCache = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    Io { path: PathBuf, reason: String },
    CorruptCache { path: PathBuf, reason: String },
    Model(ModelError),
    InvalidRequest { reason: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, reason } => write!(f, "{}: {reason}", path.display()),
            Self::CorruptCache { path, reason } => {
                write!(f, "corrupted registry cache {}: {reason}", path.display())
            }
            Self::Model(error) => write!(f, "{error}"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<ModelError> for RegistryError {
    fn from(error: ModelError) -> Self {
        Self::Model(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectOptions {
    pub wanted_epoch: WantedEpoch,
    pub tpr_for_max: f64,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            wanted_epoch: WantedEpoch::Last,
            tpr_for_max: 0.95,
        }
    }
}

/// Summaries of every loadable model under `dir`. A directory holding a
/// model is not descended into.
pub fn collect_models(
    dir: &Path,
    registry: &DatasetRegistry,
    options: &CollectOptions,
    ledger: &mut EvidenceLedger,
) -> Vec<ModelRecord> {
    let mut records = Vec::new();
    walk(dir, registry, options, ledger, &mut records);
    ledger.record(
        EvidenceKind::Registry,
        format!("collected {} models under {}", records.len(), dir.display()),
    );
    records
}

fn walk(
    dir: &Path,
    registry: &DatasetRegistry,
    options: &CollectOptions,
    ledger: &mut EvidenceLedger,
    records: &mut Vec<ModelRecord>,
) {
    if dir.to_string_lossy().contains(SKIPPED_PATH_PART) {
        return;
    }

    log::debug!("loading model in {}", dir.display());
    match ModelSnapshot::load(dir) {
        Ok(snapshot) => {
            records.push(ModelRecord::from_snapshot(
                &snapshot,
                registry,
                options.tpr_for_max,
                options.wanted_epoch,
            ));
            return;
        }
        Err(ModelError::Deleted { .. }) => return,
        Err(ModelError::NoModel { .. }) => {}
        Err(error @ ModelError::Io { .. }) => {
            log::debug!("skipping {}: {error}", dir.display());
            return;
        }
        Err(error) => {
            ledger.warn(
                EvidenceKind::Registry,
                format!("load error in {}: {error}", dir.display()),
            );
            return;
        }
    }

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let subdirs: BTreeSet<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    for subdir in subdirs {
        walk(&subdir, registry, options, ledger, records);
    }
}

/// Cache entries of `records`, keeping only `keys` among their attributes.
#[must_use]
pub fn register_models(records: &[ModelRecord], keys: &[&str]) -> RegistryCache {
    records
        .iter()
        .map(|record| {
            let mut attributes = record.attributes();
            attributes.retain(|key, _| keys.contains(&key.as_str()));
            (record.dir.to_string_lossy().into_owned(), attributes)
        })
        .collect()
}

pub fn read_registry_cache(path: &Path) -> Result<RegistryCache, RegistryError> {
    let raw = fs::read_to_string(path).map_err(|error| RegistryError::Io {
        path: path.to_path_buf(),
        reason: format!("failed to read registry cache: {error}"),
    })?;
    serde_json::from_str(&raw).map_err(|error| RegistryError::CorruptCache {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

pub fn write_registry_cache(path: &Path, cache: &RegistryCache) -> Result<(), RegistryError> {
    let raw = serde_json::to_string_pretty(cache).map_err(|error| RegistryError::Io {
        path: path.to_path_buf(),
        reason: format!("failed to encode registry cache: {error}"),
    })?;
    fs::write(path, raw).map_err(|error| RegistryError::Io {
        path: path.to_path_buf(),
        reason: format!("failed to write registry cache: {error}"),
    })
}

/// Lists the models under `search_dir` that pass `filter`.
///
/// With `flash`, the registry cache `search_dir/cache_file` decides which
/// models to load. A missing or unreadable cache, or a cached model that
/// cannot be loaded any more, falls back to a full walk, after which the
/// cache is rewritten.
pub fn fetch_models(
    search_dir: &Path,
    cache_file: &str,
    filter: Option<&ModelFilter>,
    flash: bool,
    registry: &DatasetRegistry,
    options: &CollectOptions,
    ledger: &mut EvidenceLedger,
) -> Result<Vec<ModelRecord>, RegistryError> {
    let cache_path = search_dir.join(cache_file);
    if flash {
        log::debug!("flash collecting models from {}", cache_path.display());
        let gathered = read_registry_cache(&cache_path).and_then(|cache| {
            gather_registered_models(&cache, filter, registry, options).map_err(RegistryError::from)
        });
        match gathered {
            Ok(records) => {
                ledger.record(
                    EvidenceKind::Registry,
                    format!("flash listed {} models", records.len()),
                );
                return Ok(records);
            }
            Err(error) => ledger.warn(
                EvidenceKind::Registry,
                format!("{error}, will recollect models"),
            ),
        }
    }

    let records = collect_models(search_dir, registry, options, ledger);
    let cache = register_models(&records, FILTER_KEYS);
    write_registry_cache(&cache_path, &cache)?;
    ledger.record(
        EvidenceKind::Registry,
        format!("registry cache {} rewritten", cache_path.display()),
    );

    Ok(records
        .into_iter()
        .filter(|record| {
            let key = record.dir.to_string_lossy();
            filter.is_none_or(|filter| {
                cache
                    .get(&*key)
                    .is_some_and(|attributes| filter.matches(attributes))
            })
        })
        .collect())
}

/// Loads the cached models passing `filter`. Fails on the first one that
/// is gone or unreadable.
pub fn gather_registered_models(
    cache: &RegistryCache,
    filter: Option<&ModelFilter>,
    registry: &DatasetRegistry,
    options: &CollectOptions,
) -> Result<Vec<ModelRecord>, ModelError> {
    cache
        .iter()
        .filter(|(_, attributes)| filter.is_none_or(|filter| filter.matches(attributes)))
        .map(|(dir, attributes)| {
            let descriptor = ModelDescriptor::with_summary(dir, attributes.clone());
            let snapshot = descriptor.snapshot()?;
            Ok(ModelRecord::from_snapshot(
                snapshot,
                registry,
                options.tpr_for_max,
                options.wanted_epoch,
            ))
        })
        .collect()
}

/// Records of the given job numbers found under `job_dir`. Jobs that are
/// not found are absent from the map.
pub fn find_by_job_number(
    job_dir: &Path,
    jobs: &[u64],
    registry: &DatasetRegistry,
    options: &CollectOptions,
    ledger: &mut EvidenceLedger,
) -> BTreeMap<u64, ModelRecord> {
    let wanted: BTreeSet<u64> = jobs.iter().copied().collect();
    let found: BTreeMap<u64, ModelRecord> = collect_models(job_dir, registry, options, ledger)
        .into_iter()
        .filter(|record| wanted.contains(&record.job))
        .map(|record| (record.job, record))
        .collect();
    for job in wanted.iter().filter(|job| !found.contains_key(job)) {
        log::warn!("job {job} not found in {}", job_dir.display());
    }
    found
}

#[must_use]
pub fn is_derailed(dir: &Path) -> bool {
    dir.join(DERAILED_MARKER).exists()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhichRecorders {
    None,
    /// The training set only.
    Ind,
    #[default]
    All,
}

impl WhichRecorders {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "ind" => Some(Self::Ind),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// Recorder files, and optionally the weights file, that the model
/// directories still lack, as `(model dir, missing file)` pairs.
pub fn needed_remote_files(
    dirs: &[PathBuf],
    epoch: WantedEpoch,
    which: WhichRecorders,
    state: bool,
    registry: &DatasetRegistry,
) -> Result<Vec<(PathBuf, PathBuf)>, RegistryError> {
    if state && epoch != WantedEpoch::Last {
        return Err(RegistryError::InvalidRequest {
            reason: "weights are only kept for the last epoch".to_string(),
        });
    }

    let mut needed = Vec::new();
    for dir in dirs {
        let snapshot = ModelSnapshot::load(dir)?;
        let Some(resolved) = snapshot.resolve_epoch(epoch) else {
            log::warn!("no tested epoch in {}", dir.display());
            continue;
        };

        let testset = snapshot.training_set();
        let mut sets = Vec::new();
        if which != WhichRecorders::None {
            sets.push(testset.to_string());
            if which == WhichRecorders::All {
                sets.extend(registry.same_size(testset));
            }
        }

        let epoch_dir = snapshot.sample_epoch_dir(resolved);
        for set in sets {
            let path = epoch_dir.join(record_file_name(&set));
            if !path.exists() {
                needed.push((dir.clone(), path));
            }
        }

        if state {
            let path = dir.join(STATE_FILE);
            if !path.exists() {
                needed.push((dir.clone(), path));
            }
        }
    }
    Ok(needed)
}

/// Condition on one cached attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Equals(Value),
    OneOf(Vec<Value>),
    /// Inclusive numeric bounds.
    Range { min: Option<f64>, max: Option<f64> },
}

impl FilterCondition {
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Equals(expected) => same_value(expected, value),
            Self::OneOf(expected) => expected.iter().any(|e| same_value(e, value)),
            Self::Range { min, max } => value.as_f64().is_some_and(|v| {
                min.is_none_or(|min| v >= min) && max.is_none_or(|max| v <= max)
            }),
        }
    }
}

fn same_value(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

/// All conditions must hold; an attribute missing from the entry fails its
/// condition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelFilter {
    conditions: BTreeMap<String, FilterCondition>,
}

impl ModelFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition. Keys outside [`FILTER_KEYS`] are refused.
    pub fn with(mut self, key: &str, condition: FilterCondition) -> Result<Self, RegistryError> {
        if !FILTER_KEYS.contains(&key) {
            return Err(RegistryError::InvalidRequest {
                reason: format!("'{key}' is not a filter key"),
            });
        }
        self.conditions.insert(key.to_string(), condition);
        Ok(self)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    #[must_use]
    pub fn matches(&self, attributes: &BTreeMap<String, Value>) -> bool {
        self.conditions.iter().all(|(key, condition)| {
            attributes
                .get(key)
                .is_some_and(|value| condition.accepts(value))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    use cv_data::{DatasetRegistry, DatasetSpec};
    use cv_model::{
        DELETED_MARKER, DERAILED_MARKER, MethodSpec, ModelSnapshot, SNAPSHOT_FILE, SnapshotFile,
        TestEntry, TrainHistory, WantedEpoch, epoch_dir_name,
    };
    use cv_runtime::{EvidenceKind, EvidenceLedger};
    use serde_json::json;

    use super::{
        CollectOptions, FILTER_KEYS, FilterCondition, ModelFilter, RegistryError, STATE_FILE,
        WhichRecorders, collect_models, fetch_models, find_by_job_number, is_derailed,
        needed_remote_files, read_registry_cache, register_models,
    };

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cv_registry_{tag}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    fn registry() -> DatasetRegistry {
        let mut registry = DatasetRegistry::new();
        for name in ["digits", "glyphs"] {
            registry.insert(
                name,
                DatasetSpec {
                    shape: vec![1, 8, 8],
                    classes: Some(vec!["a".to_string(), "b".to_string()]),
                },
            );
        }
        registry
    }

    fn save_model(dir: &Path, job: u64, set: &str, beta: f64) {
        let mut meta = SnapshotFile::default();
        meta.job_number = job;
        meta.architecture.kind = "cvae".to_string();
        meta.training.set = set.to_string();
        meta.training.epochs = 4;
        meta.training.beta = beta;
        meta.trained = 4;
        meta.num_labels = 2;
        meta.predict_methods = vec![MethodSpec::parse("iws").expect("method")];

        let mut tests = BTreeMap::new();
        tests.insert(
            "iws".to_string(),
            TestEntry {
                n: 100,
                epochs: 4,
                accuracy: 0.9,
                ..TestEntry::default()
            },
        );
        ModelSnapshot {
            dir: dir.to_path_buf(),
            meta,
            testing: [(4, tests)].into_iter().collect(),
            ood_results: BTreeMap::new(),
            history: TrainHistory {
                epochs: 4,
                ..TrainHistory::default()
            },
        }
        .save()
        .expect("snapshot should save");
    }

    fn jobs_tree(tag: &str) -> PathBuf {
        let root = scratch_dir(tag);
        save_model(&root.join("digits").join("000001"), 1, "digits", 1.0);
        save_model(&root.join("digits").join("000002"), 2, "digits", 2.0);
        save_model(&root.join("glyphs").join("deep").join("000003"), 3, "glyphs", 1.0);
        save_model(&root.join("dump").join("000004"), 4, "digits", 1.0);

        let deleted = root.join("digits").join("000005");
        save_model(&deleted, 5, "digits", 1.0);
        fs::write(deleted.join(DELETED_MARKER), "").expect("marker");

        let nested = root.join("digits").join("000001").join("inner");
        save_model(&nested, 6, "digits", 1.0);
        root
    }

    fn jobs(records: &[cv_results::ModelRecord]) -> Vec<u64> {
        let mut jobs: Vec<u64> = records.iter().map(|r| r.job).collect();
        jobs.sort_unstable();
        jobs
    }

    #[test]
    fn collect_skips_dumps_deleted_and_nested_models() {
        let root = jobs_tree("collect");
        let mut ledger = EvidenceLedger::new();
        let records = collect_models(&root, &registry(), &CollectOptions::default(), &mut ledger);
        assert_eq!(jobs(&records), vec![1, 2, 3]);
        assert!(ledger.of_kind(EvidenceKind::Registry).count() >= 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupt_snapshot_is_skipped_and_logged() {
        let root = jobs_tree("corrupt");
        let broken = root.join("glyphs").join("000007");
        fs::create_dir_all(&broken).expect("dir");
        fs::write(broken.join(SNAPSHOT_FILE), "{ not json").expect("write");

        let mut ledger = EvidenceLedger::new();
        let records = collect_models(&root, &registry(), &CollectOptions::default(), &mut ledger);
        assert_eq!(jobs(&records), vec![1, 2, 3]);
        assert!(
            ledger
                .entries()
                .iter()
                .any(|entry| entry.summary.contains("000007"))
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn register_keeps_requested_keys() {
        let root = jobs_tree("register");
        let mut ledger = EvidenceLedger::new();
        let records = collect_models(&root, &registry(), &CollectOptions::default(), &mut ledger);
        let cache = register_models(&records, &["job", "set"]);
        assert_eq!(cache.len(), 3);
        let entry = cache
            .values()
            .find(|attributes| attributes["job"] == json!(3))
            .expect("job 3 registered");
        assert_eq!(entry.len(), 2);
        assert_eq!(entry["set"], json!("glyphs"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fetch_rebuilds_missing_cache_then_flashes() {
        let root = jobs_tree("fetch");
        let registry = registry();
        let options = CollectOptions::default();
        let mut ledger = EvidenceLedger::new();

        let first = fetch_models(&root, "models.json", None, true, &registry, &options, &mut ledger)
            .expect("rescan should succeed");
        assert_eq!(jobs(&first), vec![1, 2, 3]);
        let cache = read_registry_cache(&root.join("models.json")).expect("cache written");
        assert_eq!(cache.len(), 3);
        assert!(
            cache
                .values()
                .all(|attributes| attributes.keys().all(|k| FILTER_KEYS.contains(&k.as_str())))
        );

        let filter = ModelFilter::new()
            .with("set", FilterCondition::Equals(json!("digits")))
            .expect("set is a filter key");
        let mut flash_ledger = EvidenceLedger::new();
        let second = fetch_models(
            &root,
            "models.json",
            Some(&filter),
            true,
            &registry,
            &options,
            &mut flash_ledger,
        )
        .expect("flash listing should succeed");
        assert_eq!(jobs(&second), vec![1, 2]);
        assert!(
            flash_ledger
                .entries()
                .iter()
                .all(|entry| !entry.summary.contains("recollect"))
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn vanished_or_corrupt_cache_triggers_one_rescan() {
        let root = jobs_tree("vanished");
        let registry = registry();
        let options = CollectOptions::default();
        let mut ledger = EvidenceLedger::new();
        fetch_models(&root, "models.json", None, false, &registry, &options, &mut ledger)
            .expect("initial scan");

        fs::remove_dir_all(root.join("digits").join("000002")).expect("remove model");
        let mut ledger = EvidenceLedger::new();
        let records = fetch_models(&root, "models.json", None, true, &registry, &options, &mut ledger)
            .expect("rescan after vanished model");
        assert_eq!(jobs(&records), vec![1, 3]);
        assert!(
            ledger
                .entries()
                .iter()
                .any(|entry| entry.summary.contains("recollect"))
        );
        assert_eq!(
            read_registry_cache(&root.join("models.json"))
                .expect("cache rewritten")
                .len(),
            2
        );

        fs::write(root.join("models.json"), "[broken").expect("write");
        let err = read_registry_cache(&root.join("models.json")).expect_err("corrupt cache");
        assert!(matches!(err, RegistryError::CorruptCache { .. }));
        let mut ledger = EvidenceLedger::new();
        let records = fetch_models(&root, "models.json", None, true, &registry, &options, &mut ledger)
            .expect("rescan after corrupt cache");
        assert_eq!(jobs(&records), vec![1, 3]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn filter_conditions() {
        let mut attributes = BTreeMap::new();
        attributes.insert("beta".to_string(), json!(2.0));
        attributes.insert("job".to_string(), json!(7));
        attributes.insert("set".to_string(), json!("digits"));

        let filter = ModelFilter::new()
            .with("beta", FilterCondition::Range { min: Some(1.0), max: Some(2.0) })
            .and_then(|f| f.with("job", FilterCondition::OneOf(vec![json!(7.0), json!(9)])))
            .expect("valid keys");
        assert!(filter.matches(&attributes));

        let filter = ModelFilter::new()
            .with("gamma", FilterCondition::Equals(json!(0)))
            .expect("gamma is a filter key");
        assert!(!filter.matches(&attributes));

        let filter = ModelFilter::new()
            .with("beta", FilterCondition::Range { min: None, max: Some(1.5) })
            .expect("valid key");
        assert!(!filter.matches(&attributes));

        let err = ModelFilter::new()
            .with("dir", FilterCondition::Equals(json!("x")))
            .expect_err("dir is not filterable");
        assert!(matches!(err, RegistryError::InvalidRequest { .. }));
        assert!(ModelFilter::new().matches(&attributes));
    }

    #[test]
    fn find_jobs_and_derailed_marker() {
        let root = jobs_tree("find");
        let mut ledger = EvidenceLedger::new();
        let found = find_by_job_number(
            &root,
            &[3, 1, 42],
            &registry(),
            &CollectOptions::default(),
            &mut ledger,
        );
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(found[&3].set, "glyphs");

        let model = root.join("digits").join("000001");
        assert!(!is_derailed(&model));
        fs::write(model.join(DERAILED_MARKER), "").expect("marker");
        assert!(is_derailed(&model));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn needed_remote_files_lists_missing_recorders() {
        let root = scratch_dir("remote");
        let model = root.join("000001");
        save_model(&model, 1, "digits", 1.0);
        let epoch_dir = model.join("samples").join(epoch_dir_name(4));
        fs::create_dir_all(&epoch_dir).expect("epoch dir");
        fs::write(epoch_dir.join(cv_record::record_file_name("digits")), "{}").expect("write");

        let dirs = vec![model.clone()];
        let registry = registry();

        let none = needed_remote_files(&dirs, WantedEpoch::Last, WhichRecorders::Ind, false, &registry)
            .expect("listing");
        assert!(none.is_empty());

        let all = needed_remote_files(&dirs, WantedEpoch::Last, WhichRecorders::All, true, &registry)
            .expect("listing");
        let missing: Vec<PathBuf> = all.into_iter().map(|(_, path)| path).collect();
        assert_eq!(
            missing,
            vec![
                epoch_dir.join("record-glyphs.json"),
                epoch_dir.join("record-digits90.json"),
                model.join(STATE_FILE),
            ]
        );

        let err = needed_remote_files(&dirs, WantedEpoch::Epoch(2), WhichRecorders::None, true, &registry)
            .expect_err("weights only for last epoch");
        assert!(matches!(err, RegistryError::InvalidRequest { .. }));
        assert_eq!(WhichRecorders::parse("ind"), Some(WhichRecorders::Ind));
        let _ = fs::remove_dir_all(root);
    }
}
