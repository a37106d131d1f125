#![forbid(unsafe_code)]

//! Saved model snapshots and the result caches attached to them.
//!
//! A snapshot directory holds `snapshot.json` (architecture, training
//! parameters, progress and method lists), optional `test.json`, `ood.json`
//! and `history.json` caches, and `samples/NNNN/` recorder directories.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const TEST_FILE: &str = "test.json";
pub const OOD_FILE: &str = "ood.json";
pub const HISTORY_FILE: &str = "history.json";
pub const DELETED_MARKER: &str = "deleted";
pub const DERAILED_MARKER: &str = "derailed";
pub const SAMPLES_DIR: &str = "samples";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    NoModel { dir: PathBuf },
    Deleted { dir: PathBuf },
    Io { path: PathBuf, reason: String },
    Corrupt { path: PathBuf, reason: String },
    InvalidMethod { name: String },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoModel { dir } => write!(f, "no model in {}", dir.display()),
            Self::Deleted { dir } => write!(f, "model in {} was deleted", dir.display()),
            Self::Io { path, reason } => write!(f, "{}: {reason}", path.display()),
            Self::Corrupt { path, reason } => {
                write!(f, "corrupted snapshot file {}: {reason}", path.display())
            }
            Self::InvalidMethod { name } => write!(f, "invalid method name '{name}'"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Evaluation method families. Each kind reads a fixed set of recorded
/// channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodKind {
    Iws,
    SoftIws,
    Closest,
    Kl,
    Soft,
    SoftKl,
    Mse,
    FisherRao,
    Mahala,
    Loss,
    Logpx,
    Sum,
    Max,
    Mag,
    Std,
    Mean,
    /// Methods computed from logits alone (baseline, odin, ...).
    Other(String),
}

impl MethodKind {
    #[must_use]
    pub fn from_base(base: &str) -> Self {
        match base {
            "iws" => Self::Iws,
            "softiws" => Self::SoftIws,
            "closest" => Self::Closest,
            "kl" => Self::Kl,
            "soft" => Self::Soft,
            "softkl" => Self::SoftKl,
            "mse" => Self::Mse,
            "fisher_rao" => Self::FisherRao,
            "mahala" => Self::Mahala,
            "loss" => Self::Loss,
            "logpx" => Self::Logpx,
            "sum" => Self::Sum,
            "max" => Self::Max,
            "mag" => Self::Mag,
            "std" => Self::Std,
            "mean" => Self::Mean,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn required_channels(&self) -> &'static [&'static str] {
        match self {
            Self::Iws | Self::SoftIws => &["iws"],
            Self::Closest => &["zdist"],
            Self::Kl | Self::Soft | Self::SoftKl => &["kl"],
            Self::Mse => &["cross_x"],
            Self::FisherRao => &["fisher_rao"],
            Self::Mahala => &["mahala"],
            Self::Loss
            | Self::Logpx
            | Self::Sum
            | Self::Max
            | Self::Mag
            | Self::Std
            | Self::Mean => &["total"],
            Self::Other(_) => &[],
        }
    }
}

/// A concrete method name, e.g. `iws`, `iws-2s` or `kl-a-1`, with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Method {
    name: String,
    kind: MethodKind,
}

impl Method {
    #[must_use]
    pub fn parse(name: &str) -> Self {
        let base = if let Some(base) = name.strip_suffix("-2s") {
            base
        } else if name.contains("-a-") {
            name.split('-').next().unwrap_or(name)
        } else {
            name
        };
        Self {
            name: name.to_string(),
            kind: MethodKind::from_base(base),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &MethodKind {
        &self.kind
    }

    #[must_use]
    pub fn required_channels(&self) -> &'static [&'static str] {
        self.kind.required_channels()
    }
}

/// Channels needed by every method of a combination, e.g. a predict method
/// paired with a misclassification method.
#[must_use]
pub fn required_channels<'a>(methods: impl IntoIterator<Item = &'a str>) -> BTreeSet<&'static str> {
    methods
        .into_iter()
        .flat_map(|name| Method::parse(name).required_channels().iter().copied())
        .collect()
}

/// A method as listed on a model: either concrete, or a starred family to
/// be expanded through the model's family table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MethodSpec {
    Single(Method),
    Family(String),
}

impl MethodSpec {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        if raw.is_empty() || raw == "*" {
            return Err(ModelError::InvalidMethod {
                name: raw.to_string(),
            });
        }
        Ok(match raw.strip_suffix('*') {
            Some(family) => Self::Family(family.to_string()),
            None => Self::Single(Method::parse(raw)),
        })
    }
}

impl TryFrom<String> for MethodSpec {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MethodSpec> for String {
    fn from(value: MethodSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(method) => f.write_str(method.name()),
            Self::Family(family) => write!(f, "{family}*"),
        }
    }
}

/// Expands families through `families` and drops the family markers. Order
/// is kept: concrete methods first, then each family's members. Duplicates
/// are dropped.
#[must_use]
pub fn expand_methods(specs: &[MethodSpec], families: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut expanded: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !expanded.iter().any(|known| known == name) {
            expanded.push(name.to_string());
        }
    };
    for spec in specs {
        if let MethodSpec::Single(method) = spec {
            push(method.name());
        }
    }
    for spec in specs {
        if let MethodSpec::Family(family) = spec {
            for member in families.get(family).into_iter().flatten() {
                push(member.as_str());
            }
        }
    }
    expanded
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MethodSelection {
    #[default]
    All,
    Only(Vec<MethodSpec>),
}

impl MethodSelection {
    pub fn parse_list<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, ModelError> {
        Ok(Self::Only(
            names
                .into_iter()
                .map(MethodSpec::parse)
                .collect::<Result<_, _>>()?,
        ))
    }

    /// Concrete method names, with `All` standing for the model's own list.
    #[must_use]
    pub fn resolve(&self, model_list: &[MethodSpec], families: &BTreeMap<String, Vec<String>>) -> Vec<String> {
        match self {
            Self::All => expand_methods(model_list, families),
            Self::Only(specs) => expand_methods(specs, families),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WantedEpoch {
    #[default]
    Last,
    MinLoss,
    Epoch(usize),
}

impl WantedEpoch {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "last" => Some(Self::Last),
            "min-loss" => Some(Self::MinLoss),
            other => other.parse().ok().map(Self::Epoch),
        }
    }
}

/// ROC summary of one detection method on one dataset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RocEntry {
    pub n: usize,
    pub epochs: usize,
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub auc: Option<f64>,
    pub thresholds: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestEntry {
    pub n: usize,
    pub epochs: usize,
    pub accuracy: f64,
    pub misclass: BTreeMap<String, RocEntry>,
}

/// epoch -> predict method -> entry
pub type TestCache = BTreeMap<usize, BTreeMap<String, TestEntry>>;
/// epoch -> dataset -> method -> entry
pub type OodCache = BTreeMap<usize, BTreeMap<String, BTreeMap<String, RocEntry>>>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Architecture {
    #[serde(rename = "type")]
    pub kind: String,
    pub output: String,
    pub activation: String,
    pub latent_dim: usize,
    pub features: Option<String>,
    pub batch_norm: Option<String>,
    pub encoder: Vec<usize>,
    pub decoder: Vec<usize>,
    pub upsampler: Vec<usize>,
    pub classifier: Vec<usize>,
    pub latent_prior_variance: f64,
    pub encoder_forced_variance: Option<f64>,
}

impl Architecture {
    /// `type=cvae--output=sigmoid--...--variance=1.0`, skipping latent dim and
    /// batch norm when `with_latent` is false. Used for the architecture code.
    #[must_use]
    pub fn describe(&self, with_latent: bool) -> String {
        fn layers(values: &[usize]) -> String {
            if values.is_empty() {
                ".".to_string()
            } else {
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("-")
            }
        }

        let mut out = format!("type={}--", self.kind);
        if self.kind != "vib" {
            out.push_str(&format!("output={}--", self.output));
        }
        out.push_str(&format!("activation={}--", self.activation));
        if with_latent {
            out.push_str(&format!("latent-dim={}--", self.latent_dim));
        }
        if let Some(features) = &self.features {
            out.push_str(&format!("features={features}--"));
        }
        if with_latent && let Some(batch_norm) = &self.batch_norm {
            out.push_str(&format!("batch-norm-{batch_norm}--"));
        }
        out.push_str(&format!("encoder={}--", layers(&self.encoder)));
        out.push_str(&format!("decoder={}--", layers(&self.decoder)));
        if !self.upsampler.is_empty() {
            out.push_str(&format!("upsampler={}--", layers(&self.upsampler)));
        }
        out.push_str(&format!("classifier={}--", layers(&self.classifier)));
        out.push_str(&format!("variance={:.1}", self.latent_prior_variance));
        out
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.encoder.len() + self.decoder.len()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.latent_dim
            + self.encoder.iter().sum::<usize>()
            + self.decoder.iter().sum::<usize>()
            + self.classifier.iter().sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub kind: String,
    pub lr: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            kind: "adam".to_string(),
            lr: 1e-3,
        }
    }
}

impl fmt::Display for OptimConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:.0e}", self.kind, self.lr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParameters {
    pub set: String,
    pub epochs: usize,
    pub batch_size: Option<usize>,
    pub max_train_batch_size: usize,
    pub beta: f64,
    pub gamma: f64,
    pub latent_sampling: usize,
    pub warmup: usize,
    pub data_augmentation: Vec<String>,
    pub transformer: String,
    pub coder_means: Option<String>,
    pub dictionary_variance: f64,
    pub pretrained_features: Option<String>,
    pub pretrained_upsampler: Option<String>,
    pub optim: OptimConfig,
    pub early_min_loss: Option<usize>,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            set: String::new(),
            epochs: 0,
            batch_size: None,
            max_train_batch_size: 8,
            beta: 1.0,
            gamma: 0.0,
            latent_sampling: 1,
            warmup: 0,
            data_augmentation: Vec::new(),
            transformer: "default".to_string(),
            coder_means: None,
            dictionary_variance: 1.0,
            pretrained_features: None,
            pretrained_upsampler: None,
            optim: OptimConfig::default(),
            early_min_loss: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigmaConfig {
    pub value: f64,
    pub learned: bool,
    pub coded: bool,
    pub is_rmse: bool,
    pub decay: f64,
    pub sdim: usize,
}

impl Default for SigmaConfig {
    fn default() -> Self {
        Self {
            value: 1.0,
            learned: false,
            coded: false,
            is_rmse: false,
            decay: 0.0,
            sdim: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainHistory {
    pub epochs: usize,
    pub train_loss: Vec<BTreeMap<String, f64>>,
    pub test_loss: Vec<BTreeMap<String, f64>>,
    pub validation_loss: Option<Vec<BTreeMap<String, f64>>>,
    pub train_measures: Vec<BTreeMap<String, f64>>,
    pub test_measures: Vec<BTreeMap<String, f64>>,
}

/// Contents of `snapshot.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotFile {
    pub job_number: u64,
    pub is_resumed: bool,
    pub architecture: Architecture,
    pub training: TrainingParameters,
    pub trained: usize,
    pub num_labels: usize,
    pub predict_methods: Vec<MethodSpec>,
    pub ood_methods: Vec<MethodSpec>,
    pub misclass_methods: Vec<MethodSpec>,
    pub families: BTreeMap<String, Vec<String>>,
    pub sigma: SigmaConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub dir: PathBuf,
    pub meta: SnapshotFile,
    pub testing: TestCache,
    pub ood_results: OodCache,
    pub history: TrainHistory,
}

impl ModelSnapshot {
    /// Loads a snapshot directory. A missing `snapshot.json` is `NoModel`,
    /// a `deleted` marker is `Deleted`; missing caches are empty.
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        if dir.join(DELETED_MARKER).exists() {
            return Err(ModelError::Deleted {
                dir: dir.to_path_buf(),
            });
        }
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if !snapshot_path.is_file() {
            return Err(ModelError::NoModel {
                dir: dir.to_path_buf(),
            });
        }
        let meta: SnapshotFile = read_json(&snapshot_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            testing: read_optional_json(&dir.join(TEST_FILE))?,
            ood_results: read_optional_json(&dir.join(OOD_FILE))?,
            history: read_optional_json(&dir.join(HISTORY_FILE))?,
            meta,
        })
    }

    /// Writes every file of the snapshot into `self.dir`.
    pub fn save(&self) -> Result<(), ModelError> {
        fs::create_dir_all(&self.dir).map_err(|error| ModelError::Io {
            path: self.dir.clone(),
            reason: format!("failed to create snapshot dir: {error}"),
        })?;
        write_json(&self.dir.join(SNAPSHOT_FILE), &self.meta)?;
        write_json(&self.dir.join(TEST_FILE), &self.testing)?;
        write_json(&self.dir.join(OOD_FILE), &self.ood_results)?;
        write_json(&self.dir.join(HISTORY_FILE), &self.history)
    }

    #[must_use]
    pub fn training_set(&self) -> &str {
        &self.meta.training.set
    }

    #[must_use]
    pub fn samples_dir(&self) -> PathBuf {
        self.dir.join(SAMPLES_DIR)
    }

    #[must_use]
    pub fn sample_epoch_dir(&self, epoch: usize) -> PathBuf {
        self.samples_dir().join(epoch_dir_name(epoch))
    }

    #[must_use]
    pub fn last_tested_epoch(&self) -> Option<usize> {
        self.testing.keys().next_back().copied()
    }

    /// `None` only when the last tested epoch is asked for and nothing was
    /// tested.
    #[must_use]
    pub fn resolve_epoch(&self, wanted: WantedEpoch) -> Option<usize> {
        match wanted {
            WantedEpoch::Epoch(epoch) => Some(epoch),
            WantedEpoch::Last => self.last_tested_epoch(),
            WantedEpoch::MinLoss => match self.meta.training.early_min_loss {
                Some(epoch) => Some(epoch),
                None => {
                    log::warn!(
                        "min loss epoch was not computed for {}, using last",
                        self.dir.display()
                    );
                    self.last_tested_epoch()
                }
            },
        }
    }

    #[must_use]
    pub fn predict_methods(&self) -> Vec<String> {
        expand_methods(&self.meta.predict_methods, &self.meta.families)
    }

    #[must_use]
    pub fn ood_methods(&self) -> Vec<String> {
        expand_methods(&self.meta.ood_methods, &self.meta.families)
    }

    /// `p:fu t:d bn:  a:f  w:05 c:r` style summary of training options.
    #[must_use]
    pub fn option_vector(&self) -> String {
        let arch = &self.meta.architecture;
        let training = &self.meta.training;
        let blank = ' ';
        let mut parts = Vec::new();

        if arch.features.is_some() {
            let mut w = String::from("p:");
            w.push(if training.pretrained_features.is_some() {
                'f'
            } else {
                blank
            });
            if !arch.upsampler.is_empty() {
                w.push(if training.pretrained_upsampler.is_some() {
                    'u'
                } else {
                    blank
                });
            }
            parts.push(w);
        }

        parts.push(format!(
            "t:{}",
            training.transformer.chars().next().unwrap_or(blank)
        ));
        parts.push(format!(
            "bn:{}",
            arch.batch_norm
                .as_deref()
                .and_then(|bn| bn.chars().next())
                .unwrap_or(blank)
        ));

        let mut w = String::from("a:");
        for augmentation in ["flip", "crop"] {
            let used = training.data_augmentation.iter().any(|a| a == augmentation);
            w.push(if used {
                augmentation.chars().next().unwrap_or(blank)
            } else {
                blank
            });
        }
        parts.push(w);

        parts.push(if training.warmup > 0 {
            format!("w:{:02}", training.warmup)
        } else {
            "w:  ".to_string()
        });

        if arch.kind == "cvae" {
            let code = match training.coder_means.as_deref() {
                Some("learned") => 'l',
                Some("onehot") => '1',
                _ => 'r',
            };
            parts.push(format!("c:{code}"));
        }

        parts.join(" ")
    }
}

#[must_use]
pub fn epoch_dir_name(epoch: usize) -> String {
    format!("{epoch:04}")
}

/// Numeric subdirectories of a `samples/` directory, by epoch. An absent
/// directory has none.
#[must_use]
pub fn sample_epochs(samples_dir: &Path) -> BTreeMap<usize, PathBuf> {
    let Ok(entries) = fs::read_dir(samples_dir) else {
        return BTreeMap::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            if !name.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some((name.parse().ok()?, entry.path()))
        })
        .collect()
}

/// Latest epoch with recorded samples under a model directory.
#[must_use]
pub fn last_samples(model_dir: &Path) -> Option<usize> {
    sample_epochs(&model_dir.join(SAMPLES_DIR))
        .keys()
        .next_back()
        .copied()
}

/// Directory handle of a model: the resolved directory, the attributes
/// cached for it by the registry, and the snapshot loaded on first use.
#[derive(Debug)]
pub struct ModelDescriptor {
    dir: PathBuf,
    summary: BTreeMap<String, Value>,
    snapshot: OnceLock<Result<ModelSnapshot, ModelError>>,
}

impl ModelDescriptor {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_summary(dir, BTreeMap::new())
    }

    #[must_use]
    pub fn with_summary(dir: impl Into<PathBuf>, summary: BTreeMap<String, Value>) -> Self {
        Self {
            dir: dir.into(),
            summary,
            snapshot: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn from_snapshot(snapshot: ModelSnapshot) -> Self {
        let descriptor = Self::new(snapshot.dir.clone());
        let _ = descriptor.snapshot.set(Ok(snapshot));
        descriptor
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn summary(&self) -> &BTreeMap<String, Value> {
        &self.summary
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.snapshot.get().is_some()
    }

    pub fn snapshot(&self) -> Result<&ModelSnapshot, ModelError> {
        self.snapshot
            .get_or_init(|| ModelSnapshot::load(&self.dir))
            .as_ref()
            .map_err(Clone::clone)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let raw = fs::read_to_string(path).map_err(|error| ModelError::Io {
        path: path.to_path_buf(),
        reason: format!("failed to read: {error}"),
    })?;
    serde_json::from_str(&raw).map_err(|error| ModelError::Corrupt {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

fn read_optional_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ModelError> {
    if path.is_file() {
        read_json(path)
    } else {
        Ok(T::default())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ModelError> {
    let encoded = serde_json::to_string_pretty(value).map_err(|error| ModelError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("encoding failed: {error}"),
    })?;
    fs::write(path, encoded).map_err(|error| ModelError::Io {
        path: path.to_path_buf(),
        reason: format!("failed to write: {error}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::{
        MethodKind, MethodSelection, MethodSpec, ModelDescriptor, ModelError, ModelSnapshot,
        SnapshotFile, TestEntry, WantedEpoch, expand_methods, required_channels,
    };

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cv_model_{tag}_{}", std::process::id()))
    }

    fn families() -> BTreeMap<String, Vec<String>> {
        let mut families = BTreeMap::new();
        families.insert(
            "iws".to_string(),
            vec!["iws-a-1".to_string(), "iws-a-2".to_string()],
        );
        families
    }

    #[test]
    fn method_names_map_to_channels() {
        assert_eq!(
            required_channels(["iws-2s"]).into_iter().collect::<Vec<_>>(),
            vec!["iws"]
        );
        assert_eq!(
            required_channels(["kl-a-3", "mse"]).into_iter().collect::<Vec<_>>(),
            vec!["cross_x", "kl"]
        );
        assert_eq!(
            required_channels(["logpx", "closest"]).into_iter().collect::<Vec<_>>(),
            vec!["total", "zdist"]
        );
        assert!(required_channels(["baseline"]).is_empty());
        assert_eq!(
            super::Method::parse("odin-1").kind(),
            &MethodKind::Other("odin-1".to_string())
        );
    }

    #[test]
    fn starred_families_expand_and_disappear() {
        let specs: Vec<MethodSpec> = ["iws*", "baseline", "kl*"]
            .into_iter()
            .map(|m| MethodSpec::parse(m).expect("valid method"))
            .collect();
        assert_eq!(
            expand_methods(&specs, &families()),
            vec!["baseline", "iws-a-1", "iws-a-2"]
        );

        let only = MethodSelection::parse_list(["iws", "iws*"]).expect("valid list");
        assert_eq!(
            only.resolve(&[], &families()),
            vec!["iws", "iws-a-1", "iws-a-2"]
        );
        assert!(MethodSpec::parse("*").is_err());
    }

    #[test]
    fn method_specs_serialize_as_plain_names() {
        let encoded = serde_json::to_string(&vec![
            MethodSpec::parse("iws*").expect("family"),
            MethodSpec::parse("mse").expect("single"),
        ])
        .expect("encode");
        assert_eq!(encoded, r#"["iws*","mse"]"#);
        let decoded: Vec<MethodSpec> = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded[0], MethodSpec::Family("iws".to_string()));
    }

    #[test]
    fn missing_and_deleted_snapshots_are_typed() {
        let dir = scratch_dir("missing");
        std::fs::create_dir_all(&dir).expect("dir");
        let err = ModelSnapshot::load(&dir).expect_err("no snapshot file");
        assert!(matches!(err, ModelError::NoModel { .. }));

        std::fs::write(dir.join(super::DELETED_MARKER), "").expect("marker");
        let err = ModelSnapshot::load(&dir).expect_err("deleted");
        assert!(matches!(err, ModelError::Deleted { .. }));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_round_trip_and_lazy_descriptor() {
        let dir = scratch_dir("roundtrip");
        let mut meta = SnapshotFile::default();
        meta.job_number = 1234;
        meta.training.set = "mnist".to_string();
        meta.training.epochs = 10;
        meta.trained = 10;
        let mut testing = BTreeMap::new();
        let mut by_method = BTreeMap::new();
        by_method.insert(
            "iws".to_string(),
            TestEntry {
                n: 500,
                epochs: 10,
                accuracy: 0.98,
                ..TestEntry::default()
            },
        );
        testing.insert(10, by_method);
        let snapshot = ModelSnapshot {
            dir: dir.clone(),
            meta,
            testing,
            ood_results: BTreeMap::new(),
            history: super::TrainHistory::default(),
        };
        snapshot.save().expect("save");

        let descriptor = ModelDescriptor::new(&dir);
        assert!(!descriptor.is_loaded());
        let loaded = descriptor.snapshot().expect("lazy load");
        assert_eq!(loaded, &snapshot);
        assert!(descriptor.is_loaded());
        assert_eq!(loaded.resolve_epoch(WantedEpoch::Last), Some(10));
        assert_eq!(loaded.resolve_epoch(WantedEpoch::MinLoss), Some(10));
        assert_eq!(
            loaded.sample_epoch_dir(10),
            dir.join("samples").join("0010")
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = scratch_dir("corrupt");
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(dir.join(super::SNAPSHOT_FILE), "{ nope").expect("write");
        let descriptor = ModelDescriptor::new(&dir);
        assert!(matches!(
            descriptor.snapshot(),
            Err(ModelError::Corrupt { .. })
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn architecture_and_options_describe_the_model() {
        let mut meta = SnapshotFile::default();
        meta.architecture.kind = "cvae".to_string();
        meta.architecture.output = "sigmoid".to_string();
        meta.architecture.activation = "relu".to_string();
        meta.architecture.latent_dim = 32;
        meta.architecture.encoder = vec![64, 32];
        meta.architecture.classifier = vec![10];
        meta.training.warmup = 5;
        meta.training.data_augmentation = vec!["flip".to_string()];

        assert_eq!(
            meta.architecture.describe(false),
            "type=cvae--output=sigmoid--activation=relu--encoder=64-32--decoder=.--classifier=10--variance=0.0"
        );
        assert_eq!(meta.architecture.depth(), 3);
        assert_eq!(meta.architecture.width(), 32 + 96 + 10);

        let snapshot = ModelSnapshot {
            dir: PathBuf::from("/nowhere"),
            meta,
            testing: BTreeMap::new(),
            ood_results: BTreeMap::new(),
            history: super::TrainHistory::default(),
        };
        assert_eq!(snapshot.option_vector(), "t:d bn:  a:f  w:05 c:r");
        assert_eq!(snapshot.resolve_epoch(WantedEpoch::Last), None);
        assert_eq!(WantedEpoch::parse("min-loss"), Some(WantedEpoch::MinLoss));
        assert_eq!(WantedEpoch::parse("12"), Some(WantedEpoch::Epoch(12)));
    }
}
