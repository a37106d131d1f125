#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use cv_data::{DataError, DatasetRegistry};
use cv_model::{ModelError, ModelSnapshot, WantedEpoch};
use cv_record::{RecordError, RecorderScan, load_all};
use cv_registry::{
    CollectOptions, DEFAULT_REGISTRY_FILE, ModelFilter, RegistryError, WhichRecorders,
    fetch_models, find_by_job_number, needed_remote_files,
};
use cv_report::{ReportOptions, ResultTable, results_tables};
use cv_results::{AvailabilityQuery, AvailabilityTable, ModelRecord, available_results};
use cv_runtime::{EvidenceEntry, EvidenceKind, EvidenceLedger};
use cv_serialize::DecodeMode;
use serde::{Deserialize, Serialize};

pub const JOB_DIR_ENV: &str = "CV_JOB_DIR";

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    Config { path: PathBuf, reason: String },
    Data(DataError),
    Model(ModelError),
    Record(RecordError),
    Registry(RegistryError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { path, reason } => {
                write!(f, "invalid config {}: {reason}", path.display())
            }
            Self::Data(error) => write!(f, "{error}"),
            Self::Model(error) => write!(f, "{error}"),
            Self::Record(error) => write!(f, "{error}"),
            Self::Registry(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DataError> for ApiError {
    fn from(error: DataError) -> Self {
        Self::Data(error)
    }
}

impl From<ModelError> for ApiError {
    fn from(error: ModelError) -> Self {
        Self::Model(error)
    }
}

impl From<RecordError> for ApiError {
    fn from(error: RecordError) -> Self {
        Self::Record(error)
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        Self::Registry(error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub job_dir: PathBuf,
    pub registry_file: String,
    /// Dataset registry file; the built-in sets when absent.
    pub dataset_config: Option<PathBuf>,
    pub min_samples_by_class: usize,
    pub samples_available_by_class: usize,
    pub epoch_tolerance: usize,
    pub tpr_for_max: f64,
    pub decode_mode: DecodeMode,
}

impl HarnessConfig {
    /// Defaults, with the job directory taken from `CV_JOB_DIR` when set.
    #[must_use]
    pub fn default_paths() -> Self {
        Self::default().with_job_dir_override(std::env::var_os(JOB_DIR_ENV))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ApiError> {
        let raw = fs::read_to_string(path).map_err(|error| ApiError::Config {
            path: path.to_path_buf(),
            reason: format!("failed to read: {error}"),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| ApiError::Config {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        Ok(config.with_job_dir_override(std::env::var_os(JOB_DIR_ENV)))
    }

    #[must_use]
    pub fn with_job_dir_override(mut self, job_dir: Option<OsString>) -> Self {
        if let Some(job_dir) = job_dir.filter(|dir| !dir.is_empty()) {
            self.job_dir = PathBuf::from(job_dir);
        }
        self
    }

    #[must_use]
    pub fn availability_query(&self) -> AvailabilityQuery {
        AvailabilityQuery {
            epoch_tolerance: self.epoch_tolerance,
            min_samples_by_class: self.min_samples_by_class,
            samples_available_by_class: self.samples_available_by_class,
            decode_mode: self.decode_mode,
            ..AvailabilityQuery::default()
        }
    }

    #[must_use]
    pub fn collect_options(&self, wanted_epoch: WantedEpoch) -> CollectOptions {
        CollectOptions {
            wanted_epoch,
            tpr_for_max: self.tpr_for_max,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            job_dir: PathBuf::from("jobs"),
            registry_file: DEFAULT_REGISTRY_FILE.to_string(),
            dataset_config: None,
            min_samples_by_class: 200,
            samples_available_by_class: 800,
            epoch_tolerance: 5,
            tpr_for_max: 0.95,
            decode_mode: DecodeMode::Strict,
        }
    }
}

/// One bookkeeping run: the config, the dataset registry loaded once for
/// it, and the evidence gathered along the way.
#[derive(Debug, Clone)]
pub struct ExperimentSession {
    config: HarnessConfig,
    registry: DatasetRegistry,
    ledger: EvidenceLedger,
}

impl ExperimentSession {
    pub fn new(config: HarnessConfig) -> Result<Self, ApiError> {
        let registry = match &config.dataset_config {
            Some(path) => {
                log::debug!("loading dataset registry from {}", path.display());
                DatasetRegistry::from_json_file(path)?
            }
            None => DatasetRegistry::builtin(),
        };
        Ok(Self::with_registry(config, registry))
    }

    #[must_use]
    pub fn with_registry(config: HarnessConfig, registry: DatasetRegistry) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "session job_dir={} registry_file={} decode_mode={:?} datasets={}",
                config.job_dir.display(),
                config.registry_file,
                config.decode_mode,
                registry.names().count()
            ),
        );
        Self {
            config,
            registry,
            ledger,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn load_model(&self, dir: &Path) -> Result<ModelSnapshot, ApiError> {
        Ok(ModelSnapshot::load(dir)?)
    }

    /// Availability of results for the model in `dir`, starting from the
    /// configured query.
    pub fn availability(
        &mut self,
        dir: &Path,
        adjust: impl FnOnce(&mut AvailabilityQuery),
    ) -> Result<AvailabilityTable, ApiError> {
        let model = self.load_model(dir)?;
        let mut query = self.config.availability_query();
        adjust(&mut query);
        Ok(available_results(
            &model,
            &self.registry,
            &query,
            &mut self.ledger,
        ))
    }

    pub fn recorders(&mut self, dir: &Path, epoch: usize) -> Result<RecorderScan, ApiError> {
        let model = self.load_model(dir)?;
        Ok(load_all(
            &model.sample_epoch_dir(epoch),
            self.config.decode_mode,
            &mut self.ledger,
        )?)
    }

    /// Models under the job directory passing `filter`, through the
    /// registry cache when `flash` is set.
    pub fn list_models(
        &mut self,
        filter: Option<&ModelFilter>,
        flash: bool,
        wanted_epoch: WantedEpoch,
    ) -> Result<Vec<ModelRecord>, ApiError> {
        let options = self.config.collect_options(wanted_epoch);
        Ok(fetch_models(
            &self.config.job_dir,
            &self.config.registry_file,
            filter,
            flash,
            &self.registry,
            &options,
            &mut self.ledger,
        )?)
    }

    pub fn find_jobs(&mut self, jobs: &[u64]) -> BTreeMap<u64, ModelRecord> {
        let options = self.config.collect_options(WantedEpoch::Last);
        find_by_job_number(
            &self.config.job_dir,
            jobs,
            &self.registry,
            &options,
            &mut self.ledger,
        )
    }

    pub fn remote_files(
        &self,
        dirs: &[PathBuf],
        epoch: WantedEpoch,
        which: WhichRecorders,
        state: bool,
    ) -> Result<Vec<(PathBuf, PathBuf)>, ApiError> {
        Ok(needed_remote_files(dirs, epoch, which, state, &self.registry)?)
    }

    #[must_use]
    pub fn report(
        &self,
        records: &[ModelRecord],
        options: &ReportOptions,
    ) -> BTreeMap<String, ResultTable> {
        results_tables(records, options)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.ledger.entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.ledger.len()
    }

    pub fn write_evidence(&self, path: &Path) -> Result<(), ApiError> {
        self.ledger
            .write_jsonl(path)
            .map_err(|reason| ApiError::Config {
                path: path.to_path_buf(),
                reason,
            })
    }
}
