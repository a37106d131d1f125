#![forbid(unsafe_code)]

//! Batched recorder of per-sample evaluation tensors.
//!
//! A [`LossRecorder`] holds a fixed set of named channels, each a tensor of
//! shape `[...inner, capacity]`, and is filled one batch at a time. Capacity
//! is counted in batches and doubles when a write would overflow it. The last
//! batch of a run may be short; its true size is kept per channel so reads
//! return only what was written.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use cv_core::{DType, DenseTensor, TensorError};
use cv_runtime::{EvidenceKind, EvidenceLedger};
use cv_serialize::{
    ChannelPayload, DecodeMode, RecordBody, SerializeError, decode_record,
    encode_record,
};
use rand::Rng;
use serde_json::Value;

pub const RECORD_FILE_PREFIX: &str = "record-";
pub const RECORD_FILE_SUFFIX: &str = ".json";

/// What to do when an append does not fit in the current capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Growth {
    #[default]
    Double,
    Fixed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    Schema {
        channel: String,
        known: Vec<String>,
    },
    Capacity {
        num_batch: usize,
        recorded: usize,
    },
    BatchIndex {
        index: usize,
        recorded: usize,
    },
    EmptyBatch,
    OversizedBatch {
        channel: String,
        samples: usize,
        batch_size: usize,
    },
    ZeroBatchSize,
    ChannelShape {
        channel: String,
        source: TensorError,
    },
    Io {
        path: PathBuf,
        reason: String,
    },
    Corrupt {
        path: PathBuf,
        source: SerializeError,
    },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema { channel, known } => {
                write!(
                    f,
                    "channel '{channel}' is not part of the recorder schema {known:?}"
                )
            }
            Self::Capacity {
                num_batch,
                recorded,
            } => write!(
                f,
                "recorder is full ({recorded}/{num_batch} batches) and growth is disabled"
            ),
            Self::BatchIndex { index, recorded } => {
                write!(f, "batch {index} >= recorded batches {recorded}")
            }
            Self::EmptyBatch => write!(f, "batch carries no channel"),
            Self::OversizedBatch {
                channel,
                samples,
                batch_size,
            } => write!(
                f,
                "channel '{channel}' batch has {samples} samples, more than batch size {batch_size}"
            ),
            Self::ZeroBatchSize => write!(f, "batch size must be positive"),
            Self::ChannelShape { channel, source } => {
                write!(f, "channel '{channel}': {source}")
            }
            Self::Io { path, reason } => write!(f, "{}: {reason}", path.display()),
            Self::Corrupt { path, source } => {
                write!(f, "corrupted record {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RecordError {}

#[derive(Debug, Clone, PartialEq)]
pub struct LossRecorder {
    batch_size: usize,
    num_batch: usize,
    recorded_batches: usize,
    last_batch_size: BTreeMap<String, usize>,
    seed: u64,
    tensors: BTreeMap<String, DenseTensor>,
    attributes: BTreeMap<String, Value>,
}

impl LossRecorder {
    pub fn new(batch_size: usize) -> Result<Self, RecordError> {
        Self::with_seed(batch_size, fresh_seed())
    }

    pub fn with_seed(batch_size: usize, seed: u64) -> Result<Self, RecordError> {
        if batch_size == 0 {
            return Err(RecordError::ZeroBatchSize);
        }
        Ok(Self {
            batch_size,
            num_batch: 0,
            recorded_batches: 0,
            last_batch_size: BTreeMap::new(),
            seed,
            tensors: BTreeMap::new(),
            attributes: BTreeMap::new(),
        })
    }

    /// Pre-allocates `num_batch` batches for every template channel. Only the
    /// inner shape and dtype of each template are used.
    pub fn with_channels(
        batch_size: usize,
        num_batch: usize,
        templates: &BTreeMap<String, DenseTensor>,
    ) -> Result<Self, RecordError> {
        let mut recorder = Self::new(batch_size)?;
        let tensors = recorder.allocate_tensors(num_batch, templates)?;
        recorder.commit_tensors(num_batch, tensors);
        Ok(recorder)
    }

    /// Zeroed channels sized for `num_batch` batches, leaving `self` as is.
    fn allocate_tensors(
        &self,
        num_batch: usize,
        templates: &BTreeMap<String, DenseTensor>,
    ) -> Result<BTreeMap<String, DenseTensor>, RecordError> {
        if templates.is_empty() {
            return Err(RecordError::EmptyBatch);
        }
        let samples = num_batch * self.batch_size;
        templates
            .iter()
            .map(|(name, template)| {
                let mut shape = template.inner_shape().to_vec();
                shape.push(samples);
                DenseTensor::zeros(shape, template.dtype())
                    .map(|zeros| (name.clone(), zeros))
                    .map_err(|source| RecordError::ChannelShape {
                        channel: name.clone(),
                        source,
                    })
            })
            .collect()
    }

    fn commit_tensors(&mut self, num_batch: usize, tensors: BTreeMap<String, DenseTensor>) {
        self.last_batch_size = tensors
            .keys()
            .map(|name| (name.clone(), self.batch_size))
            .collect();
        self.tensors = tensors;
        self.num_batch = num_batch;
    }

    /// Forgets recorded batches (capacity is kept) and draws a new seed.
    pub fn reset(&mut self) {
        self.recorded_batches = 0;
        self.seed = fresh_seed();
        for size in self.last_batch_size.values_mut() {
            *size = self.batch_size;
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn num_batch(&self) -> usize {
        self.num_batch
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    #[must_use]
    pub fn has_channel(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recorded_batches
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recorded_batches == 0
    }

    /// `number` is 0-based.
    #[must_use]
    pub fn has_batch(&self, number: usize) -> bool {
        number < self.recorded_batches
    }

    #[must_use]
    pub fn capacity_samples(&self) -> usize {
        self.num_batch * self.batch_size
    }

    /// Exact count of recorded samples, taking the shortest last batch across
    /// channels.
    #[must_use]
    pub fn recorded_samples(&self) -> usize {
        if self.recorded_batches == 0 {
            return 0;
        }
        let last = self
            .last_batch_size
            .values()
            .copied()
            .min()
            .unwrap_or(self.batch_size);
        (self.recorded_batches - 1) * self.batch_size + last
    }

    #[must_use]
    pub fn last_batch_size(&self, channel: &str) -> Option<usize> {
        self.last_batch_size.get(channel).copied()
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Sets the capacity to `target` batches, zero-filling new space. Capacity
    /// never drops below the recorded batches.
    pub fn resize(&mut self, target: usize) {
        let target = target.max(self.recorded_batches);
        let samples = target * self.batch_size;
        for tensor in self.tensors.values_mut() {
            tensor.resize_samples(samples);
        }
        self.num_batch = target;
    }

    /// Cuts capacity down to the recorded batches, and each channel's storage
    /// down to the samples actually written.
    pub fn trim(&mut self) {
        self.num_batch = self.recorded_batches;
        for (name, tensor) in &mut self.tensors {
            let last = self
                .last_batch_size
                .get(name)
                .copied()
                .unwrap_or(self.batch_size);
            let end = match self.recorded_batches {
                0 => 0,
                n => (n - 1) * self.batch_size + last,
            };
            tensor.resize_samples(end);
        }
    }

    pub fn append_batch(&mut self, batch: &BTreeMap<String, DenseTensor>) -> Result<(), RecordError> {
        self.append_batch_with(batch, Growth::Double)
    }

    pub fn append_batch_with(
        &mut self,
        batch: &BTreeMap<String, DenseTensor>,
        growth: Growth,
    ) -> Result<(), RecordError> {
        if batch.is_empty() {
            return Err(RecordError::EmptyBatch);
        }
        // The schema is only fixed once the first batch is accepted.
        let created = if self.tensors.is_empty() {
            Some(self.allocate_tensors(1, batch)?)
        } else {
            None
        };
        let schema = created.as_ref().unwrap_or(&self.tensors);

        for (name, tensor) in batch {
            let Some(slot) = schema.get(name) else {
                return Err(RecordError::Schema {
                    channel: name.clone(),
                    known: schema.keys().cloned().collect(),
                });
            };
            slot.ensure_same_layout(tensor)
                .map_err(|source| RecordError::ChannelShape {
                    channel: name.clone(),
                    source,
                })?;
            if tensor.samples() > self.batch_size {
                return Err(RecordError::OversizedBatch {
                    channel: name.clone(),
                    samples: tensor.samples(),
                    batch_size: self.batch_size,
                });
            }
        }
        if let Some(tensors) = created {
            self.commit_tensors(1, tensors);
        }

        let start = self.recorded_batches * self.batch_size;
        if start + self.batch_size > self.capacity_samples() {
            match growth {
                Growth::Double => self.resize((self.num_batch * 2).max(1)),
                Growth::Fixed => {
                    return Err(RecordError::Capacity {
                        num_batch: self.num_batch,
                        recorded: self.recorded_batches,
                    });
                }
            }
        }

        for (name, tensor) in batch {
            if let Some(slot) = self.tensors.get_mut(name) {
                slot.write_samples(start, tensor)
                    .map_err(|source| RecordError::ChannelShape {
                        channel: name.clone(),
                        source,
                    })?;
                self.last_batch_size.insert(name.clone(), tensor.samples());
            }
        }

        self.recorded_batches += 1;
        Ok(())
    }

    pub fn get_batch(&self, index: usize) -> Result<BTreeMap<String, DenseTensor>, RecordError> {
        self.tensors
            .keys()
            .map(|name| Ok((name.clone(), self.get_channel_batch(index, name)?)))
            .collect()
    }

    pub fn get_channel_batch(&self, index: usize, channel: &str) -> Result<DenseTensor, RecordError> {
        if !self.has_batch(index) {
            return Err(RecordError::BatchIndex {
                index,
                recorded: self.recorded_batches,
            });
        }
        let Some(tensor) = self.tensors.get(channel) else {
            return Err(RecordError::Schema {
                channel: channel.to_string(),
                known: self.tensors.keys().cloned().collect(),
            });
        };

        let start = index * self.batch_size;
        let width = if index + 1 == self.recorded_batches {
            self.last_batch_size
                .get(channel)
                .copied()
                .unwrap_or(self.batch_size)
        } else {
            self.batch_size
        };
        tensor
            .narrow_samples(start, start + width)
            .map_err(|source| RecordError::ChannelShape {
                channel: channel.to_string(),
                source,
            })
    }

    /// Trims, then writes the whole recorder to `path`.
    pub fn save(&mut self, path: &Path) -> Result<(), RecordError> {
        self.trim();
        self.save_untrimmed(path)
    }

    pub fn save_untrimmed(&self, path: &Path) -> Result<(), RecordError> {
        let body = RecordBody {
            batch_size: self.batch_size,
            num_batch: self.num_batch,
            recorded_batches: self.recorded_batches,
            seed: self.seed,
            last_batch_size: self.last_batch_size.clone(),
            attributes: self.attributes.clone(),
            channels: self
                .tensors
                .iter()
                .map(|(name, tensor)| ChannelPayload {
                    name: name.clone(),
                    dtype: tensor.dtype().label().to_string(),
                    shape: tensor.shape().to_vec(),
                    bits: tensor.storage().iter().map(|v| v.to_bits()).collect(),
                })
                .collect(),
        };
        let encoded = encode_record(&body).map_err(|source| RecordError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| RecordError::Io {
                path: parent.to_path_buf(),
                reason: format!("failed to create record dir: {error}"),
            })?;
        }
        fs::write(path, encoded).map_err(|error| RecordError::Io {
            path: path.to_path_buf(),
            reason: format!("failed to write record: {error}"),
        })
    }

    pub fn load(path: &Path) -> Result<Self, RecordError> {
        Self::load_with_mode(path, DecodeMode::Strict)
    }

    pub fn load_with_mode(path: &Path, mode: DecodeMode) -> Result<Self, RecordError> {
        let raw = fs::read_to_string(path).map_err(|error| RecordError::Io {
            path: path.to_path_buf(),
            reason: format!("failed to read record: {error}"),
        })?;
        let corrupt = |source| RecordError::Corrupt {
            path: path.to_path_buf(),
            source,
        };
        let envelope = decode_record(&raw, mode).map_err(corrupt)?;

        let mut tensors = BTreeMap::new();
        let capacity = envelope.num_batch * envelope.batch_size;
        for channel in envelope.channels {
            let dtype = DType::from_label(&channel.dtype).ok_or_else(|| {
                corrupt(SerializeError::IncompatiblePayload {
                    reason: format!(
                        "channel '{}' has unknown dtype '{}'",
                        channel.name, channel.dtype
                    ),
                })
            })?;
            let storage = channel.bits.iter().map(|bits| f64::from_bits(*bits)).collect();
            let mut tensor = DenseTensor::from_storage(channel.shape, dtype, storage)
                .map_err(|source| RecordError::ChannelShape {
                    channel: channel.name.clone(),
                    source,
                })?;
            if tensor.samples() < capacity {
                tensor.resize_samples(capacity);
            }
            tensors.insert(channel.name, tensor);
        }

        Ok(Self {
            batch_size: envelope.batch_size,
            num_batch: envelope.num_batch,
            recorded_batches: envelope.recorded_batches,
            last_batch_size: envelope.last_batch_size,
            seed: envelope.seed,
            tensors,
            attributes: envelope.attributes,
        })
    }
}

impl fmt::Display for LossRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.keys().collect();
        write!(f, "Recorder for {}", keys.join(" "))
    }
}

#[must_use]
pub fn record_file_name(name: &str) -> String {
    format!("{RECORD_FILE_PREFIX}{name}{RECORD_FILE_SUFFIX}")
}

fn record_name(file_name: &str) -> Option<&str> {
    let name = file_name
        .strip_prefix(RECORD_FILE_PREFIX)?
        .strip_suffix(RECORD_FILE_SUFFIX)?;
    (!name.is_empty()).then_some(name)
}

/// Result of scanning a directory for recorders; unreadable files are
/// reported, never fatal.
#[derive(Debug, Default)]
pub struct RecorderScan {
    pub recorders: BTreeMap<String, LossRecorder>,
    pub failures: BTreeMap<String, RecordError>,
}

/// Maps every `record-<name>.json` in `dir` to its path.
pub fn record_paths(dir: &Path) -> Result<BTreeMap<String, PathBuf>, RecordError> {
    let entries = fs::read_dir(dir).map_err(|error| RecordError::Io {
        path: dir.to_path_buf(),
        reason: format!("failed to list record dir: {error}"),
    })?;
    let mut paths = BTreeMap::new();
    for entry in entries.filter_map(Result::ok) {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(name) = record_name(file_name) {
            paths.insert(name.to_string(), entry.path());
        }
    }
    Ok(paths)
}

pub fn load_all(
    dir: &Path,
    mode: DecodeMode,
    ledger: &mut EvidenceLedger,
) -> Result<RecorderScan, RecordError> {
    let mut scan = RecorderScan::default();
    for (name, path) in record_paths(dir)? {
        match LossRecorder::load_with_mode(&path, mode) {
            Ok(recorder) => {
                scan.recorders.insert(name, recorder);
            }
            Err(error) => {
                ledger.record_checkpoint_decode_failure(&path, &error);
                scan.failures.insert(name, error);
            }
        }
    }
    ledger.record(
        EvidenceKind::Record,
        format!(
            "loaded {} recorders from {} ({} failed)",
            scan.recorders.len(),
            dir.display(),
            scan.failures.len()
        ),
    );
    Ok(scan)
}

/// Loads the recorders of the given names; missing files are warned about.
pub fn load_named<'a>(
    dir: &Path,
    names: impl IntoIterator<Item = &'a str>,
    mode: DecodeMode,
    ledger: &mut EvidenceLedger,
) -> RecorderScan {
    let mut scan = RecorderScan::default();
    for name in names {
        let path = dir.join(record_file_name(name));
        if !path.exists() {
            ledger.warn(
                EvidenceKind::Record,
                format!("{} not found", record_file_name(name)),
            );
            continue;
        }
        match LossRecorder::load_with_mode(&path, mode) {
            Ok(recorder) => {
                scan.recorders.insert(name.to_string(), recorder);
            }
            Err(error) => {
                ledger.record_checkpoint_decode_failure(&path, &error);
                scan.failures.insert(name.to_string(), error);
            }
        }
    }
    scan
}

/// Channels a recorder lacks among `needed`.
#[must_use]
pub fn missing_channels<'a>(recorder: &LossRecorder, needed: &[&'a str]) -> BTreeSet<&'a str> {
    needed
        .iter()
        .copied()
        .filter(|channel| !recorder.has_channel(channel))
        .collect()
}

fn fresh_seed() -> u64 {
    rand::thread_rng().gen_range(1..100_000_000)
}
