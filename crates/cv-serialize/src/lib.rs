#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECORD_SCHEMA_VERSION: u32 = 1;
const MAX_RECORD_PAYLOAD_BYTES: usize = 1 << 30;
const ENVELOPE_FIELDS: [&str; 9] = [
    "schema_version",
    "batch_size",
    "num_batch",
    "recorded_batches",
    "seed",
    "last_batch_size",
    "attributes",
    "channels",
    "source_hash",
];

/// One named channel. Values are IEEE-754 bit patterns so NaN payloads and
/// signed zeros survive the round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelPayload {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub bits: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordEnvelope {
    pub schema_version: u32,
    pub batch_size: usize,
    pub num_batch: usize,
    pub recorded_batches: usize,
    pub seed: u64,
    pub last_batch_size: BTreeMap<String, usize>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub channels: Vec<ChannelPayload>,
    pub source_hash: String,
}

/// Everything a recorder checkpoint carries, before hashing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordBody {
    pub batch_size: usize,
    pub num_batch: usize,
    pub recorded_batches: usize,
    pub seed: u64,
    pub last_batch_size: BTreeMap<String, usize>,
    pub attributes: BTreeMap<String, Value>,
    pub channels: Vec<ChannelPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    #[default]
    Strict,
    /// Tolerates unknown top-level fields written by newer tools.
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// FNV-1a over little-endian encodings; stable across platforms and runs.
#[derive(Debug, Clone)]
pub struct Det64Hasher {
    state: u64,
}

impl Default for Det64Hasher {
    fn default() -> Self {
        Self {
            state: 0xcbf2_9ce4_8422_2325,
        }
    }
}

impl Hasher for Det64Hasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= u64::from(*byte);
            self.state = self.state.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    fn write_u32(&mut self, value: u32) {
        self.write(&value.to_le_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    fn write_usize(&mut self, value: usize) {
        self.write_u64(value as u64);
    }
}

#[must_use]
pub fn det64_hex(bytes: &[u8]) -> String {
    let mut hasher = Det64Hasher::default();
    hasher.write(bytes);
    format!("det64:{:016x}", hasher.finish())
}

pub fn encode_record(body: &RecordBody) -> Result<String, SerializeError> {
    let channels = normalize_channels(&body.channels)?;
    let source_hash = record_hash(
        RECORD_SCHEMA_VERSION,
        body.batch_size,
        body.num_batch,
        body.recorded_batches,
        body.seed,
        &body.last_batch_size,
        &body.attributes,
        &channels,
    )?;

    let envelope = RecordEnvelope {
        schema_version: RECORD_SCHEMA_VERSION,
        batch_size: body.batch_size,
        num_batch: body.num_batch,
        recorded_batches: body.recorded_batches,
        seed: body.seed,
        last_batch_size: body.last_batch_size.clone(),
        attributes: body.attributes.clone(),
        channels,
        source_hash,
    };
    validate_structure(&envelope)?;

    serde_json::to_string(&envelope).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("record encoding failed: {error}"),
    })
}

pub fn decode_record(input: &str, mode: DecodeMode) -> Result<RecordEnvelope, SerializeError> {
    validate_payload_size(input)?;
    let envelope = match mode {
        DecodeMode::Strict => decode_strict(input)?,
        DecodeMode::Hardened => decode_hardened(input)?,
    };
    validate_record(&envelope)?;
    Ok(envelope)
}

fn decode_strict(input: &str) -> Result<RecordEnvelope, SerializeError> {
    serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn decode_hardened(input: &str) -> Result<RecordEnvelope, SerializeError> {
    let raw: Value = serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
        diagnostic: bounded(
            format!(
                "{error}; payload_prefix={} ",
                bounded(input.replace('\n', " ").as_str(), 96)
            )
            .as_str(),
            220,
        ),
    })?;

    let Value::Object(mut obj) = raw else {
        return Err(SerializeError::IncompatiblePayload {
            reason: "top-level record payload must be a JSON object".to_string(),
        });
    };

    let allowed: BTreeSet<&str> = ENVELOPE_FIELDS.into_iter().collect();
    obj.retain(|key, _| allowed.contains(key.as_str()));

    serde_json::from_value(Value::Object(obj)).map_err(|error| {
        SerializeError::IncompatiblePayload {
            reason: bounded(error.to_string().as_str(), 200),
        }
    })
}

fn validate_payload_size(input: &str) -> Result<(), SerializeError> {
    let actual = input.len();
    if actual > MAX_RECORD_PAYLOAD_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "record payload exceeds max bytes: actual={actual} max={MAX_RECORD_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn validate_record(envelope: &RecordEnvelope) -> Result<(), SerializeError> {
    if envelope.schema_version != RECORD_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: RECORD_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }

    let channels = normalize_channels(&envelope.channels)?;
    let expected = record_hash(
        envelope.schema_version,
        envelope.batch_size,
        envelope.num_batch,
        envelope.recorded_batches,
        envelope.seed,
        &envelope.last_batch_size,
        &envelope.attributes,
        &channels,
    )?;
    if envelope.source_hash != expected {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: envelope.source_hash.clone(),
        });
    }

    validate_structure(envelope)
}

fn validate_structure(envelope: &RecordEnvelope) -> Result<(), SerializeError> {
    if envelope.batch_size == 0 {
        return Err(SerializeError::IncompatiblePayload {
            reason: "batch_size must be positive".to_string(),
        });
    }
    if envelope.recorded_batches > envelope.num_batch {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "recorded_batches={} exceeds num_batch={}",
                envelope.recorded_batches, envelope.num_batch
            ),
        });
    }
    for channel in &envelope.channels {
        if channel.shape.is_empty() {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!("channel '{}' has no sample axis", channel.name),
            });
        }
        let numel: usize = channel.shape.iter().copied().product();
        if numel != channel.bits.len() {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!(
                    "channel '{}' declares {numel} values but carries {}",
                    channel.name,
                    channel.bits.len()
                ),
            });
        }
        match envelope.last_batch_size.get(&channel.name) {
            Some(last) if *last <= envelope.batch_size => {}
            Some(last) => {
                return Err(SerializeError::IncompatiblePayload {
                    reason: format!(
                        "channel '{}' last batch size {last} exceeds batch size {}",
                        channel.name, envelope.batch_size
                    ),
                });
            }
            None => {
                return Err(SerializeError::IncompatiblePayload {
                    reason: format!("channel '{}' has no last batch size", channel.name),
                });
            }
        }
    }
    Ok(())
}

fn normalize_channels(channels: &[ChannelPayload]) -> Result<Vec<ChannelPayload>, SerializeError> {
    let mut normalized = channels.to_vec();
    normalized.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
    for pair in normalized.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!("duplicate channel '{}'", pair[0].name),
            });
        }
    }
    Ok(normalized)
}

#[allow(clippy::too_many_arguments)]
fn record_hash(
    schema_version: u32,
    batch_size: usize,
    num_batch: usize,
    recorded_batches: usize,
    seed: u64,
    last_batch_size: &BTreeMap<String, usize>,
    attributes: &BTreeMap<String, Value>,
    channels: &[ChannelPayload],
) -> Result<String, SerializeError> {
    let mut hasher = Det64Hasher::default();
    hasher.write_u32(schema_version);
    hasher.write_usize(batch_size);
    hasher.write_usize(num_batch);
    hasher.write_usize(recorded_batches);
    hasher.write_u64(seed);
    for (name, size) in last_batch_size {
        hasher.write(name.as_bytes());
        hasher.write_u8(0);
        hasher.write_usize(*size);
    }
    let attributes =
        serde_json::to_string(attributes).map_err(|error| SerializeError::IncompatiblePayload {
            reason: format!("attributes are not serializable: {error}"),
        })?;
    hasher.write(attributes.as_bytes());
    for channel in channels {
        hasher.write(channel.name.as_bytes());
        hasher.write_u8(0);
        hasher.write(channel.dtype.as_bytes());
        hasher.write_u8(0);
        for dim in &channel.shape {
            hasher.write_usize(*dim);
        }
        for bits in &channel.bits {
            hasher.write_u64(*bits);
        }
    }
    Ok(format!("det64:{:016x}", hasher.finish()))
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}
