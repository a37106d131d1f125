#![forbid(unsafe_code)]

//! Dataset metadata registry.
//!
//! Names follow three conventions on top of a base set name:
//! `mnist-1-2` holds classes 1 and 2 out, `mnist+0+3` keeps only classes 0
//! and 3, and a trailing `90` denotes the rotated variant whose two spatial
//! dimensions are swapped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const ROTATED_SUFFIX: &str = "90";
const ANY_HELDOUT_SUFFIX: &str = "-?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSpec {
    pub shape: Vec<usize>,
    #[serde(default)]
    pub classes: Option<Vec<String>>,
}

impl DatasetSpec {
    #[must_use]
    pub fn labels(&self) -> usize {
        self.classes.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    UnknownDataset { name: String },
    InvalidHeldout { name: String, reason: String },
    Io { path: PathBuf, reason: String },
    Corrupt { path: PathBuf, reason: String },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDataset { name } => write!(f, "unknown dataset '{name}'"),
            Self::InvalidHeldout { name, reason } => {
                write!(f, "invalid held-out classes in '{name}': {reason}")
            }
            Self::Io { path, reason } => write!(f, "{}: {reason}", path.display()),
            Self::Corrupt { path, reason } => {
                write!(f, "corrupted dataset registry {}: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for DataError {}

/// A parent set and the sorted classes held out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldOut {
    pub parent: String,
    pub classes: Vec<usize>,
}

/// Shapes and class names of every known dataset. Built once per run and
/// passed by reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetRegistry {
    sets: BTreeMap<String, DatasetSpec>,
}

impl DatasetRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The image sets the harness ships configuration for.
    #[must_use]
    pub fn builtin() -> Self {
        let digits: Vec<String> = (0..10).map(|d| d.to_string()).collect();
        let letters: Vec<String> = ('a'..='z').map(String::from).collect();
        let named = |names: &[&str]| -> Option<Vec<String>> {
            Some(names.iter().map(|n| (*n).to_string()).collect())
        };

        let mut registry = Self::new();
        registry.insert(
            "mnist",
            DatasetSpec {
                shape: vec![1, 28, 28],
                classes: Some(digits.clone()),
            },
        );
        registry.insert(
            "fashion",
            DatasetSpec {
                shape: vec![1, 28, 28],
                classes: named(&[
                    "tshirt", "trouser", "pullover", "dress", "coat", "sandal", "shirt",
                    "sneaker", "bag", "boot",
                ]),
            },
        );
        registry.insert(
            "letters",
            DatasetSpec {
                shape: vec![1, 28, 28],
                classes: Some(letters),
            },
        );
        registry.insert(
            "cifar10",
            DatasetSpec {
                shape: vec![3, 32, 32],
                classes: named(&[
                    "airplane",
                    "automobile",
                    "bird",
                    "cat",
                    "deer",
                    "dog",
                    "frog",
                    "horse",
                    "ship",
                    "truck",
                ]),
            },
        );
        registry.insert(
            "svhn",
            DatasetSpec {
                shape: vec![3, 32, 32],
                classes: Some(digits),
            },
        );
        for lsun in ["lsunc", "lsunr"] {
            registry.insert(
                lsun,
                DatasetSpec {
                    shape: vec![3, 32, 32],
                    classes: None,
                },
            );
        }
        registry
    }

    pub fn from_json_str(raw: &str, origin: &Path) -> Result<Self, DataError> {
        let sets: BTreeMap<String, DatasetSpec> =
            serde_json::from_str(raw).map_err(|error| DataError::Corrupt {
                path: origin.to_path_buf(),
                reason: error.to_string(),
            })?;
        Ok(Self { sets })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, DataError> {
        let raw = fs::read_to_string(path).map_err(|error| DataError::Io {
            path: path.to_path_buf(),
            reason: format!("failed to read dataset registry: {error}"),
        })?;
        Self::from_json_str(&raw, path)
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: DatasetSpec) {
        self.sets.insert(name.into(), spec);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DatasetSpec> {
        self.sets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    /// Splits a held-out name into its parent and held-out classes.
    pub fn heldout_classes(&self, name: &str) -> Result<HeldOut, DataError> {
        let invalid = |reason: String| DataError::InvalidHeldout {
            name: name.to_string(),
            reason,
        };

        if name.contains('-') {
            let mut parts = name.split('-');
            let parent = parts.next().unwrap_or_default().to_string();
            let mut classes = parts
                .map(|part| {
                    part.parse::<usize>()
                        .map_err(|error| invalid(format!("'{part}': {error}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            classes.sort_unstable();
            return Ok(HeldOut { parent, classes });
        }

        if name.contains('+') {
            let mut parts = name.split('+');
            let parent = parts.next().unwrap_or_default().to_string();
            let kept = parts
                .map(|part| {
                    part.parse::<usize>()
                        .map_err(|error| invalid(format!("'{part}': {error}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let labels = self.base_labels(&parent)?;
            let classes = (0..labels).filter(|c| !kept.contains(c)).collect();
            return Ok(HeldOut { parent, classes });
        }

        Ok(HeldOut {
            parent: name.to_string(),
            classes: Vec::new(),
        })
    }

    /// Inverse of [`DatasetRegistry::heldout_classes`]. More than half the
    /// classes held out switches to the `+kept` form.
    pub fn name_with_heldout(&self, parent: &str, heldout: &[usize]) -> Result<String, DataError> {
        if heldout.is_empty() {
            return Ok(parent.to_string());
        }
        let labels = self.base_labels(parent)?;
        let mut heldout = heldout.to_vec();
        heldout.sort_unstable();
        heldout.dedup();

        if heldout.len() * 2 > labels {
            let kept: Vec<String> = (0..labels)
                .filter(|c| !heldout.contains(c))
                .map(|c| c.to_string())
                .collect();
            return Ok(format!("{parent}+{}", kept.join("+")));
        }
        let dropped: Vec<String> = heldout.iter().map(ToString::to_string).collect();
        Ok(format!("{parent}-{}", dropped.join("-")))
    }

    /// Input shape and label count, accounting for held-out classes and
    /// rotation. `None` for an unknown parent set.
    #[must_use]
    pub fn shape_and_labels(&self, name: &str) -> Option<(Vec<usize>, usize)> {
        if let Some(base) = name.strip_suffix(ROTATED_SUFFIX) {
            let (mut shape, labels) = self.shape_and_labels(base)?;
            let n = shape.len();
            if n >= 2 {
                shape.swap(n - 2, n - 1);
            }
            return Some((shape, labels));
        }
        let heldout = self.heldout_classes(name).ok()?;
        let spec = self.sets.get(&heldout.parent)?;
        Some((
            spec.shape.clone(),
            spec.labels().saturating_sub(heldout.classes.len()),
        ))
    }

    #[must_use]
    pub fn labels(&self, name: &str) -> Option<usize> {
        self.shape_and_labels(name).map(|(_, labels)| labels)
    }

    /// Class names left once held-out classes are removed. Sets without
    /// classes have a single pseudo-class named after the set.
    #[must_use]
    pub fn classes(&self, name: &str) -> Option<Vec<String>> {
        if let Some(base) = name.strip_suffix(ROTATED_SUFFIX) {
            return Some(
                self.classes(base)?
                    .into_iter()
                    .map(|class| format!("{class}{ROTATED_SUFFIX}"))
                    .collect(),
            );
        }
        let heldout = self.heldout_classes(name).ok()?;
        let spec = self.sets.get(&heldout.parent)?;
        let parent_classes = spec
            .classes
            .clone()
            .unwrap_or_else(|| vec![name.to_uppercase()]);
        Some(
            parent_classes
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !heldout.classes.contains(i))
                .map(|(_, class)| class)
                .collect(),
        )
    }

    /// Datasets sharing the input shape of `name`, used as its default OOD
    /// sets.
    ///
    /// A held-out set pairs with its complement, `x-?` with `x+?`. A plain set
    /// pairs with every other set of its shape and its own rotation; a
    /// rotated set pairs with every set of the base shape.
    #[must_use]
    pub fn same_size(&self, name: &str) -> Vec<String> {
        self.same_size_inner(name, false)
    }

    fn same_size_inner(&self, name: &str, rotated: bool) -> Vec<String> {
        if let Some(parent) = name.strip_suffix(ANY_HELDOUT_SUFFIX) {
            return vec![format!("{parent}+?")];
        }
        if let Some(base) = name.strip_suffix(ROTATED_SUFFIX) {
            return self.same_size_inner(base, true);
        }

        let Ok(heldout) = self.heldout_classes(name) else {
            return Vec::new();
        };
        if !heldout.classes.is_empty() {
            let Ok(labels) = self.base_labels(&heldout.parent) else {
                return Vec::new();
            };
            let complement: Vec<usize> = (0..labels)
                .filter(|c| !heldout.classes.contains(c))
                .collect();
            return self
                .name_with_heldout(&heldout.parent, &complement)
                .map(|name| vec![name])
                .unwrap_or_default();
        }

        let Some(spec) = self.sets.get(name) else {
            return Vec::new();
        };
        let mut same: Vec<String> = self
            .sets
            .iter()
            .filter(|(other, other_spec)| {
                other_spec.shape == spec.shape && (rotated || other.as_str() != name)
            })
            .map(|(other, _)| other.clone())
            .collect();
        if !rotated {
            same.push(format!("{name}{ROTATED_SUFFIX}"));
        }
        same
    }

    fn base_labels(&self, parent: &str) -> Result<usize, DataError> {
        self.sets
            .get(parent)
            .map(DatasetSpec::labels)
            .ok_or_else(|| DataError::UnknownDataset {
                name: parent.to_string(),
            })
    }
}
