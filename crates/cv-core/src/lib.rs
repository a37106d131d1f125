#![forbid(unsafe_code)]

//! Dense tensors laid out with the sample axis last.
//!
//! Every recorded channel is a tensor of shape `[...inner, samples]`. Storage
//! is row-major, so each inner position owns a contiguous run of samples and
//! slicing or writing a range of samples touches one run per inner position.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I64,
}

impl DType {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I64 => "i64",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "f32" => Some(Self::F32),
            "f64" => Some(Self::F64),
            "i64" => Some(Self::I64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    ScalarHasNoSampleAxis,
    StorageLengthMismatch {
        expected: usize,
        actual: usize,
    },
    InnerShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    DTypeMismatch {
        expected: DType,
        actual: DType,
    },
    SampleRangeOutOfBounds {
        start: usize,
        end: usize,
        samples: usize,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScalarHasNoSampleAxis => write!(f, "scalar tensors have no sample axis"),
            Self::StorageLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "storage length mismatch: expected={expected}, actual={actual}"
                )
            }
            Self::InnerShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "inner shape mismatch: expected={expected:?}, actual={actual:?}"
                )
            }
            Self::DTypeMismatch { expected, actual } => {
                write!(f, "dtype mismatch: expected={expected}, actual={actual}")
            }
            Self::SampleRangeOutOfBounds {
                start,
                end,
                samples,
            } => write!(
                f,
                "sample range {start}..{end} out of bounds for {samples} samples"
            ),
        }
    }
}

impl std::error::Error for TensorError {}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    shape: Vec<usize>,
    dtype: DType,
    storage: Vec<f64>,
}

impl DenseTensor {
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self, TensorError> {
        if shape.is_empty() {
            return Err(TensorError::ScalarHasNoSampleAxis);
        }
        let numel = shape.iter().copied().product();
        Ok(Self {
            shape,
            dtype,
            storage: vec![0.0; numel],
        })
    }

    pub fn from_storage(
        shape: Vec<usize>,
        dtype: DType,
        storage: Vec<f64>,
    ) -> Result<Self, TensorError> {
        if shape.is_empty() {
            return Err(TensorError::ScalarHasNoSampleAxis);
        }
        let expected: usize = shape.iter().copied().product();
        if expected != storage.len() {
            return Err(TensorError::StorageLengthMismatch {
                expected,
                actual: storage.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            storage,
        })
    }

    /// One value per sample, e.g. a per-sample loss.
    pub fn from_samples(values: Vec<f64>, dtype: DType) -> Self {
        Self {
            shape: vec![values.len()],
            dtype,
            storage: values,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn storage(&self) -> &[f64] {
        &self.storage
    }

    #[must_use]
    pub fn into_storage(self) -> Vec<f64> {
        self.storage
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    #[must_use]
    pub fn inner_shape(&self) -> &[usize] {
        &self.shape[..self.shape.len() - 1]
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    fn rows(&self) -> usize {
        self.inner_shape().iter().copied().product()
    }

    /// Values of one sample, in inner row-major order.
    pub fn sample(&self, index: usize) -> Result<Vec<f64>, TensorError> {
        let samples = self.samples();
        if index >= samples {
            return Err(TensorError::SampleRangeOutOfBounds {
                start: index,
                end: index + 1,
                samples,
            });
        }
        Ok((0..self.rows())
            .map(|row| self.storage[row * samples + index])
            .collect())
    }

    pub fn narrow_samples(&self, start: usize, end: usize) -> Result<Self, TensorError> {
        let samples = self.samples();
        if start > end || end > samples {
            return Err(TensorError::SampleRangeOutOfBounds {
                start,
                end,
                samples,
            });
        }
        let width = end - start;
        let mut storage = Vec::with_capacity(self.rows() * width);
        for row in 0..self.rows() {
            let offset = row * samples;
            storage.extend_from_slice(&self.storage[offset + start..offset + end]);
        }
        let mut shape = self.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = width;
        }
        Ok(Self {
            shape,
            dtype: self.dtype,
            storage,
        })
    }

    /// Copies `src` into the sample range starting at `start`.
    pub fn write_samples(&mut self, start: usize, src: &Self) -> Result<(), TensorError> {
        self.ensure_same_layout(src)?;
        let samples = self.samples();
        let width = src.samples();
        let end = start + width;
        if end > samples {
            return Err(TensorError::SampleRangeOutOfBounds {
                start,
                end,
                samples,
            });
        }
        for row in 0..self.rows() {
            let dst = row * samples + start;
            let from = row * width;
            self.storage[dst..dst + width].copy_from_slice(&src.storage[from..from + width]);
        }
        Ok(())
    }

    /// Grows with zeros or truncates the sample axis to `target` samples.
    pub fn resize_samples(&mut self, target: usize) {
        let samples = self.samples();
        if target == samples {
            return;
        }
        let rows = self.rows();
        let keep = samples.min(target);
        let mut storage = vec![0.0; rows * target];
        for row in 0..rows {
            storage[row * target..row * target + keep]
                .copy_from_slice(&self.storage[row * samples..row * samples + keep]);
        }
        if let Some(last) = self.shape.last_mut() {
            *last = target;
        }
        self.storage = storage;
    }

    pub fn ensure_same_layout(&self, other: &Self) -> Result<(), TensorError> {
        if self.dtype != other.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype,
                actual: other.dtype,
            });
        }
        if self.inner_shape() != other.inner_shape() {
            return Err(TensorError::InnerShapeMismatch {
                expected: self.inner_shape().to_vec(),
                actual: other.inner_shape().to_vec(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn bits_eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.dtype == other.dtype
            && self
                .storage
                .iter()
                .zip(other.storage.iter())
                .all(|(lhs, rhs)| lhs.to_bits() == rhs.to_bits())
    }
}
