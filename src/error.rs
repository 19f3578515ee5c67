//! Key codec and storage errors.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::io;

/// A metric key decoding error.
///
/// `DecodeError` indicates that a byte string does not contain a valid
/// canonical key encoding, or that a shared-region record is not
/// well-formed.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodeError {
    description: Cow<'static, str>,
}

impl DecodeError {
    /// Creates a new `DecodeError` with a 'best effort' root cause
    /// description.
    #[cold]
    pub(crate) fn new(description: impl Into<Cow<'static, str>>) -> DecodeError {
        DecodeError {
            description: description.into(),
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeError")
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decode metric key: {}", self.description)
    }
}

impl Error for DecodeError {}

/// A metric key encoding error.
///
/// `EncodeError` always indicates that a key field exceeds the width of its
/// length prefix. Key encoding is otherwise infallible.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncodeError {
    required: usize,
    max: usize,
}

impl EncodeError {
    /// Creates a new `EncodeError`.
    pub(crate) fn new(required: usize, max: usize) -> EncodeError {
        EncodeError { required, max }
    }

    /// Returns the length the field would need to encode.
    pub fn required_len(&self) -> usize {
        self.required
    }

    /// Returns the maximum length the field's length prefix can express.
    pub fn max_len(&self) -> usize {
        self.max
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to encode metric key; field exceeds length prefix (required: {}, max: {})",
            self.required, self.max
        )
    }
}

impl Error for EncodeError {}

/// An error raised by a storage operation.
///
/// Only [`StorageError::Encoding`] ever reaches aggregator code: region
/// exhaustion and lock failures are absorbed by the storage itself, which
/// logs them and returns a sentinel value, and corruption is repaired in
/// place during reconciliation.
#[derive(Debug)]
pub enum StorageError {
    /// An append would exceed the fixed region capacity.
    Exhausted {
        /// Bytes the region would need to hold the record.
        required: usize,
        /// Fixed capacity of the region.
        capacity: usize,
    },
    /// The region's record area is not a well-formed concatenation of
    /// records.
    Corrupt(DecodeError),
    /// The structured key could not be serialized.
    Encoding(EncodeError),
    /// The host failed to take the region lock.
    Lock(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Exhausted { required, capacity } => write!(
                f,
                "shared region exhausted (required: {required}, capacity: {capacity})"
            ),
            StorageError::Corrupt(err) => write!(f, "shared region corrupt: {err}"),
            StorageError::Encoding(err) => fmt::Display::fmt(err, f),
            StorageError::Lock(err) => write!(f, "region lock unavailable: {err}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Corrupt(err) => Some(err),
            StorageError::Encoding(err) => Some(err),
            StorageError::Lock(err) => Some(err),
            StorageError::Exhausted { .. } => None,
        }
    }
}

impl From<EncodeError> for StorageError {
    fn from(error: EncodeError) -> StorageError {
        StorageError::Encoding(error)
    }
}

impl From<DecodeError> for StorageError {
    fn from(error: DecodeError) -> StorageError {
        StorageError::Corrupt(error)
    }
}

/// An error raised when declaring or labeling a metric, or when registering
/// a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    /// The label values do not match the declared label names.
    InvalidLabels {
        /// Label names the metric was declared with.
        expected: Vec<String>,
        /// Label names the caller supplied.
        got: Vec<String>,
    },
    /// The label name is reserved for the metric type.
    ReservedLabel(String),
    /// A collector with the same uid is already registered.
    AlreadyRegistered(String),
}

impl fmt::Display for MetricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricError::InvalidLabels { expected, got } => write!(
                f,
                "invalid label values: expected {expected:?}, got {got:?}"
            ),
            MetricError::ReservedLabel(name) => {
                write!(f, "label name {name:?} is reserved")
            }
            MetricError::AlreadyRegistered(uid) => {
                write!(f, "collector {uid} already registered")
            }
        }
    }
}

impl Error for MetricError {}
