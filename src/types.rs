//! Newtype wrappers for domain identifiers in the durable execution engine.
//!
//! This module provides type-safe wrappers for string identifiers used
//! throughout the engine. These newtypes prevent accidental mixing of
//! different ID types at compile time while maintaining full compatibility
//! with string-based APIs.
//!
//! Operation identifiers are hierarchical: a child operation's id is its
//! parent's id plus a dash-joined ordinal segment (`"1" -> "1-1" -> "1-1-3"`).
//! The plain hierarchical form is used for all in-memory bookkeeping; before
//! an id is transmitted to the checkpoint store it is hashed into a
//! fixed-width [`HashedOperationId`].
//!
//! # Example
//!
//! ```rust
//! use durable_engine::types::OperationId;
//!
//! let root = OperationId::root();
//! let child = root.child(1);
//! let grandchild = child.child(2);
//!
//! assert_eq!(grandchild.as_str(), "1-1-2");
//! assert_eq!(grandchild.parent(), Some(child));
//! ```

use std::fmt;
use std::hash::Hash;
use std::ops::Deref;

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Error returned when newtype validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The type name that failed validation
    pub type_name: &'static str,
    /// Description of the validation failure
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// A hierarchical identifier for an operation within a durable execution.
///
/// `OperationId` wraps a `String` holding the dash-joined path of ordinals
/// from the root context down to the operation. The path structure is what
/// makes ancestor walks possible without object graphs: `parent()` strips
/// the last segment, and repeated application reaches the root.
///
/// # Construction
///
/// ```rust
/// use durable_engine::types::OperationId;
///
/// // The root context id
/// let root = OperationId::root();
///
/// // Children are derived by ordinal
/// let first = root.child(1);
/// assert_eq!(first.as_str(), "1-1");
///
/// // Raw construction (no validation)
/// let id: OperationId = "1-4-2".into();
/// assert_eq!(id.parent().unwrap().as_str(), "1-4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// The identifier of the root execution context.
    pub fn root() -> Self {
        Self("1".to_string())
    }

    /// Creates a new `OperationId` with validation.
    ///
    /// Returns an error if the value is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError {
                type_name: "OperationId",
                message: "value cannot be empty".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Creates a new `OperationId` without validation.
    #[inline]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the id of the child operation with the given ordinal.
    pub fn child(&self, ordinal: u64) -> Self {
        Self(format!("{}-{}", self.0, ordinal))
    }

    /// Returns the parent operation's id, or `None` for a single-segment id.
    pub fn parent(&self) -> Option<Self> {
        self.0.rfind('-').map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Returns true if `ancestor` is a proper ancestor of this id.
    pub fn is_descendant_of(&self, ancestor: &OperationId) -> bool {
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(ancestor.0.as_str())
            && self.0.as_bytes()[ancestor.0.len()] == b'-'
    }

    /// Hashes this id into its fixed-width transmission form.
    ///
    /// The store is keyed by hashed ids; hierarchical paths grow without
    /// bound with nesting depth, so only the hash crosses the wire. The
    /// hash is the first 16 bytes of a Blake2b-512 digest, hex-encoded.
    pub fn hashed(&self) -> HashedOperationId {
        use fmt::Write;

        let mut hasher = Blake2b512::new();
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            let _ = write!(hex, "{:02x}", byte);
        }
        HashedOperationId(hex)
    }

    /// Returns the inner string value.
    #[inline]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for OperationId {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for OperationId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for OperationId {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationId {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The hashed, fixed-width form of an [`OperationId`] used on the wire.
///
/// Hashed ids are what the checkpoint store indexes by; the hierarchical
/// form never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashedOperationId(String);

impl HashedOperationId {
    /// Creates a hashed id from an already-hashed string (e.g. store state).
    #[inline]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HashedOperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for HashedOperationId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A unique identifier for one durable execution.
///
/// Assigned by the host when the workflow is first started and constant
/// across all invocations (original run and every replay).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Creates a new `ExecutionId` with validation.
    ///
    /// Returns an error if the value is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError {
                type_name: "ExecutionId",
                message: "value cannot be empty".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Creates a new `ExecutionId` without validation.
    #[inline]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for ExecutionId {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for ExecutionId {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExecutionId {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An opaque token authorizing writes against the checkpoint store.
///
/// Every acknowledged `checkpoint` call returns a fresh token which replaces
/// the previous one; presenting a stale token produces the invalid-token
/// store error that is classified as invocation-retryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(String);

impl CheckpointToken {
    /// Creates a new `CheckpointToken` without validation.
    #[inline]
    pub fn new_unchecked(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CheckpointToken {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CheckpointToken {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
