//! Content revisions for cached services.
//!
//! This module provides [`ServiceRevision`], an order-independent content
//! hash, and [`RevisionHasher`], which builds one from constituent parts
//! using FNV-1a.

use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;

/// Order-independent content hash summarizing a service's current state.
///
/// Consumers compare revisions to detect "nothing changed" without
/// re-fetching values. An empty revision represents "not yet computed".
///
/// # Example
///
/// ```rust
/// use mesh_core::ServiceRevision;
///
/// let a = ServiceRevision::compute("svc-rev", ["ins-b", "ins-a"]);
/// let b = ServiceRevision::compute("svc-rev", ["ins-a", "ins-b"]);
///
/// assert_eq!(a, b);
/// assert!(!a.is_empty());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ServiceRevision(String);

impl ServiceRevision {
    /// Create a revision from a precomputed string.
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    /// Create an empty revision (not computed yet).
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Compute a revision from the service's own revision and an unordered
    /// set of constituent identifiers.
    #[must_use]
    pub fn compute<I, S>(own: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts: Vec<S> = parts.into_iter().collect();
        parts.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

        let mut hasher = RevisionHasher::new();
        hasher.write_part(own);
        for part in &parts {
            hasher.write_part(part.as_ref());
        }
        hasher.finish()
    }

    /// Check if the revision is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the revision as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ServiceRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceRevision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ServiceRevision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Incremental FNV-1a hasher over revision parts.
///
/// Parts are separated by a byte that cannot appear in UTF-8, so `["ab", "c"]`
/// and `["a", "bc"]` hash differently. Callers are responsible for ordering.
#[derive(Default)]
pub struct RevisionHasher {
    inner: FnvHasher,
    parts: usize,
}

impl fmt::Debug for RevisionHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevisionHasher")
            .field("parts", &self.parts)
            .finish()
    }
}

impl RevisionHasher {
    /// Create a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one part.
    pub fn write_part(&mut self, part: &str) {
        self.inner.write(part.as_bytes());
        self.inner.write_u8(0xff);
        self.parts += 1;
    }

    /// Number of parts written so far.
    #[must_use]
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Finish hashing into a 16 hex digit revision.
    #[must_use]
    pub fn finish(&self) -> ServiceRevision {
        ServiceRevision(format!("{:016x}", self.inner.finish()))
    }
}
