//! Error taxonomy shared by the runtime and the vendor packs.

use serde::{Deserialize, Serialize};

/// Errors surfaced by resource construction and field computation.
///
/// Errors are `Clone` because a cached error is handed to every caller that
/// queries the same field until the entry is invalidated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum QuarryError {
    /// The resource or field legitimately does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// More than one candidate satisfied a lookup that allows at most one.
    #[error("ambiguous: {0}")]
    Ambiguous(String),

    /// The underlying vendor call (network, filesystem) failed.
    #[error("io: {0}")]
    TransientIo(String),

    /// Constructor arguments are of the wrong type or cannot resolve an identity.
    #[error("misconfigured arguments: {0}")]
    MisconfiguredArguments(String),

    /// The value depends on a watched source that has not reported yet.
    #[error("not ready")]
    NotReady,

    #[error("computing '{field}' timed out after {after_ms}ms")]
    Timeout { field: String, after_ms: u64 },

    #[error("cannot find resource '{0}'")]
    UnknownResource(String),

    #[error("resource '{resource}' has no field '{field}'")]
    UnknownField { resource: String, field: String },

    #[error("internal: {0}")]
    Internal(String),
}

impl QuarryError {
    pub fn not_found(what: impl std::fmt::Display) -> Self { Self::NotFound(what.to_string()) }
    pub fn misconfigured(what: impl std::fmt::Display) -> Self { Self::MisconfiguredArguments(what.to_string()) }
    pub fn io(err: impl std::fmt::Display) -> Self { Self::TransientIo(err.to_string()) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_not_ready(&self) -> bool { matches!(self, Self::NotReady) }

    /// Whether the error may be memoised in a field's cache entry.
    ///
    /// Argument errors depend on the caller and readiness is not a result.
    pub fn is_cacheable(&self) -> bool {
        !matches!(
            self,
            Self::NotReady | Self::MisconfiguredArguments(_) | Self::UnknownField { .. } | Self::UnknownResource(_)
        )
    }
}

impl From<anyhow::Error> for QuarryError {
    fn from(err: anyhow::Error) -> Self { Self::TransientIo(format!("{err:#}")) }
}

impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self { Self::Internal(format!("json: {err}")) }
}

pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cacheability_follows_taxonomy() {
        assert!(QuarryError::not_found("pod x").is_cacheable());
        assert!(QuarryError::io("connection reset").is_cacheable());
        assert!(QuarryError::Ambiguous("two modules".into()).is_cacheable());
        assert!(!QuarryError::NotReady.is_cacheable());
        assert!(!QuarryError::misconfigured("id must be a string").is_cacheable());
    }

    #[test]
    fn anyhow_maps_to_transient_io_with_context_chain() {
        let err = anyhow::anyhow!("socket closed").context("listing pods");
        let q: QuarryError = err.into();
        assert_eq!(q, QuarryError::TransientIo("listing pods: socket closed".into()));
    }
}
