//! Runtime knobs (timeouts, error TTLs, identity strictness).

use std::time::Duration;

use quarry_core::QuarryError;

use crate::schema::FieldClass;

/// What identity resolution does when more than one candidate matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiguityPolicy {
    /// Take the first candidate in listing order.
    #[default]
    FirstMatch,
    /// Fail with `Ambiguous`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on a single field computation.
    pub compute_timeout: Duration,
    /// TTL of cached errors on static fields; `None` keeps them until invalidated.
    pub static_error_ttl: Option<Duration>,
    /// TTL of cached errors on transient fields and of timeouts.
    pub transient_error_ttl: Option<Duration>,
    pub ambiguity: AmbiguityPolicy,
    /// How long `Runtime::field` waits for a watched field to report.
    pub ready_wait: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compute_timeout: Duration::from_secs(60),
            static_error_ttl: None,
            transient_error_ttl: Some(Duration::from_secs(30)),
            ambiguity: AmbiguityPolicy::FirstMatch,
            ready_wait: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `QUARRY_*` environment variables.
    ///
    /// A TTL of `0` seconds disables expiry for that class.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_u64("QUARRY_COMPUTE_TIMEOUT_MS") {
            cfg.compute_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_u64("QUARRY_STATIC_ERROR_TTL_SECS") {
            cfg.static_error_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = env_u64("QUARRY_TRANSIENT_ERROR_TTL_SECS") {
            cfg.transient_error_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = env_u64("QUARRY_READY_WAIT_MS") {
            cfg.ready_wait = Duration::from_millis(ms);
        }
        let strict = std::env::var("QUARRY_STRICT_IDENTITY")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if strict {
            cfg.ambiguity = AmbiguityPolicy::Reject;
        }
        cfg
    }

    /// How long a cached error of `class` stays valid. Timeouts always count as transient.
    pub fn error_ttl(&self, class: FieldClass, err: &QuarryError) -> Option<Duration> {
        if matches!(err, QuarryError::Timeout { .. }) {
            return self.transient_error_ttl;
        }
        match class {
            FieldClass::Static => self.static_error_ttl,
            FieldClass::Transient => self.transient_error_ttl,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> { std::env::var(key).ok().and_then(|s| s.trim().parse().ok()) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_use_transient_ttl_even_on_static_fields() {
        let cfg = RuntimeConfig::default();
        let timeout = QuarryError::Timeout { field: "content".into(), after_ms: 10 };
        assert_eq!(cfg.error_ttl(FieldClass::Static, &timeout), Some(Duration::from_secs(30)));
        assert_eq!(cfg.error_ttl(FieldClass::Static, &QuarryError::not_found("x")), None);
        assert_eq!(cfg.error_ttl(FieldClass::Transient, &QuarryError::io("reset")), Some(Duration::from_secs(30)));
    }
}
