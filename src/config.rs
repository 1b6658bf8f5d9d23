use serde::Serialize;

use crate::util::env::{env_flag, env_parse};

/// Runtime knobs of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestConfig {
    /// Upper bound on concurrent detail operations (and their connections).
    pub workers: usize,
    /// Disable foreign-key enforcement on every ingest connection for the
    /// duration of the batch.
    pub suspend_referential_integrity: bool,
    /// Row-level messages kept per operation result.
    pub max_error_messages: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            suspend_referential_integrity: true,
            max_error_messages: 50,
        }
    }
}

impl IngestConfig {
    /// Defaults overridden by `INGEST_WORKERS`, `INGEST_SUSPEND_FK` and
    /// `INGEST_MAX_ERROR_MESSAGES`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("INGEST_WORKERS", defaults.workers).max(1),
            suspend_referential_integrity: env_flag(
                "INGEST_SUSPEND_FK",
                defaults.suspend_referential_integrity,
            ),
            max_error_messages: env_parse("INGEST_MAX_ERROR_MESSAGES", defaults.max_error_messages),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_suspended_referential_integrity(mut self, suspend: bool) -> Self {
        self.suspend_referential_integrity = suspend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_never_drops_to_zero() {
        assert_eq!(IngestConfig::default().with_workers(0).workers, 1);
        assert_eq!(IngestConfig::default().with_workers(12).workers, 12);
    }
}
