// ========================================================================================
//
//                                  RUN CONFIGURATION
//
// ========================================================================================
//
// Settings that outlive a single command line: retry behaviour, pool width and the
// score-loading switches. Read from a TOML file; command-line flags override it.
// Every field has a default that reproduces a plain run, so an empty file is valid.

use crate::error::ScoreError;
use crate::locate::LocateStrategy;
use crate::pool::PoolConfig;
use crate::prepare::{HeaderPolicy, LoadOptions};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoreConfig {
    pub retry: RetryPolicy,
    /// Worker count. `None` means `2 × logical cores`.
    pub workers: Option<usize>,
    /// Upper bound on the worker count and on the number of work chunks.
    pub max_concurrency: Option<usize>,
    /// Depth of the job queue. `None` means four jobs per worker.
    pub queue_bound: Option<usize>,
    /// Flip negative weights onto the other allele when loading the score.
    pub always_increment: bool,
    pub header_policy: HeaderPolicy,
    /// Strip `chrom_`/`chr` from chromosome names of custom layouts.
    pub strip_prs_chr: bool,
    pub locate: LocateStrategy,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: None,
            max_concurrency: None,
            queue_bound: None,
            always_increment: true,
            header_policy: HeaderPolicy::default(),
            strip_prs_chr: true,
            locate: LocateStrategy::default(),
        }
    }
}

impl ScoreConfig {
    pub fn from_file(path: &Path) -> Result<Self, ScoreError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ScoreError::io(format!("reading config '{}'", path.display()), e))?;
        Self::from_toml(&text)
            .map_err(|e| ScoreError::Config(format!("'{}': {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self, ScoreError> {
        let config: ScoreConfig =
            toml::from_str(text).map_err(|e| ScoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ScoreError> {
        if self.workers == Some(0) {
            return Err(ScoreError::Config("workers must be at least 1".into()));
        }
        if self.queue_bound == Some(0) {
            return Err(ScoreError::Config("queue_bound must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScoreError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn pool(&self) -> PoolConfig {
        let mut pool = PoolConfig::for_this_machine(self.max_concurrency);
        if let Some(workers) = self.workers {
            pool.workers = match self.max_concurrency.filter(|&l| l > 0) {
                Some(limit) => workers.min(limit),
                None => workers,
            };
            pool.queue_bound = 4 * pool.workers;
        }
        if let Some(bound) = self.queue_bound {
            pool.queue_bound = bound;
        }
        pool
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            always_increment: self.always_increment,
            header_policy: self.header_policy,
            ..LoadOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_gives_the_defaults() {
        let config = ScoreConfig::from_toml("").unwrap();
        assert_eq!(config, ScoreConfig::default());
        assert!(config.always_increment);
        assert!(config.strip_prs_chr);
        assert_eq!(config.retry.max_attempts, 10);
    }

    #[test]
    fn full_file_round_trips_through_disk() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
workers = 3
queue_bound = 7
always_increment = false
header_policy = "strict"
locate = "range"

[retry]
max_attempts = 4
backoff = {{ kind = "fixed", delay_ms = 250 }}
"#
        )
        .unwrap();
        let config = ScoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.header_policy, HeaderPolicy::Strict);
        assert_eq!(config.locate, LocateStrategy::Range);
        assert_eq!(config.retry.backoff, Backoff::Fixed { delay_ms: 250 });
        assert_eq!(
            config.pool(),
            PoolConfig {
                workers: 3,
                queue_bound: 7
            }
        );
        assert!(!config.load_options().always_increment);
    }

    #[test]
    fn max_concurrency_caps_the_worker_count() {
        let config = ScoreConfig {
            workers: Some(16),
            max_concurrency: Some(4),
            ..ScoreConfig::default()
        };
        assert_eq!(config.pool().workers, 4);
    }

    #[test]
    fn unknown_keys_and_zero_workers_are_rejected() {
        assert!(matches!(
            ScoreConfig::from_toml("wokers = 3"),
            Err(ScoreError::Config(_))
        ));
        assert!(matches!(
            ScoreConfig::from_toml("workers = 0"),
            Err(ScoreError::Config(_))
        ));
    }
}
