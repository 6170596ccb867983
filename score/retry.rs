// ========================================================================================
//
//                         RESILIENT INDEX + DATA FILE HANDLES
//
// ========================================================================================
//
// Genotype stores live on network filesystems that occasionally drop reads. A unit
// of work (opening a store, locating a chunk of sites, scoring one variant) is
// retried as a whole after closing and reopening both handles, but only when the
// failure was classified as transient where it happened.

use crate::error::ScoreError;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// How long to sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// Doubles after every failure, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// The delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = initial_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed {
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms: 0 },
        }
    }

    /// Runs `work` until it succeeds, fails terminally, or runs out of attempts.
    /// Only the calling thread sleeps between attempts.
    pub fn run<T>(
        &self,
        operation: &str,
        mut work: impl FnMut(u32) -> Result<T, ScoreError>,
    ) -> Result<T, ScoreError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match work(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(ScoreError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "Transient failure while {operation} (attempt {attempt} of {max_attempts}): {err}. Retrying in {delay:?}"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// A genotype store made of a side-car index and a data file, each opened
/// separately.
pub trait GenotypeStore: Sync {
    type Index: Send;
    type Data: Send;

    fn open_index(&self) -> Result<Self::Index, ScoreError>;
    fn open_data(&self) -> Result<Self::Data, ScoreError>;
    /// A short human-readable name for log messages.
    fn describe(&self) -> String;
}

/// One open index handle and one open data handle for the same store.
pub struct StoreHandles<S: GenotypeStore> {
    pub index: S::Index,
    pub data: S::Data,
}

/// Owns one pair of handles and replaces it after transient failures.
pub struct HandleManager<'a, S: GenotypeStore> {
    store: &'a S,
    policy: &'a RetryPolicy,
    handles: Option<StoreHandles<S>>,
    opens: u32,
}

impl<'a, S: GenotypeStore> HandleManager<'a, S> {
    /// A manager that opens its handles on first use.
    pub fn new(store: &'a S, policy: &'a RetryPolicy) -> Self {
        Self {
            store,
            policy,
            handles: None,
            opens: 0,
        }
    }

    /// Opens index then data as one retried unit.
    pub fn open(store: &'a S, policy: &'a RetryPolicy) -> Result<Self, ScoreError> {
        let mut manager = Self::new(store, policy);
        manager.run(&format!("opening {}", store.describe()), |_| Ok(()))?;
        Ok(manager)
    }

    fn open_pair(store: &S) -> Result<StoreHandles<S>, ScoreError> {
        let index = store.open_index()?;
        match store.open_data() {
            Ok(data) => Ok(StoreHandles { index, data }),
            Err(err) => {
                debug!(
                    "Closing the index of {} because its data file failed to open",
                    store.describe()
                );
                drop(index);
                Err(err)
            }
        }
    }

    /// Closes both handles. The next unit of work reopens them.
    pub fn close(&mut self) {
        self.handles = None;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.handles.is_some()
    }

    /// How many times a handle pair has been opened successfully.
    pub fn opens(&self) -> u32 {
        self.opens
    }

    /// Runs one unit of work against the handles. On a transient failure the
    /// handles are closed, the policy's delay is observed, both are reopened and
    /// the unit restarts from scratch.
    pub fn run<T>(
        &mut self,
        operation: &str,
        mut work: impl FnMut(&mut StoreHandles<S>) -> Result<T, ScoreError>,
    ) -> Result<T, ScoreError> {
        let policy = self.policy;
        policy.run(operation, |_| {
            let pair = match self.handles.take() {
                Some(pair) => pair,
                None => {
                    let pair = Self::open_pair(self.store)?;
                    self.opens += 1;
                    pair
                }
            };
            let result = work(self.handles.insert(pair));
            if result.as_ref().is_err_and(ScoreError::is_transient) {
                self.close();
            }
            result
        })
    }
}
