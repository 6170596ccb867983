// ========================================================================================
//
//                               THE SCORE ACCUMULATOR
//
// ========================================================================================
//
// One (sum, count) pair per sample. The accumulator is created lazily: the cohort
// size is learned from the first non-empty delta, and every later delta must agree
// with it.

use crate::error::ScoreError;
use crate::types::{SampleDelta, SampleScore, VariantDelta};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct ScoreAccumulator {
    scores: Option<Vec<SampleScore>>,
    variants_folded: u64,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one variant's delta. Empty deltas are no-ops.
    pub fn fold(&mut self, delta: &VariantDelta) -> Result<(), ScoreError> {
        match delta {
            VariantDelta::Empty => Ok(()),
            VariantDelta::Samples(samples) => self.fold_samples(samples),
        }
    }

    pub fn fold_samples(&mut self, deltas: &[SampleDelta]) -> Result<(), ScoreError> {
        let scores = self
            .scores
            .get_or_insert_with(|| vec![SampleScore::default(); deltas.len()]);
        if scores.len() != deltas.len() {
            return Err(ScoreError::AccumulatorSizeMismatch {
                expected: scores.len(),
                found: deltas.len(),
            });
        }
        for (score, delta) in scores.iter_mut().zip(deltas) {
            score.sum_score += delta.score;
            if delta.counted {
                score.n_incremented += 1;
            }
        }
        self.variants_folded += 1;
        Ok(())
    }

    /// Merges another accumulator's totals into this one, sample by sample.
    pub fn merge(&mut self, other: ScoreAccumulator) -> Result<(), ScoreError> {
        let Some(theirs) = other.scores else {
            return Ok(());
        };
        match &mut self.scores {
            None => self.scores = Some(theirs),
            Some(ours) => {
                if ours.len() != theirs.len() {
                    return Err(ScoreError::AccumulatorSizeMismatch {
                        expected: ours.len(),
                        found: theirs.len(),
                    });
                }
                for (a, b) in ours.iter_mut().zip(theirs) {
                    a.sum_score += b.sum_score;
                    a.n_incremented += b.n_incremented;
                }
            }
        }
        self.variants_folded += other.variants_folded;
        Ok(())
    }

    pub fn n_samples(&self) -> Option<usize> {
        self.scores.as_ref().map(Vec::len)
    }

    /// The number of non-empty deltas folded so far.
    pub fn variants_folded(&self) -> u64 {
        self.variants_folded
    }

    pub fn scores(&self) -> &[SampleScore] {
        self.scores.as_deref().unwrap_or(&[])
    }

    /// Final per-sample totals. A run that scored nothing still reports every
    /// sample of a known cohort, with zero scores.
    pub fn finish(self, known_samples: Option<usize>) -> Vec<SampleScore> {
        match (self.scores, known_samples) {
            (Some(scores), _) => scores,
            (None, Some(n)) => vec![SampleScore::default(); n],
            (None, None) => Vec::new(),
        }
    }
}

/// Releases out-of-order results in submission order, so that the floating-point
/// sums do not depend on which worker finished first.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `item` and returns every item that is now ready, in order.
    pub fn push(&mut self, sequence: u64, item: T) -> Vec<T> {
        self.pending.insert(sequence, item);
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
