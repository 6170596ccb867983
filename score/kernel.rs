// ========================================================================================
//
//                    The kernel: per-variant, per-sample contributions
//
// ========================================================================================
//
// This module contains the innermost scoring logic. It performs no I/O and holds no
// state: given one matched score record, the site's allele list and each sample's
// genotype evidence, it produces each sample's delta. Sites that cannot be scored
// are reported as a `SkipReason`, never as an error.

use crate::reconcile::{Orientation, orient};
use crate::types::{GenotypeEvidence, PrsRecord, SampleDelta};
use std::fmt;

/// Why a matched site contributes nothing to any sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// More than two alleles at the site. Only biallelic sites are scored.
    Multiallelic { n_alleles: usize },
    /// The site's alleles do not contain both score alleles.
    AlleleMismatch {
        prs_alleles: (String, String),
        site_alleles: Vec<String>,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Multiallelic { n_alleles } => {
                write!(f, "site is multiallelic ({n_alleles} alleles), skipping")
            }
            SkipReason::AlleleMismatch {
                prs_alleles,
                site_alleles,
            } => write!(
                f,
                "score alleles were {},{} but variant alleles were {}",
                prs_alleles.0,
                prs_alleles.1,
                site_alleles.join(",")
            ),
        }
    }
}

/// Gate for sites whose allele count is known before any genotype data is read.
pub fn check_allele_count(n_alleles: usize) -> Result<(), SkipReason> {
    if n_alleles > 2 {
        Err(SkipReason::Multiallelic { n_alleles })
    } else {
        Ok(())
    }
}

/// Checks that a site can be scored against `prs` and works out which of the
/// site's alleles is the effect allele.
pub fn check_site(prs: &PrsRecord, site_alleles: &[impl AsRef<str>]) -> Result<Orientation, SkipReason> {
    check_allele_count(site_alleles.len())?;
    orient(&prs.effect_allele, prs.other_allele(), site_alleles).ok_or_else(|| {
        SkipReason::AlleleMismatch {
            prs_alleles: (prs.allele1.clone(), prs.allele2.clone()),
            site_alleles: site_alleles.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    })
}

/// Weighted expected effect-allele count from genotype probabilities.
///
/// Only diploid samples with exactly three probabilities are scored; every other
/// shape, including a missing sample's empty vector, contributes zero.
#[inline]
pub fn dosage_contribution(values: &[f64], ploidy: u8, effect_index: usize, weight: f64) -> f64 {
    if ploidy != 2 || values.len() != 3 {
        return 0.0;
    }
    match effect_index {
        0 => weight * (2.0 * values[0] + values[1]),
        1 => weight * (values[1] + 2.0 * values[2]),
        _ => 0.0,
    }
}

/// Weighted effect-allele count from hard calls, or `None` when any call is
/// missing or names an allele outside the score's pair.
///
/// A sample with no calls at all (an empty `GT`) has no allele outside the pair,
/// so it counts as an increment that adds nothing.
#[inline]
pub fn hard_call_contribution(
    calls: &[Option<usize>],
    orientation: Orientation,
    weight: f64,
) -> Option<f64> {
    let mut effect_count = 0u32;
    for call in calls {
        match *call {
            Some(i) if i == orientation.effect_index => effect_count += 1,
            Some(i) if i == orientation.other_index => {}
            _ => return None,
        }
    }
    Some(weight * f64::from(effect_count))
}

pub fn score_sample(evidence: &GenotypeEvidence, orientation: Orientation, weight: f64) -> SampleDelta {
    match evidence {
        GenotypeEvidence::Probabilities { ploidy, values } => SampleDelta {
            score: dosage_contribution(values, *ploidy, orientation.effect_index, weight),
            counted: true,
        },
        GenotypeEvidence::HardCalls(calls) => match hard_call_contribution(calls, orientation, weight) {
            Some(score) => SampleDelta {
                score,
                counted: true,
            },
            None => SampleDelta::default(),
        },
    }
}

/// Scores every sample at one oriented site, in sample order.
pub fn score_variant(
    prs: &PrsRecord,
    orientation: Orientation,
    evidence: &[GenotypeEvidence],
) -> Vec<SampleDelta> {
    evidence
        .iter()
        .map(|e| score_sample(e, orientation, prs.weight))
        .collect()
}
