// ========================================================================================
//                       Records passed between loader, locator and scorer
// ========================================================================================

// A type used by a single module is declared in that module instead.

use std::fmt;

/// The (chromosome, position) pair that indexes the PRS weight table.
///
/// The chromosome is stored in its canonical form (see `reconcile::strip_leading_zeros`):
/// the prefix convention of the PRS file is kept, zero padding is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChrPosKey {
    pub chromosome: String,
    pub position: u32,
}

impl ChrPosKey {
    pub fn new(chromosome: impl Into<String>, position: u32) -> Self {
        Self {
            chromosome: chromosome.into(),
            position,
        }
    }
}

impl fmt::Display for ChrPosKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chromosome, self.position)
    }
}

/// One weighted site of a polygenic risk score.
///
/// Invariant: `effect_allele` equals `allele1` or `allele2`. The loader refuses to
/// construct a record that violates it.
#[derive(Debug, Clone, PartialEq)]
pub struct PrsRecord {
    pub chromosome: String,
    /// 1-based. Zero when the layout carries no position column and the site is
    /// matched by rsid alone.
    pub position: u32,
    pub rsid: Option<String>,
    pub allele1: String,
    pub allele2: String,
    pub effect_allele: String,
    pub weight: f64,
}

impl PrsRecord {
    pub fn key(&self) -> ChrPosKey {
        ChrPosKey::new(self.chromosome.clone(), self.position)
    }

    /// Whether the genotype index must be searched by name because no position is known.
    pub fn uses_rsid_only(&self) -> bool {
        self.position == 0 && self.rsid.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// The allele that is not the effect allele.
    pub fn other_allele(&self) -> &str {
        if self.effect_allele == self.allele1 {
            &self.allele2
        } else {
            &self.allele1
        }
    }
}

/// One row of a genotype store's side-car index. A single locus may have several
/// of these (multiallelic sites split into biallelic records, co-located indels).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantIndexEntry {
    pub chromosome: String,
    pub position: u32,
    pub rsid: String,
    pub number_of_alleles: u16,
    pub allele1: String,
    pub allele2: String,
    /// Absolute byte offset of the variant block within the genotype data file.
    pub file_start_position: u64,
    pub size_in_bytes: u64,
}

/// The running score of one sample. Only ever moves towards more evidence.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleScore {
    pub sum_score: f64,
    pub n_incremented: u32,
}

/// One sample's genotype evidence at one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum GenotypeEvidence {
    /// Genotype probabilities. For a diploid biallelic call the order is
    /// (homozygous first allele, heterozygous, homozygous second allele).
    Probabilities { ploidy: u8, values: Vec<f64> },
    /// Observed allele indices (0 = first listed allele). `None` is a missing call.
    HardCalls(Vec<Option<usize>>),
}

/// One sample's share of one variant's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleDelta {
    pub score: f64,
    /// Whether the site counts toward this sample's increment count.
    pub counted: bool,
}

/// The outcome of scoring one matched variant across the whole cohort.
#[derive(Debug, Clone, PartialEq)]
pub enum VariantDelta {
    /// The variant was skipped; it changes nothing.
    Empty,
    /// One entry per sample, in genotype-file order.
    Samples(Vec<SampleDelta>),
}

impl VariantDelta {
    pub fn is_empty(&self) -> bool {
        matches!(self, VariantDelta::Empty)
    }
}
