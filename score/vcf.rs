// ========================================================================================
//
//                        THE TABIX-INDEXED VCF GENOTYPE STORE
//
// ========================================================================================
//
// ### Purpose ###
//
// The hard-call backend. A bgzipped VCF is queried once per chromosome with the
// interval that covers every score site on it, and each returned record is
// reduced to its allele list plus each sample's called allele indices.

use crate::error::ScoreError;
use crate::locate::TabixInterval;
use crate::reconcile::{ChromosomeConvention, conform_chromosome, zero_padded};
use crate::retry::GenotypeStore;
use crate::types::GenotypeEvidence;
use log::debug;
use noodles::bgzf;
use noodles::core::{Position, Region};
use noodles::tabix;
use noodles::vcf::{
    self,
    variant::RecordBuf,
    variant::record::samples::keys::key,
    variant::record_buf::samples::sample::{Value, value::genotype::Genotype},
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A bgzipped VCF and its tabix index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcfStore {
    pub vcf_path: PathBuf,
    pub index_path: PathBuf,
}

impl GenotypeStore for VcfStore {
    type Index = tabix::Index;
    type Data = VcfReader;

    fn open_index(&self) -> Result<Self::Index, ScoreError> {
        tabix::fs::read(&self.index_path).map_err(|e| {
            ScoreError::io(format!("reading the tabix index '{}'", self.index_path.display()), e)
        })
    }

    fn open_data(&self) -> Result<Self::Data, ScoreError> {
        VcfReader::open(&self.vcf_path)
    }

    fn describe(&self) -> String {
        format!("'{}'", self.vcf_path.display())
    }
}

/// One VCF record reduced to what the hard-call scorer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct HardCallSite {
    pub chromosome: String,
    pub position: u32,
    /// Reference allele first, then the alternates.
    pub alleles: Vec<String>,
    /// One `HardCalls` entry per sample, in header order.
    pub genotypes: Vec<GenotypeEvidence>,
}

pub struct VcfReader {
    reader: vcf::io::Reader<bgzf::Reader<File>>,
    header: vcf::Header,
    path: PathBuf,
}

impl VcfReader {
    pub fn open(path: &Path) -> Result<Self, ScoreError> {
        let context = || format!("opening '{}'", path.display());
        let file = File::open(path).map_err(|e| ScoreError::io(context(), e))?;
        let mut reader = vcf::io::Reader::new(bgzf::Reader::new(file));
        let header = reader
            .read_header()
            .map_err(|e| ScoreError::io(format!("reading the header of '{}'", path.display()), e))?;
        Ok(Self {
            reader,
            header,
            path: path.to_path_buf(),
        })
    }

    pub fn sample_names(&self) -> Vec<String> {
        self.header.sample_names().iter().cloned().collect()
    }

    pub fn n_samples(&self) -> usize {
        self.header.sample_names().len()
    }

    /// The contig name this file uses for `chromosome`. Files disagree about the
    /// `chr` prefix and about zero padding, so every spelling is tried against
    /// the header's contig lines. Without contig lines the name is used as given.
    pub fn resolve_contig(&self, chromosome: &str) -> String {
        let contigs = self.header.contigs();
        let bare = conform_chromosome(chromosome, ChromosomeConvention::Bare);
        let candidates = [
            chromosome.to_string(),
            bare.clone(),
            format!("chr{bare}"),
            zero_padded(&bare),
        ];
        candidates
            .iter()
            .find(|c| contigs.contains_key(c.as_str()))
            .cloned()
            .unwrap_or_else(|| chromosome.to_string())
    }

    /// Streams every record in `interval` to `visit`. Returns the number of
    /// records read.
    pub fn for_each_site(
        &mut self,
        index: &tabix::Index,
        interval: &TabixInterval,
        mut visit: impl FnMut(HardCallSite) -> Result<(), ScoreError>,
    ) -> Result<u64, ScoreError> {
        let contig = self.resolve_contig(&interval.chromosome);
        let (start, end) = interval.one_based();
        let region = Region::new(contig.clone(), to_position(&contig, start)?..=to_position(&contig, end)?);
        debug!("Querying {contig}:{start}-{end} in '{}'", self.path.display());

        let context = || format!("querying {contig}:{start}-{end} in '{}'", self.path.display());
        let n_samples = self.header.sample_names().len();
        let query = self
            .reader
            .query(&self.header, index, &region)
            .map_err(|e| ScoreError::io(context(), e))?;

        let mut n_records = 0u64;
        for result in query {
            let record = result.map_err(|e| ScoreError::io(context(), e))?;
            let buf = RecordBuf::try_from_variant_record(&self.header, &record)
                .map_err(|e| ScoreError::io(context(), e))?;
            visit(hard_calls_from_record(&buf, n_samples)?)?;
            n_records += 1;
        }
        Ok(n_records)
    }
}

fn to_position(contig: &str, value: u32) -> Result<Position, ScoreError> {
    Position::try_from(value as usize).map_err(|e| ScoreError::Vcf {
        chromosome: contig.to_string(),
        position: u64::from(value),
        details: format!("not a valid 1-based position: {e}"),
    })
}

/// Extracts the allele list and each sample's `GT` allele indices. Samples with
/// no `GT` value, or a record without a `GT` field, get an empty call list,
/// which the scorer counts as an increment worth nothing.
pub fn hard_calls_from_record(record: &RecordBuf, n_samples: usize) -> Result<HardCallSite, ScoreError> {
    let chromosome = record.reference_sequence_name().to_string();
    let position = record
        .variant_start()
        .map(usize::from)
        .and_then(|p| u32::try_from(p).ok())
        .ok_or_else(|| ScoreError::Vcf {
            chromosome: chromosome.clone(),
            position: 0,
            details: "record has no usable start position".to_string(),
        })?;

    let mut alleles = Vec::with_capacity(1 + record.alternate_bases().as_ref().len());
    alleles.push(record.reference_bases().to_string());
    alleles.extend(record.alternate_bases().as_ref().iter().cloned());

    let samples = record.samples();
    let gt_series = samples.select(key::GENOTYPE);

    let mut genotypes = Vec::with_capacity(n_samples);
    for sample_idx in 0..n_samples {
        let calls = match gt_series.as_ref().and_then(|series| series.get(sample_idx)) {
            Some(Some(Value::Genotype(genotype))) => allele_indices(genotype),
            Some(Some(Value::String(text))) => {
                let genotype = Genotype::from_str(text).map_err(|err| ScoreError::Vcf {
                    chromosome: chromosome.clone(),
                    position: u64::from(position),
                    details: format!("failed to parse genotype string '{text}': {err}"),
                })?;
                allele_indices(&genotype)
            }
            _ => Vec::new(),
        };
        genotypes.push(GenotypeEvidence::HardCalls(calls));
    }

    Ok(HardCallSite {
        chromosome,
        position,
        alleles,
        genotypes,
    })
}

fn allele_indices(genotype: &Genotype) -> Vec<Option<usize>> {
    genotype.as_ref().iter().map(|allele| allele.position()).collect()
}
