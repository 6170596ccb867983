// ========================================================================================
//
//                                THE SCORING PIPELINES
//
// ========================================================================================
//
// ### Purpose ###
//
// Wires the loader's table, the locator, the kernel and the accumulator together
// for each backend.
//
// - BGEN: per genotype store, the table's chunks are located on the worker pool,
//   the located records are de-duplicated, then scored on the pool. Every worker
//   keeps one index + data handle pair for the whole phase.
// - VCF: per chromosome, one tabix query streams records through the hard-call
//   scorer on the calling thread. At most one reader is open at a time.

use crate::accumulate::ScoreAccumulator;
use crate::error::ScoreError;
use crate::io::{SiteReport, expand_template, sidecar_path};
use crate::kernel::{check_allele_count, check_site, score_variant};
use crate::locate::{BgenStore, LocateStrategy, Located, dedupe, locate_chunk, tabix_interval};
use crate::pool::{PoolConfig, run_tasks};
use crate::prepare::{ChromosomeChunk, PrsTable, chunk_size_for, split_into_chunks};
use crate::reconcile::{alleles_match, conform_chromosome};
use crate::retry::{HandleManager, RetryPolicy};
use crate::types::{SampleScore, VariantDelta};
use crate::vcf::{HardCallSite, VcfStore};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::io::IsTerminal;
use std::path::Path;

/// Counts `units` of one phase (chunks, genotype records, chromosomes). Hidden
/// unless stderr is a terminal, so batch logs stay clean.
fn phase_progress(total: u64, phase: &str, units: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let template = format!("> {{prefix:>22}} {{wide_bar}} {{human_pos}}/{{human_len}} {units} [{{elapsed}}, eta {{eta}}]");
    if let Ok(style) = ProgressStyle::with_template(&template) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_prefix(phase.to_string());
    pb
}

// ========================================================================================
//                                 Run options & results
// ========================================================================================

/// Everything a pipeline needs besides the table and the file locations.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub locate: LocateStrategy,
    /// Caps the number of work chunks, as well as the pool width.
    pub max_concurrency: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::for_this_machine(None),
            retry: RetryPolicy::default(),
            locate: LocateStrategy::default(),
            max_concurrency: None,
        }
    }
}

/// Path templates for a BGEN cohort. `%s` in either template is replaced by the
/// chromosome; without an index template the index is `<bgen>.bgi`.
#[derive(Debug, Clone)]
pub struct BgenTemplates {
    pub bgen: String,
    pub bgi: Option<String>,
}

impl BgenTemplates {
    pub fn store_for(&self, chromosome: &str) -> BgenStore {
        let bgen_path = expand_template(&self.bgen, chromosome);
        let bgi_path = match &self.bgi {
            Some(template) => expand_template(template, chromosome),
            None => sidecar_path(&bgen_path, "bgi"),
        };
        BgenStore {
            bgen_path,
            bgi_path,
        }
    }
}

/// Path templates for a VCF cohort. Without an index template the index is
/// `<vcf>.tbi`.
#[derive(Debug, Clone)]
pub struct VcfTemplates {
    pub vcf: String,
    pub index: Option<String>,
}

impl VcfTemplates {
    pub fn store_for(&self, chromosome: &str) -> VcfStore {
        let vcf_path = expand_template(&self.vcf, chromosome);
        let index_path = match &self.index {
            Some(template) => expand_template(template, chromosome),
            None => sidecar_path(&vcf_path, "tbi"),
        };
        VcfStore {
            vcf_path,
            index_path,
        }
    }
}

/// The outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct ScoreRun {
    /// One entry per sample, in genotype-file order.
    pub scores: Vec<SampleScore>,
    /// Sample identifiers read from the genotype files, when they carry any.
    pub sample_ids: Option<Vec<String>>,
    /// Genotype records that matched a score site and reached the scorer.
    pub sites_processed: u64,
    /// Of those, records that contributed nothing (multiallelic, allele mismatch).
    pub sites_skipped: u64,
    /// Per-site bookkeeping. Only the VCF pipeline fills this.
    pub site_reports: Vec<SiteReport>,
}

/// The samples of the first genotype file; every later file must agree.
#[derive(Default)]
struct Cohort {
    n_samples: Option<usize>,
    sample_ids: Option<Vec<String>>,
}

impl Cohort {
    fn observe(&mut self, n_samples: usize, sample_ids: Option<Vec<String>>) -> Result<(), ScoreError> {
        match self.n_samples {
            None => {
                self.n_samples = Some(n_samples);
                self.sample_ids = sample_ids;
                Ok(())
            }
            Some(expected) if expected != n_samples => Err(ScoreError::AccumulatorSizeMismatch {
                expected,
                found: n_samples,
            }),
            Some(_) => Ok(()),
        }
    }
}

// ========================================================================================
//                                    BGEN pipeline
// ========================================================================================

/// Scores every table site found in the BGEN files named by `templates`.
pub fn run_bgen(
    table: &PrsTable,
    templates: &BgenTemplates,
    options: &RunOptions,
) -> Result<ScoreRun, ScoreError> {
    let chunk_size = chunk_size_for(table.len(), num_cpus::get(), options.max_concurrency);
    let chunks = split_into_chunks(table.by_chromosome(), chunk_size);
    info!(
        "Split {} score sites into {} chunks of up to {chunk_size}",
        table.len(),
        chunks.len()
    );

    let mut stores: Vec<(BgenStore, Vec<ChromosomeChunk>)> = Vec::new();
    for chunk in chunks {
        let store = templates.store_for(&chunk.chromosome);
        match stores.iter_mut().find(|(s, _)| *s == store) {
            Some((_, group)) => group.push(chunk),
            None => stores.push((store, vec![chunk])),
        }
    }

    let mut accumulator = ScoreAccumulator::new();
    let mut cohort = Cohort::default();
    let mut run = ScoreRun::default();

    for (store, chunks) in stores {
        let (n_samples, sample_ids) = read_cohort(&store, &options.retry)?;
        cohort.observe(n_samples, sample_ids)?;

        let located = dedupe(locate_bgen_sites(table, &store, chunks, options)?);
        info!(
            "Located {} genotype records in {}",
            located.len(),
            store.bgen_path.display()
        );
        score_bgen_sites(&store, located, options, &mut accumulator, &mut run)?;
    }

    info!(
        "{} sites were processed, {} of them contributed to the scores",
        run.sites_processed,
        accumulator.variants_folded()
    );
    run.scores = accumulator.finish(cohort.n_samples);
    run.sample_ids = cohort.sample_ids;
    Ok(run)
}

fn read_cohort(store: &BgenStore, policy: &RetryPolicy) -> Result<(usize, Option<Vec<String>>), ScoreError> {
    let mut manager = HandleManager::open(store, policy)?;
    manager.run(&format!("reading the header of {}", store.bgen_path.display()), |h| {
        let header = h.data.header();
        info!(
            "{} holds {} variants for {} samples",
            store.bgen_path.display(),
            header.n_variants,
            header.n_samples
        );
        if let Some(indexed) = h.index.indexed_filename()? {
            if !index_names_data_file(&indexed, &store.bgen_path) {
                warn!(
                    "{} was built for '{indexed}', not for {}",
                    store.bgi_path.display(),
                    store.bgen_path.display()
                );
            }
        }
        Ok((h.data.n_samples(), h.data.sample_ids().map(<[String]>::to_vec)))
    })
}

/// Whether the file name recorded in an index matches the data file. Indexes
/// record the path they were built from, so only the final component counts.
fn index_names_data_file(indexed: &str, data_path: &Path) -> bool {
    Path::new(indexed).file_name() == data_path.file_name()
}

fn locate_bgen_sites(
    table: &PrsTable,
    store: &BgenStore,
    chunks: Vec<ChromosomeChunk>,
    options: &RunOptions,
) -> Result<Vec<Located>, ScoreError> {
    let pb = phase_progress(chunks.len() as u64, "Locating score sites", "chunks");
    let mut located = Vec::new();
    run_tasks(
        options.pool,
        chunks,
        |_| HandleManager::open(store, &options.retry),
        |manager, chunk: ChromosomeChunk| {
            manager.run(
                &format!("locating {} sites on chromosome {}", chunk.records.len(), chunk.chromosome),
                |h| locate_chunk(&h.index, table, &chunk, options.locate),
            )
        },
        |found| {
            pb.inc(1);
            located.extend(found);
            Ok(())
        },
    )?;
    pb.finish_and_clear();
    Ok(located)
}

fn score_bgen_sites(
    store: &BgenStore,
    located: Vec<Located>,
    options: &RunOptions,
    accumulator: &mut ScoreAccumulator,
    run: &mut ScoreRun,
) -> Result<(), ScoreError> {
    let pb = phase_progress(located.len() as u64, "Scoring BGEN records", "records");
    run_tasks(
        options.pool,
        located,
        |_| HandleManager::open(store, &options.retry),
        |manager, site: Located| score_bgen_site(manager, &site),
        |delta| {
            pb.inc(1);
            run.sites_processed += 1;
            if delta.is_empty() {
                run.sites_skipped += 1;
            }
            accumulator.fold(&delta)
        },
    )?;
    pb.finish_and_clear();
    Ok(())
}

/// Scores one located BGEN record. Sites that cannot be scored yield an empty
/// delta; only storage and format failures are errors.
pub fn score_bgen_site(
    manager: &mut HandleManager<'_, BgenStore>,
    site: &Located,
) -> Result<VariantDelta, ScoreError> {
    let entry = &site.entry;
    let prs = &site.record;
    let locus = format!("{}:{}", entry.chromosome, entry.position);

    if let Err(reason) = check_allele_count(usize::from(entry.number_of_alleles)) {
        debug!("{locus}: {reason}");
        return Ok(VariantDelta::Empty);
    }
    if !alleles_match(&prs.allele1, &prs.allele2, &entry.allele1, &entry.allele2) {
        debug!(
            "{locus}: score alleles were {},{} but variant alleles were {},{}",
            prs.allele1, prs.allele2, entry.allele1, entry.allele2
        );
        return Ok(VariantDelta::Empty);
    }

    let variant = manager.run(&format!("reading {locus}"), |h| {
        h.data.read_at(entry.file_start_position)
    })?;
    match check_site(prs, &variant.alleles) {
        Ok(orientation) => Ok(VariantDelta::Samples(score_variant(
            prs,
            orientation,
            &variant.samples,
        ))),
        Err(reason) => {
            debug!("{locus}: {reason}");
            Ok(VariantDelta::Empty)
        }
    }
}

// ========================================================================================
//                                    VCF pipeline
// ========================================================================================

/// What one chromosome's query produced. Built from scratch on every attempt, so
/// a retried query never double-counts.
#[derive(Default)]
struct ChromosomeTally {
    accumulator: ScoreAccumulator,
    reports: Vec<SiteReport>,
    processed: u64,
    skipped: u64,
}

/// Scores every table site found in the VCF files named by `templates`, one
/// chromosome at a time.
pub fn run_vcf(
    table: &PrsTable,
    templates: &VcfTemplates,
    options: &RunOptions,
) -> Result<ScoreRun, ScoreError> {
    let groups = table.by_chromosome();
    let pb = phase_progress(groups.len() as u64, "Scoring VCF regions", "chromosomes");

    let mut accumulator = ScoreAccumulator::new();
    let mut cohort = Cohort::default();
    let mut run = ScoreRun::default();

    for group in &groups {
        pb.inc(1);
        let Some(interval) = tabix_interval(&group.chromosome, &group.records) else {
            debug!(
                "Chromosome {} has no positioned score sites to query",
                group.chromosome
            );
            continue;
        };
        let store = templates.store_for(&group.chromosome);
        let mut manager = HandleManager::open(&store, &options.retry)?;
        let (tally, sample_ids) = manager.run(
            &format!("scoring chromosome {} of {}", group.chromosome, store.vcf_path.display()),
            |h| {
                let mut tally = ChromosomeTally::default();
                let n_records = h.data.for_each_site(&h.index, &interval, |site| {
                    score_hard_call_site(table, site, &mut tally)
                })?;
                debug!(
                    "{n_records} records in {}:{}-{}, {} of them in the score table",
                    interval.chromosome, interval.start0, interval.end, tally.processed
                );
                Ok((tally, h.data.sample_names()))
            },
        )?;
        if manager.opens() > 1 {
            info!(
                "Reopened {} {} times after transient failures",
                store.vcf_path.display(),
                manager.opens() - 1
            );
        }
        drop(manager);

        cohort.observe(sample_ids.len(), Some(sample_ids))?;
        accumulator.merge(tally.accumulator)?;
        run.site_reports.extend(tally.reports);
        run.sites_processed += tally.processed;
        run.sites_skipped += tally.skipped;
    }
    pb.finish_and_clear();

    info!(
        "{} sites were processed, {} of them contributed to the scores",
        run.sites_processed,
        accumulator.variants_folded()
    );
    run.scores = accumulator.finish(cohort.n_samples);
    run.sample_ids = cohort.sample_ids.filter(|ids| !ids.is_empty());
    Ok(run)
}

fn score_hard_call_site(
    table: &PrsTable,
    site: HardCallSite,
    tally: &mut ChromosomeTally,
) -> Result<(), ScoreError> {
    let chromosome = conform_chromosome(&site.chromosome, table.convention());
    let Some(prs) = table.lookup(&chromosome, site.position) else {
        return Ok(());
    };
    tally.processed += 1;

    let orientation = match check_site(prs, &site.alleles) {
        Ok(orientation) => orientation,
        Err(reason) => {
            debug!("{}:{}: {reason}", site.chromosome, site.position);
            tally.skipped += 1;
            return Ok(());
        }
    };

    let deltas = score_variant(prs, orientation, &site.genotypes);
    let n_samples_scored = deltas.iter().filter(|d| d.counted).count();
    tally.accumulator.fold_samples(&deltas)?;
    tally.reports.push(SiteReport {
        chromosome: prs.chromosome.clone(),
        position: prs.position,
        effect_allele: prs.effect_allele.clone(),
        allele1: prs.allele1.clone(),
        allele2: prs.allele2.clone(),
        site_effect_allele: site.alleles[orientation.effect_index].clone(),
        site_other_allele: site.alleles[orientation.other_index].clone(),
        weight: prs.weight,
        n_samples_scorable: deltas.len(),
        n_samples_scored,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenotypeEvidence, PrsRecord};
    use std::path::PathBuf;

    fn prs(chromosome: &str, position: u32, effect: &str, weight: f64) -> PrsRecord {
        PrsRecord {
            chromosome: chromosome.into(),
            position,
            rsid: None,
            allele1: "A".into(),
            allele2: "G".into(),
            effect_allele: effect.into(),
            weight,
        }
    }

    #[test]
    fn templates_expand_per_chromosome_with_default_indexes() {
        let bgen = BgenTemplates {
            bgen: "/data/ukb_imp_chr%s_v3.bgen".into(),
            bgi: None,
        };
        let store = bgen.store_for("7");
        assert_eq!(store.bgen_path, PathBuf::from("/data/ukb_imp_chr7_v3.bgen"));
        assert_eq!(store.bgi_path, PathBuf::from("/data/ukb_imp_chr7_v3.bgen.bgi"));

        let vcf = VcfTemplates {
            vcf: "/data/all.vcf.gz".into(),
            index: Some("/idx/all.vcf.gz.tbi".into()),
        };
        let store = vcf.store_for("22");
        assert_eq!(store.vcf_path, PathBuf::from("/data/all.vcf.gz"));
        assert_eq!(store.index_path, PathBuf::from("/idx/all.vcf.gz.tbi"));
    }

    #[test]
    fn hard_call_sites_fold_and_report() {
        let table = PrsTable::from_records([prs("chr1", 100, "G", 1.5)]);
        let mut tally = ChromosomeTally::default();
        let site = HardCallSite {
            chromosome: "1".into(),
            position: 100,
            alleles: vec!["A".into(), "G".into()],
            genotypes: vec![
                GenotypeEvidence::HardCalls(vec![Some(0), Some(1)]),
                GenotypeEvidence::HardCalls(vec![Some(1), Some(1)]),
                GenotypeEvidence::HardCalls(vec![None, Some(1)]),
            ],
        };
        score_hard_call_site(&table, site, &mut tally).unwrap();

        let scores = tally.accumulator.scores();
        assert_eq!(scores[0].sum_score, 1.5);
        assert_eq!(scores[1].sum_score, 3.0);
        assert_eq!(scores[2].n_incremented, 0);
        let report = &tally.reports[0];
        assert_eq!(
            (report.site_effect_allele.as_str(), report.site_other_allele.as_str()),
            ("G", "A")
        );
        assert_eq!((report.n_samples_scorable, report.n_samples_scored), (3, 2));
    }

    #[test]
    fn unmatched_and_multiallelic_hard_call_sites() {
        let table = PrsTable::from_records([prs("1", 100, "G", 1.0)]);
        let mut tally = ChromosomeTally::default();
        let mut site = HardCallSite {
            chromosome: "1".into(),
            position: 101,
            alleles: vec!["A".into(), "G".into()],
            genotypes: vec![GenotypeEvidence::HardCalls(vec![Some(0), Some(1)])],
        };
        score_hard_call_site(&table, site.clone(), &mut tally).unwrap();
        assert_eq!(tally.processed, 0);

        site.position = 100;
        site.alleles.push("T".into());
        score_hard_call_site(&table, site, &mut tally).unwrap();
        assert_eq!((tally.processed, tally.skipped), (1, 1));
        assert!(tally.reports.is_empty());
        assert_eq!(tally.accumulator.n_samples(), None);
    }

    #[test]
    fn index_file_names_compare_by_final_component() {
        let data = Path::new("/data/release/ukb_imp_chr7_v3.bgen");
        assert!(index_names_data_file("ukb_imp_chr7_v3.bgen", data));
        assert!(index_names_data_file("/scratch/build/ukb_imp_chr7_v3.bgen", data));
        assert!(!index_names_data_file("ukb_imp_chr8_v3.bgen", data));
    }

    #[test]
    fn cohort_size_must_not_change_between_files() {
        let mut cohort = Cohort::default();
        cohort.observe(3, None).unwrap();
        cohort.observe(3, None).unwrap();
        assert!(matches!(
            cohort.observe(4, None),
            Err(ScoreError::AccumulatorSizeMismatch {
                expected: 3,
                found: 4
            })
        ));
    }
}
