// ========================================================================================
//
//                                 THE VARIANT LOCATOR
//
// ========================================================================================
//
// ### Purpose ###
//
// Maps weighted sites of the score table onto records of a genotype store. For a
// BGEN store the side-car index is queried site by site (or one range per chunk);
// for a VCF store the locator only computes the single tabix interval that covers
// a chromosome's sites, and matching happens while the records stream past.
//
// Every row returned by the index is renamed into the score file's chromosome
// convention before it is looked up, so "chr7", "7" and "07" meet in the middle.

use crate::bgen::BgenReader;
use crate::bgi::BgiIndex;
use crate::error::ScoreError;
use crate::prepare::{ChromosomeChunk, PrsTable};
use crate::reconcile::{ChromosomeConvention, conform_chromosome, strip_leading_zeros, zero_padded};
use crate::retry::GenotypeStore;
use crate::types::{PrsRecord, VariantIndexEntry};
use ahash::AHashSet;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

/// A BGEN file and its `.bgi` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgenStore {
    pub bgen_path: PathBuf,
    pub bgi_path: PathBuf,
}

impl GenotypeStore for BgenStore {
    type Index = BgiIndex;
    type Data = BgenReader<BufReader<File>>;

    fn open_index(&self) -> Result<Self::Index, ScoreError> {
        BgiIndex::open(&self.bgi_path)
    }

    fn open_data(&self) -> Result<Self::Data, ScoreError> {
        BgenReader::open(&self.bgen_path)
    }

    fn describe(&self) -> String {
        format!("'{}'", self.bgen_path.display())
    }
}

/// How the `.bgi` index is searched for a chunk of score sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocateStrategy {
    /// One query per score site, by rsid or by position.
    #[default]
    Site,
    /// One query per chunk covering its first to last position. Sites known only
    /// by rsid are still looked up one at a time.
    Range,
}

/// A genotype record paired with the score record it will be scored against.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub entry: VariantIndexEntry,
    pub record: PrsRecord,
}

/// Finds the index rows for one score site and keeps those that belong to the
/// score table.
///
/// Sites without a position are searched by rsid; every other site is searched by
/// position alone, which returns that position on every chromosome. Each row is
/// then matched against the table by its own locus, so the record attached to a
/// row is the one keyed at that row's locus.
pub fn locate_in_bgi(
    index: &BgiIndex,
    table: &PrsTable,
    prs: &PrsRecord,
) -> Result<Vec<Located>, ScoreError> {
    let by_rsid = prs.uses_rsid_only();
    let rows = match (&prs.rsid, by_rsid) {
        (Some(rsid), true) => index.variants_by_rsid(rsid)?,
        _ => index.variants_at_position(prs.position)?,
    };

    if rows.is_empty() {
        debug!("No genotype records at {}", describe_site(prs));
        return Ok(Vec::new());
    }

    let located = match_rows(rows, table, by_rsid);
    if located.is_empty() {
        warn!(
            "The genotype index has records at {} but none of them are in the score table. The index and the score may cover different chromosomes.",
            describe_site(prs)
        );
    }
    Ok(located)
}

/// Finds every index row of one chunk with a single range query per chromosome
/// naming. Indexes built for imputed releases pad autosomes to two digits, so the
/// padded form is tried first.
pub fn locate_range(
    index: &BgiIndex,
    table: &PrsTable,
    chunk: &ChromosomeChunk,
) -> Result<Vec<Located>, ScoreError> {
    let mut located = Vec::new();

    let (by_position, by_rsid): (Vec<&PrsRecord>, Vec<&PrsRecord>) =
        chunk.records.iter().partition(|r| !r.uses_rsid_only());

    let bounds = by_position
        .iter()
        .map(|r| r.position)
        .fold(None, |acc: Option<(u32, u32)>, p| match acc {
            None => Some((p, p)),
            Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
        });

    if let Some((start, end)) = bounds {
        let bare = conform_chromosome(&chunk.chromosome, ChromosomeConvention::Bare);
        let mut forms = vec![zero_padded(&bare), bare.clone(), format!("chr{bare}")];
        forms.dedup();

        let mut rows = Vec::new();
        for form in &forms {
            rows = index.variants_in_range(form, start, end)?;
            if !rows.is_empty() {
                break;
            }
        }

        if rows.is_empty() {
            warn!(
                "There are no genotype records in {}:{start}-{end}",
                chunk.chromosome
            );
        } else {
            let n_rows = rows.len();
            let matched = match_rows(rows, table, false);
            debug!(
                "{n_rows} genotype records in {}:{start}-{end}, {} of them in the score table",
                chunk.chromosome,
                matched.len()
            );
            if matched.is_empty() {
                warn!(
                    "None of the genotype records in {}:{start}-{end} are in the score table",
                    chunk.chromosome
                );
            }
            located.extend(matched);
        }
    }

    for prs in by_rsid {
        located.extend(locate_in_bgi(index, table, prs)?);
    }
    Ok(located)
}

/// Locates every site of a chunk with the chosen strategy.
pub fn locate_chunk(
    index: &BgiIndex,
    table: &PrsTable,
    chunk: &ChromosomeChunk,
    strategy: LocateStrategy,
) -> Result<Vec<Located>, ScoreError> {
    match strategy {
        LocateStrategy::Range => locate_range(index, table, chunk),
        LocateStrategy::Site => {
            let mut located = Vec::new();
            for prs in &chunk.records {
                located.extend(locate_in_bgi(index, table, prs)?);
            }
            Ok(located)
        }
    }
}

fn match_rows(rows: Vec<VariantIndexEntry>, table: &PrsTable, by_rsid: bool) -> Vec<Located> {
    // The index's own convention comes from its first row, as on the score side.
    let index_convention = rows
        .first()
        .map(|row| ChromosomeConvention::detect(&row.chromosome))
        .unwrap_or(ChromosomeConvention::Bare);
    let target = table.convention();

    rows.into_iter()
        .filter_map(|mut entry| {
            let chromosome = if index_convention == target {
                strip_leading_zeros(&entry.chromosome)
            } else {
                conform_chromosome(&entry.chromosome, target)
            };
            let found = match by_rsid {
                true => table.lookup_rsid(&entry.rsid),
                false => table.lookup(&chromosome, entry.position),
            };
            let record = found?.clone();
            entry.chromosome = chromosome;
            Some(Located { entry, record })
        })
        .collect()
}

fn describe_site(prs: &PrsRecord) -> String {
    match (&prs.rsid, prs.uses_rsid_only()) {
        (Some(rsid), true) => rsid.clone(),
        _ => format!("{}:{}", prs.chromosome, prs.position),
    }
}

/// Drops repeated genotype records, keeping the first. Several score sites can
/// reach the same record (a position query returns every chromosome at that
/// position), and each record must be scored once.
pub fn dedupe(located: Vec<Located>) -> Vec<Located> {
    let mut seen = AHashSet::with_capacity(located.len());
    let before = located.len();
    let kept: Vec<Located> = located
        .into_iter()
        .filter(|l| seen.insert(l.entry.file_start_position))
        .collect();
    if kept.len() < before {
        debug!(
            "{} genotype records were located more than once",
            before - kept.len()
        );
    }
    kept
}

/// A half-open, zero-based interval on one chromosome, as tabix expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabixInterval {
    pub chromosome: String,
    pub start0: u32,
    /// Inclusive 1-based end, equal to the exclusive zero-based end.
    pub end: u32,
}

impl TabixInterval {
    /// The same interval as 1-based inclusive coordinates.
    pub fn one_based(&self) -> (u32, u32) {
        (self.start0 + 1, self.end)
    }
}

/// The one interval that covers every positioned site of a chromosome:
/// `[min(position) - 1, max(position)]`.
pub fn tabix_interval(chromosome: &str, records: &[PrsRecord]) -> Option<TabixInterval> {
    let positions = records.iter().map(|r| r.position).filter(|&p| p > 0);
    let (min, max) = positions.fold(None, |acc: Option<(u32, u32)>, p| match acc {
        None => Some((p, p)),
        Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
    })?;
    Some(TabixInterval {
        chromosome: chromosome.to_string(),
        start0: min - 1,
        end: max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{Connection, params};
    use tempfile::{TempDir, tempdir};

    fn prs(chromosome: &str, position: u32, rsid: Option<&str>) -> PrsRecord {
        PrsRecord {
            chromosome: chromosome.into(),
            position,
            rsid: rsid.map(str::to_string),
            allele1: "A".into(),
            allele2: "G".into(),
            effect_allele: "G".into(),
            weight: 0.5,
        }
    }

    fn index_with(rows: &[(&str, u32, &str, u64)]) -> (TempDir, BgiIndex) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cohort.bgen.bgi");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Variant (chromosome TEXT NOT NULL, position INT NOT NULL, rsid TEXT, number_of_alleles INT NOT NULL, allele1 TEXT NOT NULL, allele2 TEXT NULL, file_start_position INT NOT NULL, size_in_bytes INT NOT NULL);",
        )
        .unwrap();
        for (chromosome, position, rsid, offset) in rows {
            conn.execute(
                "INSERT INTO Variant VALUES (?1, ?2, ?3, 2, 'A', 'G', ?4, 10)",
                params![chromosome, position, rsid, *offset as i64],
            )
            .unwrap();
        }
        drop(conn);
        let index = BgiIndex::open(&path).unwrap();
        (dir, index)
    }

    #[test]
    fn padded_index_chromosomes_meet_prefixed_scores() {
        let (_dir, index) = index_with(&[("07", 100, "rs1", 10), ("08", 100, "rs2", 20)]);
        let table = PrsTable::from_records([prs("chr7", 100, None)]);

        let located = locate_in_bgi(&index, &table, &prs("chr7", 100, None)).unwrap();
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].entry.chromosome, "chr7");
        assert_eq!(located[0].entry.file_start_position, 10);
        assert_eq!(located[0].record.chromosome, "chr7");
    }

    #[test]
    fn rsid_only_sites_are_found_by_name() {
        let (_dir, index) = index_with(&[("01", 555, "rs42", 30)]);
        let site = prs("1", 0, Some("rs42"));
        let table = PrsTable::from_records([site.clone()]);
        let located = locate_in_bgi(&index, &table, &site).unwrap();
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].entry.position, 555);
    }

    #[test]
    fn rows_outside_the_table_are_dropped_without_error() {
        let (_dir, index) = index_with(&[("02", 100, "rs1", 10)]);
        let site = prs("1", 100, None);
        let table = PrsTable::from_records([site.clone()]);
        assert!(locate_in_bgi(&index, &table, &site).unwrap().is_empty());
        assert!(locate_in_bgi(&index, &table, &prs("1", 999, None)).unwrap().is_empty());
    }

    #[test]
    fn range_strategy_matches_site_strategy() {
        let (_dir, index) = index_with(&[
            ("01", 100, "rs1", 10),
            ("01", 150, "rs2", 20),
            ("01", 200, "rs3", 30),
        ]);
        let records = vec![prs("1", 100, None), prs("1", 200, None)];
        let table = PrsTable::from_records(records.clone());
        let chunk = ChromosomeChunk {
            chromosome: "1".into(),
            records,
        };
        let offsets = |strategy| -> Vec<u64> {
            locate_chunk(&index, &table, &chunk, strategy)
                .unwrap()
                .iter()
                .map(|l| l.entry.file_start_position)
                .collect()
        };
        assert_eq!(offsets(LocateStrategy::Range), vec![10, 30]);
        assert_eq!(offsets(LocateStrategy::Site), vec![10, 30]);
    }

    #[test]
    fn dedupe_keeps_the_first_of_each_record() {
        let (_dir, index) = index_with(&[("01", 100, "rs1", 10)]);
        let site = prs("1", 100, None);
        let table = PrsTable::from_records([site.clone()]);
        let mut located = locate_in_bgi(&index, &table, &site).unwrap();
        located.extend(locate_in_bgi(&index, &table, &site).unwrap());
        assert_eq!(located.len(), 2);
        assert_eq!(dedupe(located).len(), 1);
    }

    #[test]
    fn tabix_interval_spans_min_minus_one_to_max() {
        let records = vec![prs("1", 500, None), prs("1", 120, None), prs("1", 0, Some("rs9"))];
        let interval = tabix_interval("1", &records).unwrap();
        assert_eq!(interval.start0, 119);
        assert_eq!(interval.end, 500);
        assert_eq!(interval.one_based(), (120, 500));
        assert!(tabix_interval("1", &[prs("1", 0, Some("rs9"))]).is_none());
    }
}
