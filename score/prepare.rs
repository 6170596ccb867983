// ========================================================================================
//
//                               THE SCORE TABLE LOADER
//
// ========================================================================================
//
// ### Purpose ###
//
// Turns a delimited (optionally gzipped) score file into the read-only weight table
// that the locator and the scorer consult. The table is built once and passed by
// reference; nothing here is process-global.

use crate::error::ScoreError;
use crate::io::open_text_source;
use crate::layout::{Layout, RowError};
use crate::reconcile::{ChromosomeConvention, conform_chromosome, lookup_forms, strip_leading_zeros};
use crate::types::{ChrPosKey, PrsRecord};
use ahash::AHashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::BufRead;
use std::path::Path;

/// The number of duplicate keys reported individually before going quiet.
const DUPLICATE_LOG_LIMIT: usize = 5;

/// What to do with a first data row that does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderPolicy {
    /// Treat it as a column header and skip it.
    #[default]
    Tolerate,
    /// Every row must parse.
    Strict,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Zero-based index of the first data row to keep. Comment and blank lines
    /// are not data rows.
    pub first_line: usize,
    /// Zero-based index of the last data row to keep, inclusive.
    pub last_line: Option<usize>,
    /// Flip negative weights onto the other allele.
    pub always_increment: bool,
    pub header_policy: HeaderPolicy,
    /// Keep only records on this chromosome, in any naming form.
    pub chromosome: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            first_line: 0,
            last_line: None,
            always_increment: true,
            header_policy: HeaderPolicy::Tolerate,
            chromosome: None,
        }
    }
}

/// The in-memory score: every weighted site keyed by locus, plus a side table for
/// sites that are known only by identifier.
#[derive(Debug, Default)]
pub struct PrsTable {
    by_locus: AHashMap<ChrPosKey, PrsRecord>,
    by_rsid: AHashMap<String, PrsRecord>,
    convention: Option<ChromosomeConvention>,
    duplicates: usize,
}

/// Records on one chromosome, processed as one unit of work with its own handles.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromosomeChunk {
    pub chromosome: String,
    pub records: Vec<PrsRecord>,
}

impl PrsTable {
    pub fn load(path: &Path, layout: &Layout, options: &LoadOptions) -> Result<Self, ScoreError> {
        let reader = open_text_source(path)?;
        let wanted_chromosome = options
            .chromosome
            .as_deref()
            .map(|c| conform_chromosome(c, ChromosomeConvention::Bare));

        let mut table = PrsTable::default();
        let mut data_row = 0usize;
        let mut skipped_other_chromosomes = 0usize;

        for (line_index, line) in reader.lines().enumerate() {
            let line_number = line_index + 1;
            let line = line.map_err(|e| ScoreError::io(format!("reading '{}'", path.display()), e))?;
            if layout.is_skippable(&line) {
                continue;
            }
            let row_index = data_row;
            data_row += 1;

            if options.last_line.is_some_and(|last| row_index > last) {
                break;
            }

            let parsed = layout.parse_line(&line, options.always_increment);
            if row_index < options.first_line {
                continue;
            }

            let record = match parsed {
                Ok(record) => record,
                Err(_) if row_index == 0 && options.header_policy == HeaderPolicy::Tolerate => {
                    info!("Treating the first row of '{}' as a header", path.display());
                    continue;
                }
                Err(err) => return Err(row_error(path, line_number, &line, err)),
            };

            if let Some(wanted) = &wanted_chromosome {
                if conform_chromosome(&record.chromosome, ChromosomeConvention::Bare) != *wanted {
                    skipped_other_chromosomes += 1;
                    continue;
                }
            }

            table.insert(record);
        }

        if skipped_other_chromosomes > 0 {
            debug!(
                "Skipped {skipped_other_chromosomes} score rows on chromosomes other than {}",
                options.chromosome.as_deref().unwrap_or_default()
            );
        }
        if table.duplicates > 0 {
            warn!(
                "{} score rows repeated an earlier locus; the later row was kept each time",
                table.duplicates
            );
        }
        info!(
            "There are {} variants in the score table loaded from '{}'",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Builds a table from records that are already parsed.
    pub fn from_records(records: impl IntoIterator<Item = PrsRecord>) -> Self {
        let mut table = PrsTable::default();
        for record in records {
            table.insert(record);
        }
        table
    }

    /// Adds a record, canonicalizing its chromosome. A record at an existing key
    /// replaces the earlier one, which is returned.
    pub fn insert(&mut self, mut record: PrsRecord) -> Option<PrsRecord> {
        record.chromosome = strip_leading_zeros(&record.chromosome);
        if self.convention.is_none() {
            self.convention = Some(ChromosomeConvention::detect(&record.chromosome));
        }

        let replaced = if record.uses_rsid_only() {
            let rsid = record.rsid.clone().unwrap_or_default();
            self.by_rsid.insert(rsid, record)
        } else {
            self.by_locus.insert(record.key(), record)
        };

        if let Some(previous) = &replaced {
            self.duplicates += 1;
            if self.duplicates <= DUPLICATE_LOG_LIMIT {
                debug!(
                    "Duplicate score entry at {}; replacing weight {} with the later row",
                    previous.key(),
                    previous.weight
                );
            }
        }
        replaced
    }

    pub fn len(&self) -> usize {
        self.by_locus.len() + self.by_rsid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many inserts replaced an earlier record.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// The chromosome naming convention of the score file, from its first record.
    pub fn convention(&self) -> ChromosomeConvention {
        self.convention.unwrap_or(ChromosomeConvention::Bare)
    }

    /// Finds the record at a locus. The chromosome must already be in the score
    /// file's prefix convention; zero padding is tolerated.
    pub fn lookup(&self, chromosome: &str, position: u32) -> Option<&PrsRecord> {
        lookup_forms(chromosome).find_map(|form| self.by_locus.get(&ChrPosKey::new(form, position)))
    }

    pub fn lookup_rsid(&self, rsid: &str) -> Option<&PrsRecord> {
        self.by_rsid.get(rsid)
    }

    pub fn records(&self) -> impl Iterator<Item = &PrsRecord> {
        self.by_locus.values().chain(self.by_rsid.values())
    }

    /// Records grouped by chromosome, chromosomes in natural order ("2" before "10")
    /// and records by position.
    pub fn by_chromosome(&self) -> Vec<ChromosomeChunk> {
        let mut groups: AHashMap<&str, Vec<PrsRecord>> = AHashMap::new();
        for record in self.records() {
            groups
                .entry(record.chromosome.as_str())
                .or_default()
                .push(record.clone());
        }

        let mut chunks: Vec<ChromosomeChunk> = groups
            .into_iter()
            .map(|(chromosome, mut records)| {
                records.sort_by(compare_records);
                ChromosomeChunk {
                    chromosome: chromosome.to_string(),
                    records,
                }
            })
            .collect();
        chunks.sort_by(|a, b| natord::compare(&a.chromosome, &b.chromosome));
        chunks
    }
}

fn compare_records(a: &PrsRecord, b: &PrsRecord) -> Ordering {
    a.position
        .cmp(&b.position)
        .then_with(|| a.rsid.cmp(&b.rsid))
}

fn row_error(path: &Path, line_number: usize, line: &str, err: RowError) -> ScoreError {
    match err {
        RowError::EffectAlleleMismatch {
            effect_allele,
            allele1,
            allele2,
        } => ScoreError::EffectAlleleMismatch {
            path: path.to_path_buf(),
            line_number,
            effect_allele,
            allele1,
            allele2,
        },
        other => ScoreError::MalformedRow {
            path: path.to_path_buf(),
            line_number,
            line_content: line.to_string(),
            details: other.to_string(),
        },
    }
}

/// Picks how many records go into one unit of work: about `2·√n` units overall,
/// but never more than `2 × cores`, nor more than `max_concurrency` when set.
pub fn chunk_size_for(n_records: usize, cores: usize, max_concurrency: Option<usize>) -> usize {
    let mut desired = 2 * (n_records as f64).sqrt().floor() as usize;
    desired = desired.min(2 * cores.max(1));
    if let Some(limit) = max_concurrency.filter(|&l| l > 0) {
        desired = desired.min(limit);
    }
    let desired = desired.max(1);
    (n_records / desired).max(1)
}

/// Splits per-chromosome groups into chunks of at most `chunk_size` records. A
/// chunk never spans two chromosomes.
pub fn split_into_chunks(groups: Vec<ChromosomeChunk>, chunk_size: usize) -> Vec<ChromosomeChunk> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::new();
    for group in groups {
        let chromosome = group.chromosome;
        let mut records = group.records.into_iter().peekable();
        while records.peek().is_some() {
            let piece: Vec<PrsRecord> = records.by_ref().take(chunk_size).collect();
            out.push(ChromosomeChunk {
                chromosome: chromosome.clone(),
                records: piece,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_prs(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn custom() -> Layout {
        Layout::custom("0,1,2,3,4,5", false).unwrap()
    }

    fn record(chromosome: &str, position: u32, weight: f64) -> PrsRecord {
        PrsRecord {
            chromosome: chromosome.into(),
            position,
            rsid: None,
            allele1: "A".into(),
            allele2: "G".into(),
            effect_allele: "G".into(),
            weight,
        }
    }

    #[test]
    fn header_is_skipped_and_comments_ignored() {
        let file = write_prs(
            "ea\ta1\ta2\tchr\tpos\tscore\n# comment\nG\tA\tG\t1\t100\t0.5\n\nT\tC\tT\t2\t200\t-0.25\n",
        );
        let table = PrsTable::load(file.path(), &custom(), &LoadOptions::default()).unwrap();
        assert_eq!(table.len(), 2);

        let flipped = table.lookup("2", 200).unwrap();
        assert_eq!(flipped.effect_allele, "C");
        assert_eq!(flipped.weight, 0.25);
    }

    #[test]
    fn strict_header_policy_rejects_the_header() {
        let file = write_prs("ea\ta1\ta2\tchr\tpos\tscore\nG\tA\tG\t1\t100\t0.5\n");
        let options = LoadOptions {
            header_policy: HeaderPolicy::Strict,
            ..LoadOptions::default()
        };
        let err = PrsTable::load(file.path(), &custom(), &options).unwrap_err();
        assert!(matches!(err, ScoreError::MalformedRow { line_number: 1, .. }));
    }

    #[test]
    fn bad_row_after_the_first_is_fatal() {
        let file = write_prs("G\tA\tG\t1\t100\t0.5\nG\tA\tG\t1\tNA\t0.5\n");
        let err = PrsTable::load(file.path(), &custom(), &LoadOptions::default()).unwrap_err();
        match err {
            ScoreError::MalformedRow {
                line_number,
                line_content,
                ..
            } => {
                assert_eq!(line_number, 2);
                assert!(line_content.contains("NA"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn effect_allele_violation_is_fatal() {
        let file = write_prs("G\tA\tG\t1\t100\t0.5\nT\tA\tG\t1\t101\t0.5\n");
        let err = PrsTable::load(file.path(), &custom(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ScoreError::EffectAlleleMismatch { line_number: 2, .. }));
    }

    #[test]
    fn line_range_selects_a_shard() {
        let file = write_prs(
            "G\tA\tG\t1\t100\t0.1\nG\tA\tG\t1\t101\t0.2\nG\tA\tG\t1\t102\t0.3\nG\tA\tG\t1\t103\t0.4\n",
        );
        let options = LoadOptions {
            first_line: 1,
            last_line: Some(2),
            ..LoadOptions::default()
        };
        let table = PrsTable::load(file.path(), &custom(), &options).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.lookup("1", 100).is_none());
        assert!(table.lookup("1", 101).is_some());
        assert!(table.lookup("1", 102).is_some());
        assert!(table.lookup("1", 103).is_none());
    }

    #[test]
    fn chromosome_filter_accepts_any_naming() {
        let file = write_prs("G\tA\tG\t01\t100\t0.1\nG\tA\tG\t2\t100\t0.2\n");
        let options = LoadOptions {
            chromosome: Some("chr1".into()),
            ..LoadOptions::default()
        };
        let table = PrsTable::load(file.path(), &custom(), &options).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("1", 100).unwrap().weight, 0.1);
    }

    #[test]
    fn duplicate_locus_keeps_the_last_row() {
        let table = PrsTable::from_records([record("7", 5, 1.0), record("07", 5, 2.0)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.duplicates(), 1);
        assert_eq!(table.lookup("7", 5).unwrap().weight, 2.0);
        assert_eq!(table.lookup("07", 5).unwrap().weight, 2.0);
    }

    #[test]
    fn rsid_only_records_live_in_their_own_table() {
        let mut by_id = record("1", 0, 1.0);
        by_id.rsid = Some("rs7412".into());
        let table = PrsTable::from_records([by_id, record("1", 10, 0.5)]);
        assert_eq!(table.len(), 2);
        assert!(table.lookup_rsid("rs7412").is_some());
        assert!(table.lookup("1", 0).is_none());
    }

    #[test]
    fn grouping_orders_chromosomes_naturally() {
        let table = PrsTable::from_records([
            record("10", 1, 1.0),
            record("2", 9, 1.0),
            record("2", 3, 1.0),
            record("X", 1, 1.0),
        ]);
        let groups = table.by_chromosome();
        let names: Vec<_> = groups.iter().map(|g| g.chromosome.as_str()).collect();
        assert_eq!(names, vec!["2", "10", "X"]);
        let positions: Vec<_> = groups[0].records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![3, 9]);
    }

    #[test]
    fn chunks_never_span_chromosomes() {
        let table = PrsTable::from_records((1..=5).map(|p| record("1", p, 1.0)).chain([record("2", 1, 1.0)]));
        let chunks = split_into_chunks(table.by_chromosome(), 2);
        let shape: Vec<_> = chunks
            .iter()
            .map(|c| (c.chromosome.as_str(), c.records.len()))
            .collect();
        assert_eq!(shape, vec![("1", 2), ("1", 2), ("1", 1), ("2", 1)]);
    }

    #[test]
    fn chunk_size_respects_core_and_concurrency_limits() {
        assert_eq!(chunk_size_for(10_000, 4, None), 10_000 / 8);
        assert_eq!(chunk_size_for(10_000, 128, None), 10_000 / 200);
        assert_eq!(chunk_size_for(10_000, 128, Some(10)), 1_000);
        assert_eq!(chunk_size_for(0, 4, None), 1);
    }
}
