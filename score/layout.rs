// ========================================================================================
//
//                               SCORE FILE LAYOUTS
//
// ========================================================================================
//
// A layout maps the columns of a delimited score file onto a `PrsRecord`. Several
// published formats are built in; anything else is described with a comma-separated
// list of zero-based column indices.

use crate::error::ScoreError;
use crate::types::PrsRecord;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_COMMENT: char = '#';

/// Names accepted by `Layout::named`, in the order they are listed to users.
pub const LAYOUT_NAMES: [&str; 4] = ["AVKNG2018", "LDPRED", "LDPREDTAB", "BOLTBGEN"];

/// A score file layout. Column indices are zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub name: String,
    /// A space delimiter means "any run of blanks"; any other delimiter splits
    /// exactly and trims leading blanks from each field.
    pub delimiter: char,
    pub comment: char,
    pub col_effect_allele: usize,
    pub col_allele1: usize,
    pub col_allele2: usize,
    pub col_chromosome: usize,
    pub col_position: Option<usize>,
    pub col_score: usize,
    pub col_snp: Option<usize>,
    /// Removed, in order, from the start of the chromosome column.
    pub chromosome_prefixes: Vec<&'static str>,
}

/// Why a single row could not be turned into a record. The loader attaches the
/// file name and line number.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("expected at least {needed} columns but found {found}")]
    MissingColumn { needed: usize, found: usize },
    #[error("error at position column ({column}): '{value}' is not a genomic position")]
    BadPosition { column: usize, value: String },
    #[error("error at score column ({column}): '{value}' is not a number")]
    BadScore { column: usize, value: String },
    #[error("effect allele {effect_allele} is neither allele1 ({allele1}) nor allele2 ({allele2})")]
    EffectAlleleMismatch {
        effect_allele: String,
        allele1: String,
        allele2: String,
    },
}

impl Layout {
    pub fn named(name: &str) -> Result<Layout, ScoreError> {
        let layout = match name {
            "AVKNG2018" => Layout {
                name: name.to_string(),
                delimiter: '\t',
                comment: DEFAULT_COMMENT,
                col_effect_allele: 1,
                col_allele1: 5,
                col_allele2: 6,
                col_chromosome: 3,
                col_position: Some(4),
                col_score: 2,
                col_snp: None,
                chromosome_prefixes: Vec::new(),
            },
            "LDPRED" | "LDPREDTAB" => Layout {
                name: name.to_string(),
                delimiter: if name == "LDPRED" { ' ' } else { '\t' },
                comment: DEFAULT_COMMENT,
                col_effect_allele: 4,
                col_allele1: 3,
                col_allele2: 4,
                col_chromosome: 0,
                col_position: Some(1),
                col_score: 6,
                col_snp: None,
                chromosome_prefixes: vec!["chrom_"],
            },
            "BOLTBGEN" => Layout {
                name: name.to_string(),
                delimiter: '\t',
                comment: DEFAULT_COMMENT,
                col_effect_allele: 4,
                col_allele1: 5,
                col_allele2: 4,
                col_chromosome: 1,
                col_position: Some(2),
                col_score: 10,
                col_snp: None,
                chromosome_prefixes: Vec::new(),
            },
            _ => {
                return Err(ScoreError::UnknownLayout {
                    name: name.to_string(),
                    available: LAYOUT_NAMES.join(", "),
                });
            }
        };
        Ok(layout)
    }

    /// Builds a tab-delimited layout from `EA,A1,A2,CHR,POS,SCORE[,SNP]`.
    ///
    /// `POS` may be `-1` when `SNP` is given, in which case sites are matched by
    /// identifier alone. A negative `SNP` is the same as leaving it out.
    pub fn custom(columns: &str, strip_chromosome_prefix: bool) -> Result<Layout, ScoreError> {
        let values = columns
            .split(',')
            .enumerate()
            .map(|(i, raw)| {
                raw.trim().parse::<i64>().map_err(|_| {
                    ScoreError::InvalidLayout(format!(
                        "the identifier for column {i} (value '{raw}') is not an integer"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if values.len() != 6 && values.len() != 7 {
            return Err(ScoreError::InvalidLayout(format!(
                "6 or 7 column numbers were expected, but {} were given",
                values.len()
            )));
        }

        let required = |i: usize, what: &str| -> Result<usize, ScoreError> {
            usize::try_from(values[i]).map_err(|_| {
                ScoreError::InvalidLayout(format!(
                    "the {what} column must be a non-negative index, got {}",
                    values[i]
                ))
            })
        };
        let optional = |i: usize| values.get(i).and_then(|&v| usize::try_from(v).ok());

        let col_position = optional(4);
        let col_snp = optional(6);
        if col_position.is_none() && col_snp.is_none() {
            return Err(ScoreError::InvalidLayout(
                "either a column for genomic position or for SNP ID must be set".to_string(),
            ));
        }

        Ok(Layout {
            name: "CUSTOM".to_string(),
            delimiter: '\t',
            comment: DEFAULT_COMMENT,
            col_effect_allele: required(0, "effect allele")?,
            col_allele1: required(1, "allele 1")?,
            col_allele2: required(2, "allele 2")?,
            col_chromosome: required(3, "chromosome")?,
            col_position,
            col_score: required(5, "score")?,
            col_snp,
            chromosome_prefixes: if strip_chromosome_prefix {
                vec!["chrom_", "chr"]
            } else {
                Vec::new()
            },
        })
    }

    /// Whether a raw line carries no data.
    pub fn is_skippable(&self, line: &str) -> bool {
        line.trim().is_empty() || line.starts_with(self.comment)
    }

    pub fn split_row<'a>(&self, line: &'a str) -> Vec<&'a str> {
        if self.delimiter == ' ' {
            line.split_whitespace().collect()
        } else {
            line.split(self.delimiter).map(str::trim_start).collect()
        }
    }

    fn width(&self) -> usize {
        [
            Some(self.col_effect_allele),
            Some(self.col_allele1),
            Some(self.col_allele2),
            Some(self.col_chromosome),
            self.col_position,
            Some(self.col_score),
            self.col_snp,
        ]
        .into_iter()
        .flatten()
        .max()
        .map_or(0, |m| m + 1)
    }

    /// Parses one row's fields.
    ///
    /// With `normalize_sign`, a negative weight is made positive by moving the
    /// effect to the other allele, so every stored weight is risk-increasing.
    pub fn parse_fields(&self, fields: &[&str], normalize_sign: bool) -> Result<PrsRecord, RowError> {
        let needed = self.width();
        if fields.len() < needed {
            return Err(RowError::MissingColumn {
                needed,
                found: fields.len(),
            });
        }

        let mut chromosome = fields[self.col_chromosome];
        for prefix in &self.chromosome_prefixes {
            chromosome = chromosome.strip_prefix(prefix).unwrap_or(chromosome);
        }

        let position = match self.col_position {
            Some(col) => fields[col].parse::<u32>().map_err(|_| RowError::BadPosition {
                column: col,
                value: fields[col].to_string(),
            })?,
            None => 0,
        };
        let rsid = self
            .col_snp
            .map(|col| fields[col].to_string())
            .filter(|id| !id.is_empty());

        let weight = fields[self.col_score]
            .parse::<f64>()
            .map_err(|_| RowError::BadScore {
                column: self.col_score,
                value: fields[self.col_score].to_string(),
            })?;

        let allele1 = fields[self.col_allele1];
        let allele2 = fields[self.col_allele2];
        let effect_allele = fields[self.col_effect_allele];
        if effect_allele != allele1 && effect_allele != allele2 {
            return Err(RowError::EffectAlleleMismatch {
                effect_allele: effect_allele.to_string(),
                allele1: allele1.to_string(),
                allele2: allele2.to_string(),
            });
        }

        let mut record = PrsRecord {
            chromosome: chromosome.to_string(),
            position,
            rsid,
            allele1: allele1.to_string(),
            allele2: allele2.to_string(),
            effect_allele: effect_allele.to_string(),
            weight,
        };

        if normalize_sign && record.weight < 0.0 {
            record.weight = -record.weight;
            record.effect_allele = record.other_allele().to_string();
        }

        Ok(record)
    }

    pub fn parse_line(&self, line: &str, normalize_sign: bool) -> Result<PrsRecord, RowError> {
        self.parse_fields(&self.split_row(line), normalize_sign)
    }

    /// Renders a record as a row of this layout. Columns the layout does not read
    /// are filled with `NA`.
    ///
    /// Fails when two of the record's values would have to share one column, as
    /// with the formats whose effect allele column doubles as an allele column.
    pub fn emit_row(&self, record: &PrsRecord) -> Result<String, ScoreError> {
        let mut row: Vec<Option<String>> = vec![None; self.width()];
        let mut put = |col: usize, value: String, what: &str| -> Result<(), ScoreError> {
            if let Some(existing) = &row[col] {
                if *existing != value {
                    return Err(ScoreError::InvalidLayout(format!(
                        "layout {} stores the {what} in column {col}, which already holds '{existing}'",
                        self.name
                    )));
                }
            }
            row[col] = Some(value);
            Ok(())
        };

        let chromosome = match self.chromosome_prefixes.first() {
            Some(prefix) => format!("{prefix}{}", record.chromosome),
            None => record.chromosome.clone(),
        };
        put(self.col_chromosome, chromosome, "chromosome")?;
        if let Some(col) = self.col_position {
            put(col, record.position.to_string(), "position")?;
        }
        if let Some(col) = self.col_snp {
            put(col, record.rsid.clone().unwrap_or_default(), "SNP identifier")?;
        }
        put(self.col_allele1, record.allele1.clone(), "first allele")?;
        put(self.col_allele2, record.allele2.clone(), "second allele")?;
        put(self.col_effect_allele, record.effect_allele.clone(), "effect allele")?;
        put(self.col_score, record.weight.to_string(), "score")?;

        let separator = self.delimiter.to_string();
        Ok(row
            .into_iter()
            .map(|cell| cell.unwrap_or_else(|| "NA".to_string()))
            .collect::<Vec<_>>()
            .join(&separator))
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let col = |c: Option<usize>| c.map_or_else(|| "-".to_string(), |v| v.to_string());
        write!(
            f,
            "{} (delimiter {:?}, effect allele {}, allele1 {}, allele2 {}, chromosome {}, position {}, score {}, SNP {})",
            self.name,
            self.delimiter,
            self.col_effect_allele,
            self.col_allele1,
            self.col_allele2,
            self.col_chromosome,
            col(self.col_position),
            self.col_score,
            col(self.col_snp),
        )
    }
}
