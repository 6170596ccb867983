// ========================================================================================
//
//                        Error taxonomy for the scoring engine
//
// ========================================================================================
//
// Every error that may leave the locator, scorer or accumulator boundary is a
// `ScoreError`. Skip-class conditions (multiallelic sites, allele mismatches,
// unscoreable genotypes) never become errors; see `kernel::SkipReason`.
//
// Retry-ability is decided where the error is created, from the typed error of
// the underlying library, and never by inspecting message text.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The raw OS error number for a low-level I/O failure (`EIO`). Network-backed
/// filesystems surface dropped reads with this code.
const EIO: i32 = 5;

/// Whether a failure is worth retrying after reopening the affected handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A storage hiccup: sleep, reopen, try the unit of work again.
    Transient,
    /// Anything else. Retrying would produce the same result.
    Terminal,
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Index query failed while {context}: {source}")]
    Index {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error(
        "Layout '{name}' is not found. Valid layout names include: {available}"
    )]
    UnknownLayout { name: String, available: String },

    #[error("Invalid custom layout: {0}")]
    InvalidLayout(String),

    #[error(
        "Malformed PRS row in '{}' at line {line_number}: {details}\n  Line content: \"{line_content}\"",
        .path.display()
    )]
    MalformedRow {
        path: PathBuf,
        line_number: usize,
        line_content: String,
        details: String,
    },

    #[error(
        "Effect allele ({effect_allele}) is neither equal to allele 1 ({allele1}) nor allele 2 ({allele2}) in '{}' at line {line_number}",
        .path.display()
    )]
    EffectAlleleMismatch {
        path: PathBuf,
        line_number: usize,
        effect_allele: String,
        allele1: String,
        allele2: String,
    },

    #[error("Malformed BGEN data in '{}': {details}", .path.display())]
    Bgen { path: PathBuf, details: String },

    #[error("Malformed VCF record at {chromosome}:{position}: {details}")]
    Vcf {
        chromosome: String,
        position: u64,
        details: String,
    },

    #[error(
        "Result size {found} differed from accumulator size {expected}. The genotype file's sample count changed mid-run."
    )]
    AccumulatorSizeMismatch { expected: usize, found: usize },

    #[error("Giving up on {operation} after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<ScoreError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A scoring worker panicked: {0}")]
    WorkerPanicked(String),
}

impl ScoreError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ScoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn index(context: impl Into<String>, source: rusqlite::Error) -> Self {
        ScoreError::Index {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ScoreError::Io { source, .. } => classify_io_error(source),
            ScoreError::Index { source, .. } => classify_index_error(source),
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub fn classify_io_error(err: &io::Error) -> ErrorClass {
    if err.raw_os_error() == Some(EIO) {
        return ErrorClass::Transient;
    }
    // Errors wrapped by decoders keep the original OS error as their inner source.
    match err.get_ref().and_then(|inner| inner.downcast_ref::<io::Error>()) {
        Some(inner) => classify_io_error(inner),
        None => ErrorClass::Terminal,
    }
}

fn classify_index_error(err: &rusqlite::Error) -> ErrorClass {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            rusqlite::ErrorCode::SystemIoFailure | rusqlite::ErrorCode::DatabaseBusy => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Terminal,
        },
        _ => ErrorClass::Terminal,
    }
}
