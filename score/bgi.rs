// ========================================================================================
//
//                         THE BGEN SIDE-CAR INDEX (.bgi)
//
// ========================================================================================
//
// A `.bgi` file is an SQLite database with one `Variant` row per record of the BGEN
// file, giving its locus, alleles and byte range. Three query shapes are supported:
// by position, by rsid, and by chromosome + position range.

use crate::error::ScoreError;
use crate::types::VariantIndexEntry;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};

const VARIANT_COLUMNS: &str = "chromosome, position, rsid, number_of_alleles, allele1, allele2, file_start_position, size_in_bytes";

#[derive(Debug)]
pub struct BgiIndex {
    connection: Connection,
    path: PathBuf,
}

impl BgiIndex {
    /// Opens an index read-only.
    pub fn open(path: &Path) -> Result<Self, ScoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(path, flags)
            .map_err(|e| ScoreError::index(format!("opening '{}'", path.display()), e))?;
        // Opening is lazy in SQLite; touch the schema so a missing or corrupt file
        // fails here rather than on the first query.
        connection
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| ScoreError::index(format!("reading the schema of '{}'", path.display()), e))?;
        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    /// The BGEN file name recorded when the index was built, if any.
    /// Hand-built indexes may lack the `Metadata` table entirely.
    pub fn indexed_filename(&self) -> Result<Option<String>, ScoreError> {
        if !self.has_table("Metadata")? {
            return Ok(None);
        }
        self.connection
            .query_row("SELECT filename FROM Metadata LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(|e| self.query_error("reading metadata", e))
    }

    fn has_table(&self, name: &str) -> Result<bool, ScoreError> {
        self.connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| self.query_error(&format!("looking for table {name}"), e))
    }

    /// Every record at `position`, on any chromosome.
    pub fn variants_at_position(&self, position: u32) -> Result<Vec<VariantIndexEntry>, ScoreError> {
        self.select(
            &format!("SELECT {VARIANT_COLUMNS} FROM Variant WHERE position = ?1"),
            params![i64::from(position)],
            || format!("querying position {position}"),
        )
    }

    pub fn variants_by_rsid(&self, rsid: &str) -> Result<Vec<VariantIndexEntry>, ScoreError> {
        self.select(
            &format!("SELECT {VARIANT_COLUMNS} FROM Variant WHERE rsid = ?1"),
            params![rsid],
            || format!("querying rsid {rsid}"),
        )
    }

    /// Records on `chromosome` (spelled exactly as in the index) between `start`
    /// and `end` inclusive, ordered by position.
    pub fn variants_in_range(
        &self,
        chromosome: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<VariantIndexEntry>, ScoreError> {
        self.select(
            &format!(
                "SELECT {VARIANT_COLUMNS} FROM Variant WHERE chromosome = ?1 AND position >= ?2 AND position <= ?3 ORDER BY position ASC"
            ),
            params![chromosome, i64::from(start), i64::from(end)],
            || format!("querying {chromosome}:{start}-{end}"),
        )
    }

    fn select(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        describe: impl Fn() -> String,
    ) -> Result<Vec<VariantIndexEntry>, ScoreError> {
        let mut statement = self
            .connection
            .prepare_cached(sql)
            .map_err(|e| self.query_error(&describe(), e))?;
        let rows = statement
            .query_map(params, row_to_entry)
            .map_err(|e| self.query_error(&describe(), e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| self.query_error(&describe(), e))
    }

    fn query_error(&self, what: &str, e: rusqlite::Error) -> ScoreError {
        ScoreError::index(format!("{what} in '{}'", self.path.display()), e)
    }
}

fn row_to_entry(row: &Row) -> rusqlite::Result<VariantIndexEntry> {
    let position: i64 = row.get(1)?;
    let number_of_alleles: i64 = row.get(3)?;
    let file_start_position: i64 = row.get(6)?;
    let size_in_bytes: i64 = row.get(7)?;
    let out_of_range = |column: usize, value: i64| {
        rusqlite::Error::IntegralValueOutOfRange(column, value)
    };
    Ok(VariantIndexEntry {
        chromosome: row.get(0)?,
        position: u32::try_from(position).map_err(|_| out_of_range(1, position))?,
        rsid: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        number_of_alleles: u16::try_from(number_of_alleles)
            .map_err(|_| out_of_range(3, number_of_alleles))?,
        allele1: row.get(4)?,
        allele2: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        file_start_position: u64::try_from(file_start_position)
            .map_err(|_| out_of_range(6, file_start_position))?,
        size_in_bytes: u64::try_from(size_in_bytes).map_err(|_| out_of_range(7, size_in_bytes))?,
    })
}
