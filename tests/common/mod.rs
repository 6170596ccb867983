// Fixture writers shared by the integration tests: a BGEN v1.2 writer with zlib
// blocks, its `.bgi` index, a score file writer, and a bgzipped + tabix-indexed VCF.
#![allow(dead_code)]

use flate2::Compression;
use flate2::write::ZlibEncoder;
use noodles::bgzf;
use noodles::tabix;
use noodles::vcf;
use rusqlite::{Connection, params};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const MISSING_PLOIDY_FLAG: u8 = 0x80;
const SAMPLE_IDS_FLAG: u32 = 1 << 31;
const BITS: u8 = 16;
const MAX_STORED: u64 = (1 << BITS) - 1;

/// A diploid genotype written as exact probabilities.
#[derive(Debug, Clone, Copy)]
pub enum Call {
    HomFirst,
    Het,
    HomSecond,
    Missing,
}

pub struct Variant {
    pub chromosome: &'static str,
    pub position: u32,
    pub rsid: &'static str,
    pub alleles: Vec<&'static str>,
    pub calls: Vec<Call>,
}

impl Variant {
    pub fn new(
        chromosome: &'static str,
        position: u32,
        rsid: &'static str,
        alleles: &[&'static str],
        calls: &[Call],
    ) -> Self {
        Self {
            chromosome,
            position,
            rsid,
            alleles: alleles.to_vec(),
            calls: calls.to_vec(),
        }
    }
}

/// One `Variant` table row of a `.bgi` index.
pub struct IndexRow {
    pub chromosome: String,
    pub position: u32,
    pub rsid: String,
    pub alleles: Vec<String>,
    pub offset: u64,
    pub size: u64,
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str16(out: &mut Vec<u8>, s: &str) {
    put_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

fn put_str32(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Stored probabilities (all but the implied last) for one unphased diploid sample.
fn stored_values(call: Call, n_alleles: usize) -> Vec<u64> {
    let n_genotypes = n_alleles * (n_alleles + 1) / 2;
    let mut full = vec![0u64; n_genotypes];
    match call {
        Call::HomFirst | Call::Missing => full[0] = MAX_STORED,
        Call::Het => full[1] = MAX_STORED,
        // The last genotype is implied by the others summing to zero.
        Call::HomSecond => {}
    }
    full.truncate(n_genotypes - 1);
    full
}

fn probability_block(variant: &Variant) -> Vec<u8> {
    let n = variant.calls.len();
    let mut out = Vec::new();
    put_u32(&mut out, n as u32);
    put_u16(&mut out, variant.alleles.len() as u16);
    out.extend_from_slice(&[2, 2]);
    for call in &variant.calls {
        out.push(match call {
            Call::Missing => 2 | MISSING_PLOIDY_FLAG,
            _ => 2,
        });
    }
    out.extend_from_slice(&[0, BITS]);
    for call in &variant.calls {
        for v in stored_values(*call, variant.alleles.len()) {
            put_u16(&mut out, v as u16);
        }
    }
    out
}

/// Writes a zlib-compressed layout 2 BGEN file and returns one index row per variant.
pub fn write_bgen(path: &Path, sample_ids: &[&str], variants: &[Variant]) -> Vec<IndexRow> {
    let mut out = Vec::new();
    let header_len = 20u32;
    let id_block_len = 8 + sample_ids.iter().map(|s| 2 + s.len() as u32).sum::<u32>();
    put_u32(&mut out, header_len + id_block_len);
    put_u32(&mut out, header_len);
    put_u32(&mut out, variants.len() as u32);
    put_u32(&mut out, sample_ids.len() as u32);
    out.extend_from_slice(b"bgen");
    put_u32(&mut out, 1 | (2 << 2) | SAMPLE_IDS_FLAG);
    put_u32(&mut out, id_block_len);
    put_u32(&mut out, sample_ids.len() as u32);
    for id in sample_ids {
        put_str16(&mut out, id);
    }

    let mut rows = Vec::new();
    for variant in variants {
        assert_eq!(variant.calls.len(), sample_ids.len());
        let offset = out.len() as u64;
        put_str16(&mut out, &format!("{}:{}", variant.chromosome, variant.position));
        put_str16(&mut out, variant.rsid);
        put_str16(&mut out, variant.chromosome);
        put_u32(&mut out, variant.position);
        put_u16(&mut out, variant.alleles.len() as u16);
        for allele in &variant.alleles {
            put_str32(&mut out, allele);
        }

        let raw = probability_block(variant);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();
        put_u32(&mut out, compressed.len() as u32 + 4);
        put_u32(&mut out, raw.len() as u32);
        out.extend_from_slice(&compressed);

        rows.push(IndexRow {
            chromosome: variant.chromosome.to_string(),
            position: variant.position,
            rsid: variant.rsid.to_string(),
            alleles: variant.alleles.iter().map(|a| a.to_string()).collect(),
            offset,
            size: out.len() as u64 - offset,
        });
    }
    fs::write(path, out).unwrap();
    rows
}

/// Writes a `.bgi` index in the schema bgenix produces.
pub fn write_bgi(path: &Path, bgen_name: &str, rows: &[IndexRow]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Variant (chromosome TEXT NOT NULL, position INT NOT NULL, rsid TEXT, number_of_alleles INT NOT NULL, allele1 TEXT NOT NULL, allele2 TEXT NULL, file_start_position INT NOT NULL, size_in_bytes INT NOT NULL, PRIMARY KEY (chromosome, position, rsid, allele1, allele2, file_start_position)) WITHOUT ROWID;
         CREATE TABLE Metadata (filename TEXT NOT NULL, file_size INT NOT NULL, last_write_time INT NOT NULL, first_1000_bytes BLOB NOT NULL, index_creation_time INT NOT NULL);",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO Metadata VALUES (?1, 0, 0, x'', 0)",
        params![bgen_name],
    )
    .unwrap();
    for row in rows {
        conn.execute(
            "INSERT INTO Variant VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.chromosome,
                row.position,
                row.rsid,
                row.alleles.len() as i64,
                row.alleles[0],
                row.alleles.get(1).cloned().unwrap_or_default(),
                row.offset as i64,
                row.size as i64
            ],
        )
        .unwrap();
    }
}

/// Writes a BGEN file and its `<bgen>.bgi` index into `dir`.
pub fn write_bgen_with_index(
    dir: &Path,
    name: &str,
    sample_ids: &[&str],
    variants: &[Variant],
) -> PathBuf {
    let bgen_path = dir.join(name);
    let rows = write_bgen(&bgen_path, sample_ids, variants);
    write_bgi(&dir.join(format!("{name}.bgi")), name, &rows);
    bgen_path
}

/// Writes a plain-text score file.
pub fn write_text(path: &Path, lines: &[&str]) {
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text).unwrap();
}

/// Writes `body` (VCF data lines, tab-separated) under a minimal header, bgzips it
/// and writes `<vcf>.tbi` next to it.
pub fn write_indexed_vcf(path: &Path, contigs: &[&str], samples: &[&str], body: &[&str]) {
    let mut text = String::from("##fileformat=VCFv4.3\n");
    for contig in contigs {
        text.push_str(&format!("##contig=<ID={contig}>\n"));
    }
    text.push_str("##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n");
    text.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
    for sample in samples {
        text.push('\t');
        text.push_str(sample);
    }
    text.push('\n');
    for line in body {
        text.push_str(line);
        text.push('\n');
    }

    let mut writer = bgzf::Writer::new(File::create(path).unwrap());
    writer.write_all(text.as_bytes()).unwrap();
    writer.finish().unwrap();

    let index = vcf::fs::index(path).unwrap();
    let mut tbi = path.as_os_str().to_owned();
    tbi.push(".tbi");
    tabix::fs::write(PathBuf::from(tbi), &index).unwrap();
}
