// ========================================================================================
//
//                          TEXT SOURCES, PATH TEMPLATES & REPORTS
//
// ========================================================================================
//
// Everything that touches plain files on disk and is not a genotype store: the
// optionally gzipped score file, per-chromosome path templates, the Oxford
// `.sample` file, and the two TSV outputs.

use crate::error::ScoreError;
use crate::types::SampleScore;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The placeholder that path templates replace with the chromosome.
pub const CHROMOSOME_PLACEHOLDER: &str = "%s";

/// Opens a text file for line-oriented reading, transparently decompressing gzip
/// (including bgzip, which is a series of gzip members).
pub fn open_text_source(path: &Path) -> Result<Box<dyn BufRead + Send>, ScoreError> {
    let context = || format!("opening '{}'", path.display());
    let mut file = File::open(path).map_err(|e| ScoreError::io(context(), e))?;

    let mut magic = [0u8; 2];
    let bytes_read = read_up_to(&mut file, &mut magic).map_err(|e| ScoreError::io(context(), e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ScoreError::io(context(), e))?;

    if bytes_read == 2 && is_gzip_magic(&magic) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn is_gzip_magic(magic: &[u8; 2]) -> bool {
    magic[0] == 0x1F && magic[1] == 0x8B
}

/// Substitutes the chromosome into a path template. A template without the
/// placeholder names a single file covering every chromosome and is used verbatim.
pub fn expand_template(template: &str, chromosome: &str) -> PathBuf {
    PathBuf::from(template.replace(CHROMOSOME_PLACEHOLDER, chromosome))
}

/// `<data>.<extension>`, the conventional location of a side-car index.
pub fn sidecar_path(data_path: &Path, extension: &str) -> PathBuf {
    let mut raw = data_path.as_os_str().to_owned();
    raw.push(".");
    raw.push(extension);
    PathBuf::from(raw)
}

/// Reads sample identifiers from an Oxford `.sample` file: space-delimited, two
/// header rows (column names and column types), identifier in the first column.
pub fn read_sample_file(path: &Path) -> Result<Vec<String>, ScoreError> {
    let reader = open_text_source(path)?;
    let mut ids = Vec::new();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ScoreError::io(format!("reading '{}'", path.display()), e))?;
        if line_number < 2 {
            continue;
        }
        match line.split_whitespace().next() {
            Some(id) => ids.push(id.to_string()),
            None => continue,
        }
    }
    Ok(ids)
}

/// Writes the per-sample score table.
///
/// Columns: `sample_file_row`, then `sample_id` when identifiers are known, then
/// `source`, `score`, `n_incremented`. Rows follow genotype-file sample order.
pub fn write_scores<W: Write>(
    writer: W,
    source: &str,
    scores: &[SampleScore],
    sample_ids: Option<&[String]>,
) -> Result<(), ScoreError> {
    if let Some(ids) = sample_ids {
        if ids.len() != scores.len() {
            return Err(ScoreError::Config(format!(
                "{} sample identifiers were supplied for {} scored samples",
                ids.len(),
                scores.len()
            )));
        }
    }

    let mut out = tsv_writer(writer);
    let mut header = vec!["sample_file_row"];
    if sample_ids.is_some() {
        header.push("sample_id");
    }
    header.extend(["source", "score", "n_incremented"]);
    out.write_record(&header).map_err(csv_error)?;

    for (row, score) in scores.iter().enumerate() {
        let mut record = vec![row.to_string()];
        if let Some(ids) = sample_ids {
            record.push(ids[row].clone());
        }
        record.push(source.to_string());
        record.push(format!("{:.6}", score.sum_score));
        record.push(score.n_incremented.to_string());
        out.write_record(&record).map_err(csv_error)?;
    }
    out.flush()
        .map_err(|e| ScoreError::io("flushing the score table", e))
}

/// Per-site bookkeeping for the hard-call path: what was matched, how it was
/// oriented, and how many samples could be scored.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteReport {
    pub chromosome: String,
    pub position: u32,
    pub effect_allele: String,
    pub allele1: String,
    pub allele2: String,
    /// The site's own spelling of the effect allele.
    pub site_effect_allele: String,
    pub site_other_allele: String,
    pub weight: f64,
    pub n_samples_scorable: usize,
    pub n_samples_scored: usize,
}

pub fn write_site_report<W: Write>(writer: W, sites: &[SiteReport]) -> Result<(), ScoreError> {
    let mut out = tsv_writer(writer);
    out.write_record([
        "chr",
        "pos",
        "effect_allele",
        "allele1",
        "allele2",
        "site_ea",
        "site_nea",
        "weight",
        "n_samples_scorable",
        "n_samples_scored",
    ])
    .map_err(csv_error)?;
    for site in sites {
        out.write_record([
            site.chromosome.clone(),
            site.position.to_string(),
            site.effect_allele.clone(),
            site.allele1.clone(),
            site.allele2.clone(),
            site.site_effect_allele.clone(),
            site.site_other_allele.clone(),
            format!("{:.6}", site.weight),
            site.n_samples_scorable.to_string(),
            site.n_samples_scored.to_string(),
        ])
        .map_err(csv_error)?;
    }
    out.flush()
        .map_err(|e| ScoreError::io("flushing the site report", e))
}

/// Opens `path` for writing, or stdout when no path is given.
pub fn create_output(path: Option<&Path>) -> Result<Box<dyn Write>, ScoreError> {
    match path {
        Some(p) => {
            let file = File::create(p)
                .map_err(|e| ScoreError::io(format!("creating '{}'", p.display()), e))?;
            Ok(Box::new(io::BufWriter::new(file)))
        }
        None => Ok(Box::new(io::BufWriter::new(io::stdout()))),
    }
}

fn tsv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(writer)
}

fn csv_error(e: csv::Error) -> ScoreError {
    match e.into_kind() {
        csv::ErrorKind::Io(io_err) => ScoreError::io("writing a TSV table", io_err),
        other => ScoreError::Config(format!("could not serialize a TSV row: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    #[test]
    fn gzip_and_plain_sources_read_the_same_lines() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("prs.txt");
        let gz = dir.path().join("prs.txt.gz");
        std::fs::write(&plain, "a\nb\n").unwrap();
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(b"a\nb\n").unwrap();
        enc.finish().unwrap();

        let read_all = |p: &Path| -> Vec<String> {
            open_text_source(p).unwrap().lines().map(|l| l.unwrap()).collect()
        };
        assert_eq!(read_all(&plain), vec!["a", "b"]);
        assert_eq!(read_all(&gz), vec!["a", "b"]);
    }

    #[test]
    fn templates_substitute_the_chromosome() {
        assert_eq!(
            expand_template("/data/ukb_imp_chr%s_v3.bgen", "7"),
            PathBuf::from("/data/ukb_imp_chr7_v3.bgen")
        );
        assert_eq!(
            expand_template("/data/all.vcf.gz", "7"),
            PathBuf::from("/data/all.vcf.gz")
        );
        assert_eq!(
            sidecar_path(Path::new("/data/chr7.bgen"), "bgi"),
            PathBuf::from("/data/chr7.bgen.bgi")
        );
    }

    #[test]
    fn sample_file_skips_both_header_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cohort.sample");
        std::fs::write(&path, "ID_1 ID_2 missing sex\n0 0 0 D\n1001 1001 0 1\n1002 1002 0 2\n")
            .unwrap();
        assert_eq!(read_sample_file(&path).unwrap(), vec!["1001", "1002"]);
    }

    #[test]
    fn score_table_has_six_decimal_scores() {
        let scores = [
            SampleScore {
                sum_score: 3.8,
                n_incremented: 1,
            },
            SampleScore::default(),
        ];
        let mut buf = Vec::new();
        write_scores(&mut buf, "LDL", &scores, None).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "sample_file_row\tsource\tscore\tn_incremented\n0\tLDL\t3.800000\t1\n1\tLDL\t0.000000\t0\n"
        );
    }

    #[test]
    fn score_table_rejects_mismatched_identifiers() {
        let scores = [SampleScore::default()];
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut buf = Vec::new();
        assert!(write_scores(&mut buf, "LDL", &scores, Some(&ids)).is_err());
    }
}
