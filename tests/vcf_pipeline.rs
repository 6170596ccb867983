mod common;

use applyprs::error::ScoreError;
use applyprs::io::write_site_report;
use applyprs::layout::Layout;
use applyprs::pipeline::{RunOptions, VcfTemplates, run_vcf};
use applyprs::prepare::{LoadOptions, PrsTable};
use applyprs::retry::RetryPolicy;
use common::{write_indexed_vcf, write_text};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SAMPLES: [&str; 3] = ["NA1", "NA2", "NA3"];

fn write_cohort(dir: &Path, name: &str, contig: &str) -> PathBuf {
    let path = dir.join(name);
    let rows = [
        format!("{contig}\t100\trs100\tA\tG\t.\tPASS\t.\tGT\t0/1\t1/1\t./."),
        format!("{contig}\t200\trs200\tC\tT,A\t.\tPASS\t.\tGT\t0/0\t0/1\t1/1"),
        format!("{contig}\t300\trs300\tT\tC\t.\tPASS\t.\tGT\t1|1\t0|1\t0|0"),
        format!("{contig}\t400\trs400\tG\tA\t.\tPASS\t.\tGT\t0/1\t0/1\t0/1"),
    ];
    let body: Vec<&str> = rows.iter().map(String::as_str).collect();
    write_indexed_vcf(&path, &[contig], &SAMPLES, &body);
    path
}

fn load_table(dir: &Path) -> PrsTable {
    let path = dir.join("score.txt");
    write_text(
        &path,
        &[
            "G\tA\tG\tchr1\t100\t1.0",
            "T\tC\tT\tchr1\t200\t1.0",
            "C\tT\tC\tchr1\t300\t-0.5",
        ],
    );
    let layout = Layout::custom("0,1,2,3,4,5", true).unwrap();
    PrsTable::load(&path, &layout, &LoadOptions::default()).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        retry: RetryPolicy::immediate(2),
        ..RunOptions::default()
    }
}

#[test]
fn scores_hard_calls_and_reports_each_site() {
    let dir = TempDir::new().unwrap();
    let vcf = write_cohort(dir.path(), "cohort.vcf.gz", "chr1");
    let table = load_table(dir.path());

    let templates = VcfTemplates {
        vcf: vcf.to_string_lossy().into_owned(),
        index: None,
    };
    let run = run_vcf(&table, &templates, &options()).unwrap();

    let sums: Vec<f64> = run.scores.iter().map(|s| s.sum_score).collect();
    assert_eq!(sums, vec![1.0, 2.5, 1.0]);
    let increments: Vec<u32> = run.scores.iter().map(|s| s.n_incremented).collect();
    // The third sample's missing call at 1:100 is not counted.
    assert_eq!(increments, vec![2, 2, 1]);
    assert_eq!(run.sites_processed, 3);
    assert_eq!(run.sites_skipped, 1);
    assert_eq!(
        run.sample_ids,
        Some(SAMPLES.iter().map(|s| s.to_string()).collect())
    );

    assert_eq!(run.site_reports.len(), 2);
    let flipped = &run.site_reports[1];
    assert_eq!(flipped.position, 300);
    assert_eq!(flipped.effect_allele, "T");
    assert_eq!(flipped.weight, 0.5);
    assert_eq!(
        (flipped.site_effect_allele.as_str(), flipped.site_other_allele.as_str()),
        ("T", "C")
    );
    assert_eq!((flipped.n_samples_scorable, flipped.n_samples_scored), (3, 3));

    let mut out = Vec::new();
    write_site_report(&mut out, &run.site_reports).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], "1\t100\tG\tA\tG\tG\tA\t1.000000\t3\t2");
}

#[test]
fn bare_contig_names_are_resolved() {
    let dir = TempDir::new().unwrap();
    let vcf = write_cohort(dir.path(), "bare.vcf.gz", "1");
    let table = load_table(dir.path());

    let templates = VcfTemplates {
        vcf: vcf.to_string_lossy().into_owned(),
        index: None,
    };
    let run = run_vcf(&table, &templates, &options()).unwrap();
    let sums: Vec<f64> = run.scores.iter().map(|s| s.sum_score).collect();
    assert_eq!(sums, vec![1.0, 2.5, 1.0]);
}

#[test]
fn an_explicit_index_template_is_honoured() {
    let dir = TempDir::new().unwrap();
    let vcf = write_cohort(dir.path(), "cohort_chr1.vcf.gz", "chr1");
    let moved = dir.path().join("indexes");
    std::fs::create_dir(&moved).unwrap();
    std::fs::rename(
        dir.path().join("cohort_chr1.vcf.gz.tbi"),
        moved.join("chr1.tbi"),
    )
    .unwrap();
    let table = load_table(dir.path());

    let templates = VcfTemplates {
        vcf: dir.path().join("cohort_chr%s.vcf.gz").to_string_lossy().into_owned(),
        index: Some(moved.join("chr%s.tbi").to_string_lossy().into_owned()),
    };
    let run = run_vcf(&table, &templates, &options()).unwrap();
    assert_eq!(run.sites_processed, 3);

    let without_index = VcfTemplates {
        vcf: vcf.to_string_lossy().into_owned(),
        index: None,
    };
    let err = run_vcf(&table, &without_index, &options()).unwrap_err();
    assert!(matches!(err, ScoreError::Io { .. }), "unexpected error: {err}");
    assert!(!err.is_transient());
}
