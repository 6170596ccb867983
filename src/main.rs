// ========================================================================================
//
//                              THE ORCHESTRATOR: APPLYPRS
//
// ========================================================================================
//
// A thin command line over the library: resolve the configuration, load the score
// table, run the pipeline for the chosen genotype backend, and write the per-sample
// table (and, for VCF cohorts, the per-site report).
//
// All failures surface here as a `ScoreError` after the library has drained its
// workers; the process then exits with status 1.

use applyprs::config::ScoreConfig;
use applyprs::error::ScoreError;
use applyprs::io::{create_output, read_sample_file, write_scores, write_site_report};
use applyprs::layout::Layout;
use applyprs::pipeline::{self, BgenTemplates, RunOptions, ScoreRun, VcfTemplates};
use applyprs::prepare::{LoadOptions, PrsTable};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "applyprs",
    version,
    about = "Applies a polygenic risk score to a BGEN or VCF cohort."
)]
struct Args {
    /// Path to the score file. May be gzipped.
    #[clap(long)]
    input: PathBuf,

    /// Named layout of the score file (AVKNG2018, LDPRED, LDPREDTAB, BOLTBGEN or CUSTOM).
    #[clap(long)]
    layout: Option<String>,

    /// Zero-based columns EA,A1,A2,CHR,POS,SCORE[,SNP] of a tab-delimited score file.
    /// POS may be -1 when SNP is given.
    #[clap(long)]
    custom_layout: Option<String>,

    /// Label written into every output row. Defaults to the score file name.
    #[clap(long)]
    source: Option<String>,

    /// Only score sites on this chromosome.
    #[clap(long)]
    chromosome: Option<String>,

    /// First data row of the score file to use (zero-based).
    #[clap(long, default_value_t = 0)]
    first_line: usize,

    /// Last data row of the score file to use (zero-based, inclusive).
    #[clap(long)]
    last_line: Option<usize>,

    /// BGEN path; `%s` is replaced by the chromosome.
    #[clap(long, conflicts_with = "vcf_template")]
    bgen_template: Option<String>,

    /// BGI path; `%s` is replaced by the chromosome. Defaults to `<bgen>.bgi`.
    #[clap(long, requires = "bgen_template")]
    bgi_template: Option<String>,

    /// bgzipped VCF path; `%s` is replaced by the chromosome.
    #[clap(long)]
    vcf_template: Option<String>,

    /// Tabix index path; `%s` is replaced by the chromosome. Defaults to `<vcf>.tbi`.
    #[clap(long, requires = "vcf_template")]
    vcfi_template: Option<String>,

    /// Oxford `.sample` file naming the cohort's samples, in genotype-file order.
    #[clap(long)]
    sample: Option<PathBuf>,

    /// Output path for the per-sample scores. Defaults to stdout.
    #[clap(long)]
    out: Option<PathBuf>,

    /// Output path for the per-site report (VCF cohorts only).
    #[clap(long)]
    prs_report: Option<PathBuf>,

    /// Flip negative weights onto the other allele so every increment is positive.
    #[clap(long)]
    always_increment: Option<bool>,

    /// Strip `chrom_`/`chr` from chromosome names of custom layouts.
    #[clap(long)]
    strip_prs_chr: Option<bool>,

    /// Upper bound on concurrent workers and work chunks. 0 means no bound.
    #[clap(long)]
    max_concurrency: Option<usize>,

    /// TOML file with retry, pool and loading settings. Flags override it.
    #[clap(long)]
    config: Option<PathBuf>,
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let start_time = Instant::now();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    eprintln!("\nSuccess! Total execution time: {:.2?}", start_time.elapsed());
}

fn run(args: &Args) -> Result<(), ScoreError> {
    // --- Phase 1: Configuration ---
    let mut config = match &args.config {
        Some(path) => {
            eprintln!("> Reading configuration from {}", path.display());
            ScoreConfig::from_file(path)?
        }
        None => ScoreConfig::default(),
    };
    if let Some(value) = args.always_increment {
        config.always_increment = value;
    }
    if let Some(value) = args.strip_prs_chr {
        config.strip_prs_chr = value;
    }
    if let Some(value) = args.max_concurrency {
        config.max_concurrency = (value > 0).then_some(value);
    }

    let layout = resolve_layout(args, &config)?;
    eprintln!("> Using layout: {layout}");

    // --- Phase 2: The score table ---
    let load_options = LoadOptions {
        first_line: args.first_line,
        last_line: args.last_line,
        chromosome: args.chromosome.clone(),
        ..config.load_options()
    };
    eprintln!("> Loading score file: {}", args.input.display());
    let table = PrsTable::load(&args.input, &layout, &load_options)?;
    eprintln!("> Loaded {} score sites", table.len());
    if table.duplicates() > 0 {
        eprintln!(
            "> {} score rows repeated an earlier site and replaced it",
            table.duplicates()
        );
    }

    // --- Phase 3: Scoring ---
    let options = RunOptions {
        pool: config.pool(),
        retry: config.retry.clone(),
        locate: config.locate,
        max_concurrency: config.max_concurrency,
    };
    let run = match (&args.bgen_template, &args.vcf_template) {
        (Some(bgen), None) => {
            eprintln!("> Scoring BGEN cohort with {} workers", options.pool.workers);
            let templates = BgenTemplates {
                bgen: bgen.clone(),
                bgi: args.bgi_template.clone(),
            };
            pipeline::run_bgen(&table, &templates, &options)?
        }
        (None, Some(vcf)) => {
            eprintln!("> Scoring VCF cohort");
            let templates = VcfTemplates {
                vcf: vcf.clone(),
                index: args.vcfi_template.clone(),
            };
            pipeline::run_vcf(&table, &templates, &options)?
        }
        _ => {
            return Err(ScoreError::Config(
                "exactly one of --bgen-template and --vcf-template is required".into(),
            ));
        }
    };
    eprintln!(
        "> {} sites were processed ({} skipped)",
        run.sites_processed, run.sites_skipped
    );

    // --- Phase 4: Output ---
    write_outputs(args, &run)
}

fn resolve_layout(args: &Args, config: &ScoreConfig) -> Result<Layout, ScoreError> {
    let is_custom = args
        .layout
        .as_deref()
        .is_some_and(|name| name.eq_ignore_ascii_case("CUSTOM"));
    match (&args.custom_layout, args.layout.as_deref()) {
        (Some(columns), None) => Layout::custom(columns, config.strip_prs_chr),
        (Some(columns), Some(_)) if is_custom => Layout::custom(columns, config.strip_prs_chr),
        (Some(_), Some(name)) => Err(ScoreError::Config(format!(
            "--custom-layout cannot be combined with the named layout '{name}'"
        ))),
        (None, Some(_)) if is_custom => Err(ScoreError::Config(
            "the CUSTOM layout needs --custom-layout".into(),
        )),
        (None, Some(name)) => Layout::named(name),
        (None, None) => Err(ScoreError::Config(
            "one of --layout or --custom-layout is required".into(),
        )),
    }
}

fn write_outputs(args: &Args, run: &ScoreRun) -> Result<(), ScoreError> {
    let sample_ids = match &args.sample {
        Some(path) => Some(read_sample_file(path)?),
        None => run.sample_ids.clone(),
    };

    let source = match &args.source {
        Some(source) => source.clone(),
        None => args
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    match &args.out {
        Some(path) => eprintln!("> Writing {} sample scores to {}", run.scores.len(), path.display()),
        None => eprintln!("> Writing {} sample scores to stdout", run.scores.len()),
    }
    let writer = create_output(args.out.as_deref())?;
    write_scores(writer, &source, &run.scores, sample_ids.as_deref())?;

    if let Some(path) = &args.prs_report {
        if args.vcf_template.is_none() {
            eprintln!("> Skipping the site report: it is only produced for VCF cohorts");
        } else {
            eprintln!("> Writing the site report to {}", path.display());
            write_site_report(create_output(Some(path))?, &run.site_reports)?;
        }
    }
    Ok(())
}
