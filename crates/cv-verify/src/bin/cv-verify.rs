#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use cv_verify::{
    EXIT_ERROR, RunFile, VerifyConfig, preflight_row_widths, resolve_config, run_verification,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Parser)]
#[command(name = "cv-verify")]
#[command(version, about = "Verify classified subjects against a curated ground truth")]
struct Cli {
    /// Data root for the default truth/results/report locations
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// YAML run file; its relative paths resolve against its own directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Expected (ground truth) CSV
    #[arg(long)]
    expected: Option<PathBuf>,

    /// Actual (pipeline results) CSV
    #[arg(long)]
    actual: Option<PathBuf>,

    /// Text report output path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Itemize subjects present only in the actual file (`=false` turns off a
    /// run file's `true`)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    report_extra_subjects: Option<bool>,

    /// Also write a JSON summary here
    #[arg(long)]
    json_out: Option<PathBuf>,

    /// Log rows whose field count differs from the header before verifying
    #[arg(long)]
    check_row_widths: bool,

    /// Exit with status 1 when any subject is missing or disagrees
    #[arg(long)]
    require_agreement: bool,
}

impl Cli {
    fn overrides(&self) -> RunFile {
        RunFile {
            expected: self.expected.clone(),
            actual: self.actual.clone(),
            report: self.report.clone(),
            report_extra_subjects: self.report_extra_subjects,
            summary: self.json_out.clone(),
        }
    }

    fn resolve_config(&self) -> Result<VerifyConfig, cv_verify::VerifyError> {
        resolve_config(&self.root, self.config.as_deref(), self.overrides())
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&Cli::parse()) {
        Ok(status) => ExitCode::from(status),
        Err(error) => {
            eprintln!("cv-verify error: {error}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(cli: &Cli) -> Result<u8, Box<dyn std::error::Error>> {
    let config = cli.resolve_config()?;

    if cli.check_row_widths {
        for (path, report) in preflight_row_widths(&config)? {
            println!(
                "row_widths path={} expected_width={} rows={} bad_rows={}",
                path.display(),
                report.expected_width,
                report.total_rows,
                report.bad_rows.len()
            );
        }
    }

    let outcome = run_verification(&config)?;
    println!("wrote report={}", config.report_path.display());
    if let Some(path) = &config.summary_path {
        println!("wrote summary={}", path.display());
    }

    let counts = &outcome.stats.counts;
    println!(
        "compared={} missing={} extra={} tp={} tn={} fp={} fn={} channel_ok={} channel_mismatches={}",
        outcome.stats.compared.len(),
        outcome.stats.missing.len(),
        outcome.stats.extra.len(),
        counts.true_positive,
        counts.true_negative,
        counts.false_positive,
        counts.false_negative,
        outcome.channels.ok,
        outcome.channels.mismatch_count()
    );

    Ok(outcome.exit_status(cli.require_agreement))
}
