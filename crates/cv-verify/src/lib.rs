#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use cv_compare::{
    ChannelMismatch, ChannelStats, ConfusionCounts, ConfusionStats, LabelMismatch, compare,
    compare_channels,
};
use cv_io::{IoError, RowWidthReport, check_row_widths, read_aggregated};
use cv_types::{KEY_COLUMNS, SubjectKey, SubjectMap, format_channel_set};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

/// Bad rows logged per file by the row-width preflight.
pub const PREFLIGHT_LOG_LIMIT: usize = 10;

/// Exit status when agreement is required and the inputs disagree.
pub const EXIT_DISAGREEMENT: u8 = 1;
/// Exit status for any input, config or write failure.
pub const EXIT_ERROR: u8 = 2;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Input(#[from] IoError),
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read config {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyConfig {
    pub expected_path: PathBuf,
    pub actual_path: PathBuf,
    pub report_path: PathBuf,
    pub report_extra_subjects: bool,
    pub summary_path: Option<PathBuf>,
}

impl VerifyConfig {
    /// Conventional layout under a data root: truth and raw results in,
    /// `data/output/verified.txt` out.
    #[must_use]
    pub fn default_paths(root: &Path) -> Self {
        let data = root.join("data");
        Self {
            expected_path: data.join("truth").join("truth.csv"),
            actual_path: data.join("raw_results").join("raw_results.csv"),
            report_path: data.join("output").join("verified.txt"),
            report_extra_subjects: false,
            summary_path: None,
        }
    }

    #[must_use]
    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            include_extra_subjects: self.report_extra_subjects,
        }
    }
}

/// Partial run settings, read from YAML or assembled from CLI flags, layered
/// over a [`VerifyConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunFile {
    #[serde(default)]
    pub expected: Option<PathBuf>,
    #[serde(default)]
    pub actual: Option<PathBuf>,
    #[serde(default)]
    pub report: Option<PathBuf>,
    #[serde(default)]
    pub report_extra_subjects: Option<bool>,
    #[serde(default)]
    pub summary: Option<PathBuf>,
}

impl RunFile {
    /// Load a YAML run file. Relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, VerifyError> {
        let body = fs::read_to_string(path).map_err(|source| VerifyError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let run_file = Self::from_yaml_str(&body).map_err(|source| VerifyError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Ok(run_file.relative_to(base))
    }

    pub fn from_yaml_str(body: &str) -> Result<Self, serde_yaml::Error> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(body)
    }

    #[must_use]
    pub fn relative_to(self, base: &Path) -> Self {
        let resolve = |path: Option<PathBuf>| path.map(|p| base.join(p));
        Self {
            expected: resolve(self.expected),
            actual: resolve(self.actual),
            report: resolve(self.report),
            report_extra_subjects: self.report_extra_subjects,
            summary: resolve(self.summary),
        }
    }

    #[must_use]
    pub fn apply_to(self, mut config: VerifyConfig) -> VerifyConfig {
        if let Some(path) = self.expected {
            config.expected_path = path;
        }
        if let Some(path) = self.actual {
            config.actual_path = path;
        }
        if let Some(path) = self.report {
            config.report_path = path;
        }
        if let Some(flag) = self.report_extra_subjects {
            config.report_extra_subjects = flag;
        }
        if let Some(path) = self.summary {
            config.summary_path = Some(path);
        }
        config
    }
}

/// Defaults under `root`, then the run file at `run_file` (if any), then
/// `overrides`; later layers win field by field.
pub fn resolve_config(
    root: &Path,
    run_file: Option<&Path>,
    overrides: RunFile,
) -> Result<VerifyConfig, VerifyError> {
    let mut config = VerifyConfig::default_paths(root);
    if let Some(path) = run_file {
        config = RunFile::load(path)?.apply_to(config);
    }
    Ok(overrides.apply_to(config))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    pub include_extra_subjects: bool,
}

struct Section {
    title: &'static str,
    lines: Vec<String>,
}

impl Section {
    fn keys(title: &'static str, keys: &[SubjectKey]) -> Self {
        Self {
            title,
            lines: keys.iter().map(|key| format!("- {key}")).collect(),
        }
    }

    fn label_mismatches(mismatches: &[LabelMismatch]) -> Self {
        Self {
            title: "is_ccdc_event mismatches",
            lines: mismatches
                .iter()
                .map(|m| {
                    format!(
                        "- {} | expected={} actual={}",
                        m.key,
                        title_bool(m.expected),
                        title_bool(m.actual)
                    )
                })
                .collect(),
        }
    }

    fn channel_mismatches(mismatches: &[ChannelMismatch]) -> Self {
        Self {
            title: "Channel mismatches (expected.is_ccdc_event == True)",
            lines: mismatches
                .iter()
                .flat_map(|m| {
                    [
                        format!("- {}", m.key),
                        format!("  expected_channels={}", format_channel_set(&m.expected)),
                        format!("  actual_channels  ={}", format_channel_set(&m.actual)),
                    ]
                })
                .collect(),
        }
    }
}

fn title_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn write_heading(f: &mut fmt::Formatter<'_>, title: &str, rule: char) -> fmt::Result {
    writeln!(f, "{title}")?;
    writeln!(f, "{}", rule.to_string().repeat(title.chars().count()))
}

/// Human-readable verification report.
///
/// Fixed sections come first; itemized lists follow only when non-empty, in
/// the order missing, extra (when enabled), label mismatches, channel
/// mismatches.
pub struct VerificationReport<'a> {
    pub stats: &'a ConfusionStats,
    pub channels: &'a ChannelStats,
    pub expected_path: &'a Path,
    pub actual_path: &'a Path,
    pub options: ReportOptions,
}

impl VerificationReport<'_> {
    fn itemized_sections(&self) -> Vec<Section> {
        let stats = self.stats;
        [
            (!stats.missing.is_empty())
                .then(|| Section::keys("Missing subjects in actual", &stats.missing)),
            (self.options.include_extra_subjects && !stats.extra.is_empty())
                .then(|| Section::keys("Extra subjects in actual", &stats.extra)),
            (!stats.mismatches.is_empty()).then(|| Section::label_mismatches(&stats.mismatches)),
            (!self.channels.mismatches.is_empty())
                .then(|| Section::channel_mismatches(&self.channels.mismatches)),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

impl fmt::Display for VerificationReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats;
        let counts = &stats.counts;

        write_heading(f, "Verification report", '=')?;
        writeln!(f)?;
        writeln!(f, "Expected file: {}", self.expected_path.display())?;
        writeln!(f, "Actual file:   {}", self.actual_path.display())?;
        writeln!(f)?;
        writeln!(f, "Subject key columns: {}", KEY_COLUMNS.join(", "))?;
        writeln!(
            f,
            "Note: Channels are compared ONLY when expected.is_ccdc_event == True."
        )?;
        writeln!(f)?;

        write_heading(f, "Coverage", '-')?;
        writeln!(f, "Subjects in expected: {}", stats.expected_count)?;
        writeln!(f, "Subjects in actual:   {}", stats.actual_count)?;
        writeln!(f, "Subjects compared (intersection): {}", stats.compared.len())?;
        writeln!(f, "Missing in actual (expected - actual): {}", stats.missing.len())?;
        writeln!(f, "Extra in actual (actual - expected):   {}", stats.extra.len())?;
        writeln!(f)?;

        write_heading(f, "Classification (based on is_ccdc_event)", '-')?;
        writeln!(f, "TP: {}", counts.true_positive)?;
        writeln!(f, "TN: {}", counts.true_negative)?;
        writeln!(f, "FP: {}", counts.false_positive)?;
        writeln!(f, "FN: {}", counts.false_negative)?;
        writeln!(f)?;

        write_heading(
            f,
            "Channel comparison (only where expected.is_ccdc_event == True)",
            '-',
        )?;
        writeln!(f, "Channel OK:         {}", self.channels.ok)?;
        writeln!(f, "Channel mismatches: {}", self.channels.mismatch_count())?;
        writeln!(f)?;

        for section in self.itemized_sections() {
            write_heading(f, section.title, '-')?;
            for line in &section.lines {
                writeln!(f, "{line}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[must_use]
pub fn format_report(
    stats: &ConfusionStats,
    channels: &ChannelStats,
    expected_path: &Path,
    actual_path: &Path,
    options: ReportOptions,
) -> String {
    VerificationReport {
        stats,
        channels,
        expected_path,
        actual_path,
        options,
    }
    .to_string()
}

/// Machine-readable companion to the text report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationSummary {
    pub expected_path: String,
    pub actual_path: String,
    pub report_path: String,
    pub subjects_expected: usize,
    pub subjects_actual: usize,
    pub subjects_compared: usize,
    pub missing: usize,
    pub extra: usize,
    pub counts: ConfusionCounts,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub accuracy: Option<f64>,
    pub channel_ok: usize,
    pub channel_mismatches: usize,
    pub label_mismatches: Vec<LabelMismatch>,
    pub channel_mismatch_details: Vec<ChannelMismatch>,
    pub report_sha256: String,
}

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub expected_path: PathBuf,
    pub actual_path: PathBuf,
    pub report_path: PathBuf,
    pub stats: ConfusionStats,
    pub channels: ChannelStats,
    pub report: String,
}

impl VerificationOutcome {
    /// Missing subjects, label mismatches or channel mismatches. Extra
    /// subjects do not count.
    #[must_use]
    pub fn has_disagreement(&self) -> bool {
        !self.stats.missing.is_empty()
            || !self.stats.mismatches.is_empty()
            || !self.channels.mismatches.is_empty()
    }

    /// `0`, or [`EXIT_DISAGREEMENT`] when `require_agreement` is set and the
    /// inputs disagree.
    #[must_use]
    pub fn exit_status(&self, require_agreement: bool) -> u8 {
        if require_agreement && self.has_disagreement() {
            EXIT_DISAGREEMENT
        } else {
            0
        }
    }

    #[must_use]
    pub fn summary(&self) -> VerificationSummary {
        let counts = self.stats.counts;
        VerificationSummary {
            expected_path: self.expected_path.display().to_string(),
            actual_path: self.actual_path.display().to_string(),
            report_path: self.report_path.display().to_string(),
            subjects_expected: self.stats.expected_count,
            subjects_actual: self.stats.actual_count,
            subjects_compared: self.stats.compared.len(),
            missing: self.stats.missing.len(),
            extra: self.stats.extra.len(),
            counts,
            precision: counts.precision(),
            recall: counts.recall(),
            f1: counts.f1(),
            accuracy: counts.accuracy(),
            channel_ok: self.channels.ok,
            channel_mismatches: self.channels.mismatch_count(),
            label_mismatches: self.stats.mismatches.clone(),
            channel_mismatch_details: self.channels.mismatches.clone(),
            report_sha256: hash_bytes(self.report.as_bytes()),
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Compare two aggregated mappings and render the report, without touching
/// the filesystem.
#[must_use]
pub fn verify_mappings(
    expected: &SubjectMap,
    actual: &SubjectMap,
    config: &VerifyConfig,
) -> VerificationOutcome {
    let stats = compare(expected, actual);
    let channels = compare_channels(expected, actual, &stats.compared);
    let report = format_report(
        &stats,
        &channels,
        &config.expected_path,
        &config.actual_path,
        config.report_options(),
    );
    VerificationOutcome {
        expected_path: config.expected_path.clone(),
        actual_path: config.actual_path.clone(),
        report_path: config.report_path.clone(),
        stats,
        channels,
        report,
    }
}

/// Aggregate both inputs, compare, and write the report (and the JSON summary
/// when configured). Any aggregation failure aborts before anything is
/// written.
pub fn run_verification(config: &VerifyConfig) -> Result<VerificationOutcome, VerifyError> {
    info!(
        expected = %config.expected_path.display(),
        actual = %config.actual_path.display(),
        "starting verification"
    );

    let expected = read_aggregated(&config.expected_path)?;
    let actual = read_aggregated(&config.actual_path)?;

    let outcome = verify_mappings(&expected, &actual, config);
    write_text(&config.report_path, &outcome.report)?;

    if let Some(path) = &config.summary_path {
        write_summary(path, &outcome.summary())?;
    }

    let counts = &outcome.stats.counts;
    info!(
        compared = outcome.stats.compared.len(),
        missing = outcome.stats.missing.len(),
        extra = outcome.stats.extra.len(),
        tp = counts.true_positive,
        tn = counts.true_negative,
        fp = counts.false_positive,
        fn_ = counts.false_negative,
        channel_mismatches = outcome.channels.mismatch_count(),
        "verification finished"
    );
    Ok(outcome)
}

pub fn write_summary(path: &Path, summary: &VerificationSummary) -> Result<(), VerifyError> {
    write_text(path, &serde_json::to_string_pretty(summary)?)
}

fn write_text(path: &Path, body: &str) -> Result<(), VerifyError> {
    let write_err = |source: std::io::Error| VerifyError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, body).map_err(write_err)
}

/// Check both inputs for rows whose width differs from the header. Offending
/// rows are logged; the check never fails verification by itself.
pub fn preflight_row_widths(
    config: &VerifyConfig,
) -> Result<Vec<(PathBuf, RowWidthReport)>, VerifyError> {
    let mut reports = Vec::with_capacity(2);
    for path in [&config.expected_path, &config.actual_path] {
        let report = check_row_widths(path)?;
        if !report.is_rectangular() {
            warn!(
                path = %path.display(),
                expected_width = report.expected_width,
                bad_rows = report.bad_rows.len(),
                "rows with unexpected field count"
            );
            for bad in report.bad_rows.iter().take(PREFLIGHT_LOG_LIMIT) {
                warn!(path = %path.display(), row = bad.row, width = bad.width, "bad row");
            }
        }
        reports.push((path.clone(), report));
    }
    Ok(reports)
}
