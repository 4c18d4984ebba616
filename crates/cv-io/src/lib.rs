#![forbid(unsafe_code)]

use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};
use cv_types::{
    AggregatedRecord, CHANNEL_COLUMN, COMMIT_COLUMN, EVENT_COLUMN, PATH_COLUMN, REPO_COLUMN,
    REQUIRED_COLUMNS, SubjectKey, SubjectMap, TypeError, normalize, parse_bool,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("{} has no header row", .path.display())]
    NoHeaderRow { path: PathBuf },
    #[error("{} is missing required columns: {missing:?}. Found: {found:?}", .path.display())]
    MissingColumns {
        path: PathBuf,
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error(
        "invalid boolean value for is_ccdc_event in {} at line {line}: {raw:?}",
        .path.display()
    )]
    InvalidBooleanValue {
        path: PathBuf,
        line: u64,
        raw: String,
    },
    #[error(
        "inconsistent is_ccdc_event for same subject key in {} at line {line}: key=({key}) had {first} then {conflicting}",
        .path.display()
    )]
    InconsistentLabel {
        path: PathBuf,
        line: u64,
        key: SubjectKey,
        first: bool,
        conflicting: bool,
    },
    #[error("malformed csv in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Positions of the required columns within a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub repo: usize,
    pub commit_sha: usize,
    pub path: usize,
    pub event: usize,
    pub channel: usize,
}

impl ColumnLayout {
    /// Resolve required columns by exact name. A repeated header name
    /// resolves to its last occurrence.
    pub fn resolve(headers: &StringRecord, source: &Path) -> Result<Self, IoError> {
        if headers.is_empty() {
            return Err(IoError::NoHeaderRow {
                path: source.to_path_buf(),
            });
        }

        let position = |name: &str| headers.iter().collect::<Vec<_>>().into_iter().rposition(|header| header == name);

        let missing = REQUIRED_COLUMNS
            .into_iter()
            .filter(|name| position(*name).is_none())
            .map(str::to_owned)
            .collect::<Vec<_>>();

        match (
            position(REPO_COLUMN),
            position(COMMIT_COLUMN),
            position(PATH_COLUMN),
            position(EVENT_COLUMN),
            position(CHANNEL_COLUMN),
        ) {
            (Some(repo), Some(commit_sha), Some(path), Some(event), Some(channel)) => Ok(Self {
                repo,
                commit_sha,
                path,
                event,
                channel,
            }),
            _ => Err(IoError::MissingColumns {
                path: source.to_path_buf(),
                missing,
                found: headers.iter().map(str::to_owned).collect(),
            }),
        }
    }

    #[must_use]
    pub fn key(&self, record: &StringRecord) -> SubjectKey {
        SubjectKey::from_raw(
            record.get(self.repo),
            record.get(self.commit_sha),
            record.get(self.path),
        )
    }
}

/// Aggregate the file at `path` into one record per subject.
pub fn read_aggregated(path: &Path) -> Result<SubjectMap, IoError> {
    let file = File::open(path).map_err(|source| IoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    aggregate_reader(file, path)
}

pub fn aggregate_csv_str(input: &str, source: &Path) -> Result<SubjectMap, IoError> {
    aggregate_reader(input.as_bytes(), source)
}

/// Fold every row of a delimited input into a [`SubjectMap`].
///
/// Rows sharing a key must agree on the event label; the first disagreement
/// aborts the fold. Channels are unioned across rows, skipping empty values.
/// Short rows read their missing trailing fields as empty.
pub fn aggregate_reader<R: Read>(input: R, source: &Path) -> Result<SubjectMap, IoError> {
    let csv_err = |err: csv::Error| IoError::Csv {
        path: source.to_path_buf(),
        source: err,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers().cloned().map_err(csv_err)?;
    let layout = ColumnLayout::resolve(&headers, source)?;

    let mut subjects = SubjectMap::new();
    let mut row_count = 0_usize;
    for row in reader.records() {
        let record = row.map_err(csv_err)?;
        let line = record.position().map_or(0, csv::Position::line);
        row_count += 1;

        let key = layout.key(&record);
        let is_event = parse_bool(record.get(layout.event)).map_err(|err| match err {
            TypeError::InvalidBool { raw } => IoError::InvalidBooleanValue {
                path: source.to_path_buf(),
                line,
                raw,
            },
        })?;
        let channel = normalize(record.get(layout.channel));

        match subjects.entry(key) {
            Entry::Occupied(mut entry) => {
                let first = entry.get().is_event;
                if first != is_event {
                    return Err(IoError::InconsistentLabel {
                        path: source.to_path_buf(),
                        line,
                        key: entry.key().clone(),
                        first,
                        conflicting: is_event,
                    });
                }
                entry.get_mut().add_channel(channel);
            }
            Entry::Vacant(entry) => {
                entry.insert(AggregatedRecord::new(is_event)).add_channel(channel);
            }
        }
    }

    debug!(
        path = %source.display(),
        rows = row_count,
        subjects = subjects.len(),
        "aggregated subject rows"
    );
    Ok(subjects)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWidth {
    /// Zero-based record index; the header is row 0. Blank lines are not
    /// records and do not advance the index.
    pub row: usize,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWidthReport {
    pub expected_width: usize,
    pub total_rows: usize,
    pub bad_rows: Vec<RowWidth>,
}

impl RowWidthReport {
    #[must_use]
    pub fn is_rectangular(&self) -> bool {
        self.bad_rows.is_empty()
    }
}

/// List every record whose field count differs from the header's. Blank
/// lines are skipped, as the aggregator skips them.
pub fn check_row_widths(path: &Path) -> Result<RowWidthReport, IoError> {
    let file = File::open(path).map_err(|source| IoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    check_row_widths_reader(file, path)
}

pub fn check_row_widths_reader<R: Read>(
    input: R,
    source: &Path,
) -> Result<RowWidthReport, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut expected_width = None;
    let mut total_rows = 0_usize;
    let mut bad_rows = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result.map_err(|err| IoError::Csv {
            path: source.to_path_buf(),
            source: err,
        })?;
        total_rows += 1;
        let width = record.len();
        match expected_width {
            None => expected_width = Some(width),
            Some(expected) if expected != width => bad_rows.push(RowWidth { row, width }),
            Some(_) => {}
        }
    }

    let expected_width = expected_width.ok_or_else(|| IoError::NoHeaderRow {
        path: source.to_path_buf(),
    })?;

    Ok(RowWidthReport {
        expected_width,
        total_rows,
        bad_rows,
    })
}
