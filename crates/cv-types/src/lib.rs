#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub const REPO_COLUMN: &str = "full_name_of_repo";
pub const COMMIT_COLUMN: &str = "commit_sha";
pub const PATH_COLUMN: &str = "path";
pub const EVENT_COLUMN: &str = "is_ccdc_event";
pub const CHANNEL_COLUMN: &str = "detected_channel";

/// Columns that identify a subject, in key order.
pub const KEY_COLUMNS: [&str; 3] = [REPO_COLUMN, COMMIT_COLUMN, PATH_COLUMN];

/// Every column an input file must declare in its header.
pub const REQUIRED_COLUMNS: [&str; 5] = [
    REPO_COLUMN,
    COMMIT_COLUMN,
    PATH_COLUMN,
    EVENT_COLUMN,
    CHANNEL_COLUMN,
];

const TRUTHY: [&str; 5] = ["true", "1", "yes", "y", "t"];
const FALSY: [&str; 6] = ["false", "0", "no", "n", "f", ""];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("invalid boolean value: {raw:?}")]
    InvalidBool { raw: String },
}

/// Trim a raw field; an absent field normalizes to the empty string.
#[must_use]
pub fn normalize(raw: Option<&str>) -> String {
    raw.map(str::trim).unwrap_or_default().to_owned()
}

/// Parse a spreadsheet-style boolean token.
///
/// Matching is case-insensitive after trimming. Empty and absent values are
/// `false`; anything outside the accepted vocabulary is rejected rather than
/// defaulted.
pub fn parse_bool(raw: Option<&str>) -> Result<bool, TypeError> {
    let token = normalize(raw).to_lowercase();
    if TRUTHY.contains(&token.as_str()) {
        return Ok(true);
    }
    if FALSY.contains(&token.as_str()) {
        return Ok(false);
    }
    Err(TypeError::InvalidBool {
        raw: raw.unwrap_or_default().to_owned(),
    })
}

/// Identity of one graded subject: repository, commit, file path.
///
/// Ordering is lexicographic on the triple, which is the order every report
/// list is sorted by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubjectKey {
    pub full_name_of_repo: String,
    pub commit_sha: String,
    pub path: String,
}

impl SubjectKey {
    /// Build a key from raw fields, normalizing each component.
    #[must_use]
    pub fn from_raw(repo: Option<&str>, commit_sha: Option<&str>, path: Option<&str>) -> Self {
        Self {
            full_name_of_repo: normalize(repo),
            commit_sha: normalize(commit_sha),
            path: normalize(path),
        }
    }

    #[must_use]
    pub fn new(repo: &str, commit_sha: &str, path: &str) -> Self {
        Self::from_raw(Some(repo), Some(commit_sha), Some(path))
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {}",
            self.full_name_of_repo, self.commit_sha, self.path
        )
    }
}

/// Per-subject view of one file after folding all rows sharing a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedRecord {
    pub is_event: bool,
    pub channels: BTreeSet<String>,
}

impl AggregatedRecord {
    #[must_use]
    pub fn new(is_event: bool) -> Self {
        Self {
            is_event,
            channels: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_channels<I, S>(is_event: bool, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = Self::new(is_event);
        for channel in channels {
            record.add_channel(channel.into());
        }
        record
    }

    /// Union a channel into the set. Empty values are never stored.
    pub fn add_channel(&mut self, channel: String) {
        if !channel.is_empty() {
            self.channels.insert(channel);
        }
    }
}

pub type SubjectMap = BTreeMap<SubjectKey, AggregatedRecord>;

/// Render a channel set as a sorted, quoted list, e.g. `['A', 'B']`.
#[must_use]
pub fn format_channel_set(channels: &BTreeSet<String>) -> String {
    let items = channels
        .iter()
        .map(|channel| format!("'{channel}'"))
        .collect::<Vec<_>>();
    format!("[{}]", items.join(", "))
}
