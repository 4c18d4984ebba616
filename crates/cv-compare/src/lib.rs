#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use cv_types::{SubjectKey, SubjectMap};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
}

impl Outcome {
    #[must_use]
    pub fn classify(expected: bool, actual: bool) -> Self {
        match (expected, actual) {
            (true, true) => Self::TruePositive,
            (false, false) => Self::TrueNegative,
            (false, true) => Self::FalsePositive,
            (true, false) => Self::FalseNegative,
        }
    }

    #[must_use]
    pub fn is_disagreement(self) -> bool {
        matches!(self, Self::FalsePositive | Self::FalseNegative)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
}

impl ConfusionCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::TruePositive => self.true_positive += 1,
            Outcome::TrueNegative => self.true_negative += 1,
            Outcome::FalsePositive => self.false_positive += 1,
            Outcome::FalseNegative => self.false_negative += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.true_positive + self.true_negative + self.false_positive + self.false_negative
    }

    #[must_use]
    pub fn precision(&self) -> Option<f64> {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    #[must_use]
    pub fn recall(&self) -> Option<f64> {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    /// Harmonic mean of precision and recall; `None` when either is undefined
    /// or both are zero.
    #[must_use]
    pub fn f1(&self) -> Option<f64> {
        let precision = self.precision()?;
        let recall = self.recall()?;
        let denominator = precision + recall;
        (denominator > 0.0).then(|| 2.0 * precision * recall / denominator)
    }

    #[must_use]
    pub fn accuracy(&self) -> Option<f64> {
        ratio(self.true_positive + self.true_negative, self.total())
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelMismatch {
    pub key: SubjectKey,
    pub expected: bool,
    pub actual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelMismatch {
    pub key: SubjectKey,
    pub expected: BTreeSet<String>,
    pub actual: BTreeSet<String>,
}

/// Coverage and label agreement between an expected and an actual mapping.
///
/// All key lists are sorted by [`SubjectKey`] ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionStats {
    pub expected_count: usize,
    pub actual_count: usize,
    pub compared: Vec<SubjectKey>,
    pub missing: Vec<SubjectKey>,
    pub extra: Vec<SubjectKey>,
    pub counts: ConfusionCounts,
    pub mismatches: Vec<LabelMismatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub ok: usize,
    pub mismatches: Vec<ChannelMismatch>,
}

impl ChannelStats {
    #[must_use]
    pub fn mismatch_count(&self) -> usize {
        self.mismatches.len()
    }

    #[must_use]
    pub fn graded(&self) -> usize {
        self.ok + self.mismatch_count()
    }
}

/// Tally the event label over subjects present in both mappings.
///
/// Subjects only in `expected` are `missing`, subjects only in `actual` are
/// `extra`; neither contributes to the confusion counts. Channels are not
/// consulted.
#[must_use]
pub fn compare(expected: &SubjectMap, actual: &SubjectMap) -> ConfusionStats {
    let mut compared = Vec::new();
    let mut missing = Vec::new();
    let mut counts = ConfusionCounts::default();
    let mut mismatches = Vec::new();

    for (key, want) in expected {
        let Some(got) = actual.get(key) else {
            missing.push(key.clone());
            continue;
        };

        let outcome = Outcome::classify(want.is_event, got.is_event);
        counts.record(outcome);
        if outcome.is_disagreement() {
            mismatches.push(LabelMismatch {
                key: key.clone(),
                expected: want.is_event,
                actual: got.is_event,
            });
        }
        compared.push(key.clone());
    }

    let extra = actual
        .keys()
        .filter(|key| !expected.contains_key(*key))
        .cloned()
        .collect();

    ConfusionStats {
        expected_count: expected.len(),
        actual_count: actual.len(),
        compared,
        missing,
        extra,
        counts,
        mismatches,
    }
}

/// Grade channel sets for compared subjects the expected side marks as events.
///
/// Subjects whose expected label is negative are skipped entirely, as are keys
/// absent from either mapping.
#[must_use]
pub fn compare_channels(
    expected: &SubjectMap,
    actual: &SubjectMap,
    compared: &[SubjectKey],
) -> ChannelStats {
    let mut stats = ChannelStats::default();

    for key in compared {
        let (Some(want), Some(got)) = (expected.get(key), actual.get(key)) else {
            continue;
        };
        if !want.is_event {
            continue;
        }

        if want.channels == got.channels {
            stats.ok += 1;
        } else {
            stats.mismatches.push(ChannelMismatch {
                key: key.clone(),
                expected: want.channels.clone(),
                actual: got.channels.clone(),
            });
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use cv_types::{AggregatedRecord, SubjectKey, SubjectMap};

    use super::{ConfusionCounts, LabelMismatch, Outcome, compare, compare_channels};

    fn key(id: &str) -> SubjectKey {
        SubjectKey::new("org/repo", id, "src/lib.rs")
    }

    fn map(entries: &[(&str, bool, &[&str])]) -> SubjectMap {
        entries
            .iter()
            .map(|(id, is_event, channels)| {
                (
                    key(id),
                    AggregatedRecord::with_channels(*is_event, channels.iter().copied()),
                )
            })
            .collect()
    }

    #[test]
    fn classify_covers_all_four_buckets() {
        assert_eq!(Outcome::classify(true, true), Outcome::TruePositive);
        assert_eq!(Outcome::classify(false, false), Outcome::TrueNegative);
        assert_eq!(Outcome::classify(false, true), Outcome::FalsePositive);
        assert_eq!(Outcome::classify(true, false), Outcome::FalseNegative);
        assert!(!Outcome::TruePositive.is_disagreement());
        assert!(Outcome::FalseNegative.is_disagreement());
    }

    #[test]
    fn compare_counts_buckets_and_records_label_mismatches() {
        let expected = map(&[
            ("tp", true, &[]),
            ("tn", false, &[]),
            ("fp", false, &[]),
            ("fn", true, &[]),
        ]);
        let actual = map(&[
            ("tp", true, &[]),
            ("tn", false, &[]),
            ("fp", true, &["X"]),
            ("fn", false, &[]),
        ]);

        let stats = compare(&expected, &actual);
        assert_eq!(
            stats.counts,
            ConfusionCounts {
                true_positive: 1,
                true_negative: 1,
                false_positive: 1,
                false_negative: 1,
            }
        );
        assert_eq!(stats.counts.total(), stats.compared.len());
        assert_eq!(
            stats.mismatches,
            vec![
                LabelMismatch {
                    key: key("fn"),
                    expected: true,
                    actual: false,
                },
                LabelMismatch {
                    key: key("fp"),
                    expected: false,
                    actual: true,
                },
            ]
        );
    }

    #[test]
    fn missing_subject_is_not_counted_in_any_bucket() {
        let expected = map(&[("k1", true, &["A"]), ("k2", false, &[])]);
        let actual = map(&[("k1", true, &["A"]), ("k9", true, &[])]);

        let stats = compare(&expected, &actual);
        assert_eq!(stats.missing, vec![key("k2")]);
        assert_eq!(stats.extra, vec![key("k9")]);
        assert_eq!(stats.compared, vec![key("k1")]);
        assert_eq!(stats.counts.total(), 1);
        assert_eq!(stats.missing.len() + stats.compared.len(), stats.expected_count);
        assert_eq!(stats.extra.len() + stats.compared.len(), stats.actual_count);
    }

    #[test]
    fn channel_subset_is_a_mismatch_even_when_label_agrees() {
        let expected = map(&[("k1", true, &["A", "B"])]);
        let actual = map(&[("k1", true, &["A"])]);

        let stats = compare(&expected, &actual);
        assert_eq!(stats.counts.true_positive, 1);

        let channels = compare_channels(&expected, &actual, &stats.compared);
        assert_eq!(channels.ok, 0);
        assert_eq!(channels.mismatch_count(), 1);
        let mismatch = &channels.mismatches[0];
        assert_eq!(mismatch.key, key("k1"));
        assert_eq!(mismatch.expected.len(), 2);
        assert!(mismatch.actual.contains("A"));
    }

    #[test]
    fn channels_are_graded_only_for_expected_events() {
        let expected = map(&[
            ("neg", false, &[]),
            ("pos", true, &["A"]),
            ("miss", true, &["B"]),
        ]);
        let actual = map(&[
            ("neg", true, &["spurious"]),
            ("pos", true, &["A"]),
            ("miss", false, &[]),
        ]);

        let stats = compare(&expected, &actual);
        let channels = compare_channels(&expected, &actual, &stats.compared);
        assert_eq!(channels.ok, 1);
        assert_eq!(channels.mismatch_count(), 1);
        assert_eq!(channels.mismatches[0].key, key("miss"));
        assert_eq!(channels.graded(), 2);
    }

    #[test]
    fn compare_channels_skips_keys_outside_both_mappings() {
        let expected = map(&[("k1", true, &["A"])]);
        let actual = SubjectMap::new();
        let channels = compare_channels(&expected, &actual, &[key("k1"), key("zz")]);
        assert_eq!(channels.graded(), 0);
    }

    #[test]
    fn derived_rates_handle_empty_denominators() {
        let empty = ConfusionCounts::default();
        assert_eq!(empty.precision(), None);
        assert_eq!(empty.recall(), None);
        assert_eq!(empty.f1(), None);
        assert_eq!(empty.accuracy(), None);

        let counts = ConfusionCounts {
            true_positive: 3,
            true_negative: 4,
            false_positive: 1,
            false_negative: 2,
        };
        assert_eq!(counts.precision(), Some(0.75));
        assert_eq!(counts.recall(), Some(0.6));
        assert_eq!(counts.accuracy(), Some(0.7));
        let f1 = counts.f1().expect("f1");
        assert!((f1 - 2.0 * 0.75 * 0.6 / 1.35).abs() < 1e-12);

        let no_hits = ConfusionCounts {
            false_positive: 1,
            false_negative: 1,
            ..ConfusionCounts::default()
        };
        assert_eq!(no_hits.precision(), Some(0.0));
        assert_eq!(no_hits.f1(), None);
    }
}
