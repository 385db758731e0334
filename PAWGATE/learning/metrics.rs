//! Held-out evaluation metrics.

use std::path::Path;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{dataloader::CLASS_NAMES, errors::LearningResult, persist};

/// Per-class precision/recall block of the classification report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClassReport {
    /// Precision for the class.
    pub precision: f64,
    /// Recall for the class.
    pub recall: f64,
    /// Harmonic mean of precision and recall.
    #[serde(rename = "f1-score")]
    pub f1_score: f64,
    /// Number of true samples of the class.
    pub support: usize,
}

/// Evaluation summary written to `metrics.json`.
///
/// Scalar precision/recall/F1 treat `dogs` as the positive class.
/// `confusion_matrix` is `[[tn, fp], [fn, tp]]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationMetrics {
    /// Fraction of correct predictions.
    pub accuracy: f64,
    /// Positive-class precision.
    pub precision: f64,
    /// Positive-class recall.
    pub recall: f64,
    /// Positive-class F1.
    pub f1_score: f64,
    /// Area under the ROC curve; absent when only one class is present.
    pub roc_auc: Option<f64>,
    /// `[[tn, fp], [fn, tp]]`.
    pub confusion_matrix: [[usize; 2]; 2],
    /// Per-class breakdown keyed by class name.
    pub classification_report: IndexMap<String, ClassReport>,
    /// Number of evaluated samples.
    pub samples: usize,
    /// Evaluation time.
    pub timestamp: DateTime<Utc>,
}

impl EvaluationMetrics {
    /// Computes metrics for labels (0/1) and `P(dog)` scores, thresholded at 0.5.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(labels: &[u8], probabilities: &[f32]) -> Self {
        let mut matrix = [[0_usize; 2]; 2];
        for (&label, &p) in labels.iter().zip(probabilities) {
            let actual = usize::from(label > 0);
            let predicted = usize::from(p > 0.5);
            matrix[actual][predicted] += 1;
        }
        let [[tn, fp], [fn_, tp]] = matrix;
        let samples = tn + fp + fn_ + tp;

        let mut report = IndexMap::new();
        report.insert(CLASS_NAMES[0].to_string(), class_report(tn, fn_, fp));
        report.insert(CLASS_NAMES[1].to_string(), class_report(tp, fp, fn_));
        let positive = report[CLASS_NAMES[1]];

        Self {
            accuracy: ratio(tp + tn, samples),
            precision: positive.precision,
            recall: positive.recall,
            f1_score: positive.f1_score,
            roc_auc: roc_auc(labels, probabilities),
            confusion_matrix: matrix,
            classification_report: report,
            samples,
            timestamp: Utc::now(),
        }
    }

    /// Writes pretty JSON atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> LearningResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        persist::write_atomic(path.as_ref(), &bytes)
    }

    /// Reads a previously saved metrics file.
    pub fn load(path: impl AsRef<Path>) -> LearningResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Rank-based ROC AUC with tied scores sharing their average rank.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
pub fn roc_auc(labels: &[u8], scores: &[f32]) -> Option<f64> {
    let mut ranked: Vec<(f32, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(&s, &l)| (s, l > 0))
        .collect();
    let positives = ranked.iter().filter(|(_, pos)| *pos).count();
    let negatives = ranked.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < ranked.len() {
        let mut end = start;
        while end + 1 < ranked.len() && ranked[end + 1].0 == ranked[start].0 {
            end += 1;
        }
        // 1-based ranks start+1..=end+1
        let average = (start + end) as f64 / 2.0 + 1.0;
        let tied_positives = ranked[start..=end].iter().filter(|(_, pos)| *pos).count();
        positive_rank_sum += average * tied_positives as f64;
        start = end + 1;
    }
    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

fn class_report(hits: usize, false_alarms: usize, misses: usize) -> ClassReport {
    let precision = ratio(hits, hits + false_alarms);
    let recall = ratio(hits, hits + misses);
    let f1_score = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    ClassReport {
        precision,
        recall,
        f1_score,
        support: hits + misses,
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn balanced_mistakes() {
        let m = EvaluationMetrics::compute(&[0, 0, 1, 1], &[0.1, 0.6, 0.4, 0.9]);
        assert_eq!(m.confusion_matrix, [[1, 1], [1, 1]]);
        assert!(close(m.accuracy, 0.5));
        assert!(close(m.precision, 0.5));
        assert!(close(m.recall, 0.5));
        assert!(close(m.f1_score, 0.5));
        assert!(close(m.roc_auc.unwrap(), 0.75));
        assert_eq!(m.classification_report["cats"].support, 2);
        assert_eq!(m.samples, 4);
    }

    #[test]
    fn perfect_separation() {
        let m = EvaluationMetrics::compute(&[0, 1, 0, 1], &[0.2, 0.8, 0.3, 0.99]);
        assert!(close(m.accuracy, 1.0));
        assert!(close(m.roc_auc.unwrap(), 1.0));
        assert!(close(m.classification_report["cats"].f1_score, 1.0));
    }

    #[test]
    fn single_class_has_no_auc_and_zero_precision() {
        let m = EvaluationMetrics::compute(&[0, 0], &[0.1, 0.2]);
        assert!(m.roc_auc.is_none());
        assert!(close(m.precision, 0.0));
        assert!(close(m.accuracy, 1.0));
    }

    #[test]
    fn ties_share_rank() {
        assert!(close(roc_auc(&[0, 1], &[0.5, 0.5]).unwrap(), 0.5));
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let m = EvaluationMetrics::compute(&[0, 1], &[0.3, 0.7]);
        m.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"f1-score\""));
        assert_eq!(EvaluationMetrics::load(&path).unwrap(), m);
    }
}
