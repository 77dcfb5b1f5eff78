use serde::{Deserialize, Serialize};

use crate::store::TypeStatusCounts;

/// Hit rate for one predicted event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionAccuracy {
    pub predicted_event_type: String,
    pub made: i64,
    pub fulfilled: i64,
    pub expired: i64,
    pub pending: i64,
    /// `fulfilled / made`, 0 when nothing was predicted
    pub accuracy: f64,
}

impl PredictionAccuracy {
    fn from_counts(predicted_event_type: String, pending: i64, fulfilled: i64, expired: i64) -> Self {
        let made = pending + fulfilled + expired;
        let accuracy = if made > 0 {
            fulfilled as f64 / made as f64
        } else {
            0.0
        };
        Self {
            predicted_event_type,
            made,
            fulfilled,
            expired,
            pending,
            accuracy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub by_type: Vec<PredictionAccuracy>,
    pub overall: PredictionAccuracy,
}

impl AccuracyReport {
    pub fn from_counts(counts: Vec<TypeStatusCounts>) -> Self {
        let (mut pending, mut fulfilled, mut expired) = (0, 0, 0);
        let by_type = counts
            .into_iter()
            .map(|c| {
                pending += c.pending;
                fulfilled += c.fulfilled;
                expired += c.expired;
                PredictionAccuracy::from_counts(c.predicted_event_type, c.pending, c.fulfilled, c.expired)
            })
            .collect();

        Self {
            by_type,
            overall: PredictionAccuracy::from_counts("all".to_string(), pending, fulfilled, expired),
        }
    }

    pub fn for_type(&self, predicted_event_type: &str) -> Option<&PredictionAccuracy> {
        self.by_type
            .iter()
            .find(|a| a.predicted_event_type == predicted_event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(t: &str, pending: i64, fulfilled: i64, expired: i64) -> TypeStatusCounts {
        TypeStatusCounts {
            predicted_event_type: t.to_string(),
            pending,
            fulfilled,
            expired,
        }
    }

    #[test]
    fn test_report_totals() {
        let report = AccuracyReport::from_counts(vec![
            counts("market_volatility", 1, 3, 0),
            counts("trade_restrictions", 0, 1, 3),
        ]);

        let volatility = report.for_type("market_volatility").unwrap();
        assert_eq!(volatility.made, 4);
        assert!((volatility.accuracy - 0.75).abs() < 1e-9);

        assert_eq!(report.overall.made, 8);
        assert_eq!(report.overall.fulfilled, 4);
        assert!((report.overall.accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report() {
        let report = AccuracyReport::from_counts(Vec::new());
        assert!(report.by_type.is_empty());
        assert_eq!(report.overall.made, 0);
        assert_eq!(report.overall.accuracy, 0.0);
    }
}
