use chrono::{DateTime, Utc};

use crate::core::types::{ColumnInference, ColumnType, parse_boolean, parse_datetime};

const MAX_EXAMPLES: usize = 5;
/// Share of non-null values that must agree before a non-text type wins.
const TYPE_THRESHOLD: f64 = 0.8;

/// Running type inference for one column, updated batch by batch during
/// ingestion.
#[derive(Debug, Clone)]
pub struct ColumnInferenceBuilder {
    name: String,
    total: u64,
    nulls: u64,
    numeric: u64,
    boolean: u64,
    date: u64,
    min_number: Option<f64>,
    max_number: Option<f64>,
    min_date: Option<DateTime<Utc>>,
    max_date: Option<DateTime<Utc>>,
    examples: Vec<String>,
    truncated: bool,
}

impl ColumnInferenceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ColumnInferenceBuilder {
            name: name.into(),
            total: 0,
            nulls: 0,
            numeric: 0,
            boolean: 0,
            date: 0,
            min_number: None,
            max_number: None,
            min_date: None,
            max_date: None,
            examples: Vec::new(),
            truncated: false,
        }
    }

    pub fn observe(&mut self, raw: &str) {
        self.total += 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            self.nulls += 1;
            return;
        }

        if let Ok(n) = trimmed.parse::<f64>() {
            self.numeric += 1;
            self.min_number = Some(self.min_number.map_or(n, |m| m.min(n)));
            self.max_number = Some(self.max_number.map_or(n, |m| m.max(n)));
        }
        if parse_boolean(trimmed).is_some() {
            self.boolean += 1;
        }
        if let Some(dt) = parse_datetime(trimmed) {
            self.date += 1;
            self.min_date = Some(self.min_date.map_or(dt, |m| m.min(dt)));
            self.max_date = Some(self.max_date.map_or(dt, |m| m.max(dt)));
        }

        if self.examples.len() < MAX_EXAMPLES {
            if !self.examples.iter().any(|e| e == trimmed) {
                self.examples.push(trimmed.to_string());
            }
        } else if !self.examples.iter().any(|e| e == trimmed) {
            self.truncated = true;
        }
    }

    pub fn detected_type(&self) -> (ColumnType, f64) {
        let non_null = self.total.saturating_sub(self.nulls);
        if non_null == 0 {
            return (ColumnType::Text, 0.0);
        }
        let ratio = |count: u64| count as f64 / non_null as f64;

        // Boolean beats number ("1"/"0" parse as both); date beats
        // nothing since date strings never parse as numbers.
        let candidates = [
            (ColumnType::Boolean, ratio(self.boolean)),
            (ColumnType::Date, ratio(self.date)),
            (ColumnType::Number, ratio(self.numeric)),
        ];
        for (ty, conf) in candidates {
            if conf >= TYPE_THRESHOLD {
                return (ty, conf);
            }
        }
        let best_other = candidates.iter().map(|(_, c)| *c).fold(0.0, f64::max);
        (ColumnType::Text, 1.0 - best_other)
    }

    pub fn finish(&self) -> ColumnInference {
        let (detected, confidence) = self.detected_type();
        ColumnInference {
            column: self.name.clone(),
            detected,
            confidence,
            null_count: self.nulls,
            min_number: self.min_number,
            max_number: self.max_number,
            min_date: self.min_date,
            max_date: self.max_date,
            examples: self.examples.clone(),
            truncated: self.truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_column_detected_with_full_confidence() {
        let mut b = ColumnInferenceBuilder::new("age");
        for v in ["30", "25", "41"] {
            b.observe(v);
        }
        let (ty, conf) = b.detected_type();
        assert_eq!(ty, ColumnType::Number);
        assert_eq!(conf, 1.0);
        let inf = b.finish();
        assert_eq!(inf.min_number, Some(25.0));
        assert_eq!(inf.max_number, Some(41.0));
    }

    #[test]
    fn mixed_column_falls_back_to_text() {
        let mut b = ColumnInferenceBuilder::new("mixed");
        for v in ["30", "hello", "world", "x", "y"] {
            b.observe(v);
        }
        let (ty, _) = b.detected_type();
        assert_eq!(ty, ColumnType::Text);
    }

    #[test]
    fn nulls_are_counted_not_typed() {
        let mut b = ColumnInferenceBuilder::new("sparse");
        for v in ["", "10", "", "20"] {
            b.observe(v);
        }
        let inf = b.finish();
        assert_eq!(inf.null_count, 2);
        assert_eq!(inf.detected, ColumnType::Number);
    }

    #[test]
    fn boolean_wins_over_number_for_binary_flags() {
        let mut b = ColumnInferenceBuilder::new("flag");
        for v in ["1", "0", "1", "true"] {
            b.observe(v);
        }
        assert_eq!(b.detected_type().0, ColumnType::Boolean);
    }

    #[test]
    fn date_column_tracks_min_max() {
        let mut b = ColumnInferenceBuilder::new("when");
        for v in ["2024-01-02", "2023-06-01", "2024-05-05"] {
            b.observe(v);
        }
        let inf = b.finish();
        assert_eq!(inf.detected, ColumnType::Date);
        assert!(inf.min_date.unwrap() < inf.max_date.unwrap());
    }

    #[test]
    fn examples_cap_and_truncation_flag() {
        let mut b = ColumnInferenceBuilder::new("many");
        for i in 0..10 {
            b.observe(&format!("value-{}", i));
        }
        let inf = b.finish();
        assert_eq!(inf.examples.len(), 5);
        assert!(inf.truncated);
    }
}
