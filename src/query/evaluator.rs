use chrono::{DateTime, Utc};
use regex::Regex;
use roaring::RoaringBitmap;
use std::collections::HashMap;

use crate::batch::store::RowBatchStore;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{CellValue, ColumnType, parse_datetime};
use crate::fuzzy::index::FuzzyIndex;
use crate::fuzzy::matcher;
use crate::query::ast::{FilterExpr, FilterLeaf, FilterOperator, LABELS_COLUMN, NO_LABEL};
use crate::store::object_store::ObjectStore;
use crate::tags::controller::TagController;

/// Result of evaluating a filter tree.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub row_ids: RoaringBitmap,
    pub matched_rows: u64,
    pub total_rows: u64,
    /// Leaf indices (in-order) that fell back to fuzzy matching.
    pub fuzzy_used: Vec<usize>,
    /// Suggestions per fuzzy leaf, for "did you mean" display.
    pub fuzzy_suggestions: HashMap<usize, Vec<String>>,
    /// Standalone match count per enabled leaf.
    pub leaf_match_counts: HashMap<usize, u64>,
}

pub struct FilterEvaluator<'a> {
    pub store: &'a ObjectStore,
    pub batches: &'a RowBatchStore,
    pub tags: &'a TagController,
    pub fuzzy: Option<&'a FuzzyIndex>,
    pub max_suggestions: usize,
}

impl FilterEvaluator<'_> {
    /// Evaluate the tree. Validation failures (bad regex, missing
    /// range bound, unknown column) surface before any scanning.
    pub fn evaluate(&self, expr: &FilterExpr) -> Result<FilterOutcome> {
        let leaves = expr.leaves();
        let regexes = compile_regexes(&leaves)?;
        self.validate(&leaves)?;

        let mut bitmaps: Vec<Option<RoaringBitmap>> = Vec::with_capacity(leaves.len());
        let mut fuzzy_used = Vec::new();
        let mut fuzzy_suggestions = HashMap::new();

        for (i, leaf) in leaves.iter().copied().enumerate() {
            if !leaf.enabled {
                bitmaps.push(None);
                continue;
            }
            let mut bitmap = if leaf.column == LABELS_COLUMN {
                self.label_bitmap(leaf)?
            } else {
                self.scan_leaf(leaf, regexes.get(&i))?
            };

            // Exact-match miss with fuzzy requested: consult the index
            // and rescan against the surviving token set.
            if bitmap.is_empty()
                && leaf.fuzzy
                && leaf.operator == FilterOperator::Eq
                && leaf.column != LABELS_COLUMN
            {
                if let Some(lookup) = self.fuzzy_lookup(leaf) {
                    if !lookup.is_empty() {
                        bitmap = self.scan_fuzzy(leaf, &lookup.surviving)?;
                    }
                    fuzzy_used.push(i);
                    fuzzy_suggestions.insert(i, lookup.suggestions);
                }
            }
            bitmaps.push(Some(bitmap));
        }

        let leaf_match_counts = bitmaps
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i, b.len())))
            .collect();

        let total_rows = self.batches.total_rows();
        let mut cursor = 0usize;
        let row_ids = match combine(expr, &bitmaps, &mut cursor) {
            Some(bitmap) => bitmap,
            // Every leaf disabled: the filter matches everything.
            None => all_rows(total_rows),
        };

        Ok(FilterOutcome {
            matched_rows: row_ids.len(),
            total_rows,
            row_ids,
            fuzzy_used,
            fuzzy_suggestions,
            leaf_match_counts,
        })
    }

    fn validate(&self, leaves: &[&FilterLeaf]) -> Result<()> {
        for leaf in leaves {
            if !leaf.enabled {
                continue;
            }
            if leaf.column == LABELS_COLUMN {
                if !matches!(leaf.operator, FilterOperator::Eq | FilterOperator::Neq) {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "label filters support only eq and neq",
                    ));
                }
                continue;
            }
            if self.batches.column_index(&leaf.column).is_none() {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("unknown column {}", leaf.column),
                ));
            }
            if leaf.operator == FilterOperator::Between && leaf.value2.is_none() {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "between requires a second value",
                ));
            }
        }
        Ok(())
    }

    fn label_bitmap(&self, leaf: &FilterLeaf) -> Result<RoaringBitmap> {
        let total = self.batches.total_rows();
        let positive = if leaf.value == NO_LABEL {
            // An empty label set is the no-label sentinel.
            all_rows(total) - self.tags.rows_with_any_label()
        } else {
            self.tags.rows_with_label(&leaf.value)
        };
        Ok(match leaf.operator {
            FilterOperator::Eq => positive,
            FilterOperator::Neq => all_rows(total) - positive,
            _ => unreachable!("validated above"),
        })
    }

    fn scan_leaf(&self, leaf: &FilterLeaf, regex: Option<&Regex>) -> Result<RoaringBitmap> {
        let col = self
            .batches
            .column_index(&leaf.column)
            .expect("validated above");
        let probe = LeafProbe::new(leaf, self.batches.column_type(col), regex);

        let mut bitmap = RoaringBitmap::new();
        for index in 0..self.batches.batch_count() {
            let batch = self.batches.batch(self.store, index)?;
            for local in 0..batch.len() {
                if probe.matches(&batch.cell(local, col)) {
                    bitmap.insert(batch.row_ids[local]);
                }
            }
        }
        Ok(bitmap)
    }

    fn fuzzy_lookup(&self, leaf: &FilterLeaf) -> Option<matcher::FuzzyLookup> {
        let column = self.fuzzy?.column(&leaf.column)?;
        let distance = leaf.fuzzy_distance.unwrap_or(2);
        Some(matcher::lookup(
            column,
            &leaf.value,
            distance,
            self.max_suggestions,
        ))
    }

    fn scan_fuzzy(
        &self,
        leaf: &FilterLeaf,
        surviving: &std::collections::HashSet<String>,
    ) -> Result<RoaringBitmap> {
        let col = self
            .batches
            .column_index(&leaf.column)
            .expect("validated above");
        let tokenizer = self
            .fuzzy
            .map(|f| f.tokenizer().clone())
            .unwrap_or_default();

        let mut bitmap = RoaringBitmap::new();
        for index in 0..self.batches.batch_count() {
            let batch = self.batches.batch(self.store, index)?;
            for local in 0..batch.len() {
                if let Some(text) = batch.cell(local, col).display() {
                    if tokenizer
                        .tokenize(&text)
                        .iter()
                        .any(|t| surviving.contains(t))
                    {
                        bitmap.insert(batch.row_ids[local]);
                    }
                }
            }
        }
        Ok(bitmap)
    }
}

fn compile_regexes(leaves: &[&FilterLeaf]) -> Result<HashMap<usize, Regex>> {
    let mut regexes = HashMap::new();
    for (i, leaf) in leaves.iter().enumerate() {
        if !leaf.enabled {
            continue;
        }
        if matches!(
            leaf.operator,
            FilterOperator::Matches | FilterOperator::NotMatches
        ) {
            let pattern = if leaf.case_sensitive {
                leaf.value.clone()
            } else {
                format!("(?i){}", leaf.value)
            };
            regexes.insert(i, Regex::new(&pattern)?);
        }
    }
    Ok(regexes)
}

/// Combine per-leaf bitmaps following the tree. `None` marks a disabled
/// leaf: a combinator with one disabled child collapses onto the other,
/// and a fully disabled subtree stays neutral.
fn combine(
    expr: &FilterExpr,
    bitmaps: &[Option<RoaringBitmap>],
    cursor: &mut usize,
) -> Option<RoaringBitmap> {
    match expr {
        FilterExpr::Leaf(_) => {
            let result = bitmaps[*cursor].clone();
            *cursor += 1;
            result
        }
        FilterExpr::And(l, r) => {
            let left = combine(l, bitmaps, cursor);
            let right = combine(r, bitmaps, cursor);
            match (left, right) {
                (Some(a), Some(b)) => Some(a & b),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            }
        }
        FilterExpr::Or(l, r) => {
            let left = combine(l, bitmaps, cursor);
            let right = combine(r, bitmaps, cursor);
            match (left, right) {
                (Some(a), Some(b)) => Some(a | b),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            }
        }
    }
}

fn all_rows(total: u64) -> RoaringBitmap {
    let mut bitmap = RoaringBitmap::new();
    if total > 0 {
        bitmap.insert_range(0..total as u32);
    }
    bitmap
}

/// Precomputed per-leaf comparison state, so the row scan does no
/// repeated parsing of the leaf value.
struct LeafProbe<'a> {
    leaf: &'a FilterLeaf,
    regex: Option<&'a Regex>,
    value_lower: String,
    value_number: Option<f64>,
    value_date: Option<DateTime<Utc>>,
    value2_number: Option<f64>,
    value2_date: Option<DateTime<Utc>>,
    date_column: bool,
}

impl<'a> LeafProbe<'a> {
    fn new(leaf: &'a FilterLeaf, column_type: ColumnType, regex: Option<&'a Regex>) -> Self {
        LeafProbe {
            leaf,
            regex,
            value_lower: leaf.value.to_lowercase(),
            value_number: leaf.value.trim().parse().ok(),
            value_date: parse_datetime(&leaf.value),
            value2_number: leaf.value2.as_deref().and_then(|v| v.trim().parse().ok()),
            value2_date: leaf.value2.as_deref().and_then(parse_datetime),
            date_column: column_type == ColumnType::Date,
        }
    }

    fn matches(&self, cell: &CellValue) -> bool {
        if cell.is_null() {
            // A missing value can only satisfy negative operators.
            return matches!(
                self.leaf.operator,
                FilterOperator::Neq | FilterOperator::NotMatches
            );
        }
        let text = cell.display().unwrap_or_default();

        match self.leaf.operator {
            FilterOperator::Contains => self.text_contains(&text),
            FilterOperator::StartsWith => {
                if self.leaf.case_sensitive {
                    text.starts_with(&self.leaf.value)
                } else {
                    text.to_lowercase().starts_with(&self.value_lower)
                }
            }
            FilterOperator::Eq => self.equals(cell, &text),
            FilterOperator::Neq => !self.equals(cell, &text),
            FilterOperator::Matches => self.regex.is_some_and(|r| r.is_match(&text)),
            FilterOperator::NotMatches => !self.regex.is_some_and(|r| r.is_match(&text)),
            FilterOperator::Gt => self.compare(cell, &text, |ord| ord.is_gt()),
            FilterOperator::Lt => self.compare(cell, &text, |ord| ord.is_lt()),
            FilterOperator::Between => self.between(cell, &text),
        }
    }

    fn text_contains(&self, text: &str) -> bool {
        if self.leaf.case_sensitive {
            text.contains(&self.leaf.value)
        } else {
            text.to_lowercase().contains(&self.value_lower)
        }
    }

    fn equals(&self, cell: &CellValue, text: &str) -> bool {
        if let (Some(cell_n), Some(value_n)) = (cell.as_number(), self.value_number) {
            return cell_n == value_n;
        }
        if self.leaf.case_sensitive {
            text == self.leaf.value
        } else {
            text.to_lowercase() == self.value_lower
        }
    }

    fn compare(
        &self,
        cell: &CellValue,
        text: &str,
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> bool {
        if self.date_column {
            if let (Some(cell_d), Some(value_d)) = (parse_datetime(text), self.value_date) {
                return accept(cell_d.cmp(&value_d));
            }
            return false;
        }
        match (cell.as_number(), self.value_number) {
            (Some(cell_n), Some(value_n)) => cell_n
                .partial_cmp(&value_n)
                .map(accept)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn between(&self, cell: &CellValue, text: &str) -> bool {
        if self.date_column {
            if let (Some(cell_d), Some(lo), Some(hi)) =
                (parse_datetime(text), self.value_date, self.value2_date)
            {
                return cell_d >= lo && cell_d <= hi;
            }
            return false;
        }
        if let (Some(cell_n), Some(lo), Some(hi)) =
            (cell.as_number(), self.value_number, self.value2_number)
        {
            return cell_n >= lo && cell_n <= hi;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::store::{LoadCallbacks, LoadOptions};
    use crate::core::types::Fingerprint;
    use crate::query::ast::FilterLeaf;
    use crate::tags::controller::TagMode;
    use std::io::Cursor;
    use std::time::Duration;

    const CSV: &str = "name,age,joined\nAlice,30,2024-01-05\nBob,25,2023-11-20\nCarol,30,2024-03-01\n";

    struct Fixture {
        store: ObjectStore,
        batches: RowBatchStore,
        tags: TagController,
        fuzzy: FuzzyIndex,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let fp = Fingerprint::new("f.csv", CSV.len() as u64, 1);
        let mut fuzzy = FuzzyIndex::new(
            fp.clone(),
            &["name".into(), "age".into(), "joined".into()],
            1000,
        );
        let mut on_batch = |b: &crate::batch::batch::RowBatch, _h: &[String]| {
            fuzzy.observe_batch(b);
        };
        let (batches, _) = RowBatchStore::load(
            &store,
            "f",
            Cursor::new(CSV),
            &LoadOptions {
                batch_size: 2,
                ..LoadOptions::from_config(&Default::default())
            },
            LoadCallbacks {
                on_progress: None,
                on_batch: Some(&mut on_batch),
            },
        )
        .unwrap();
        let mut tags = TagController::new(Duration::from_secs(5));
        tags.attach(fp);
        Fixture {
            store,
            batches,
            tags,
            fuzzy,
            _dir: dir,
        }
    }

    fn eval(f: &Fixture, expr: &FilterExpr) -> FilterOutcome {
        FilterEvaluator {
            store: &f.store,
            batches: &f.batches,
            tags: &f.tags,
            fuzzy: Some(&f.fuzzy),
            max_suggestions: 8,
        }
        .evaluate(expr)
        .unwrap()
    }

    #[test]
    fn eq_on_numeric_column() {
        let f = fixture();
        let expr = FilterExpr::leaf(FilterLeaf::new("age", FilterOperator::Eq, "30"));
        let out = eval(&f, &expr);
        assert_eq!(out.matched_rows, 2);
        assert_eq!(out.total_rows, 3);
        let rows: Vec<u32> = out.row_ids.iter().collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn filter_is_idempotent() {
        let f = fixture();
        let expr = FilterExpr::leaf(FilterLeaf::new("age", FilterOperator::Eq, "30"));
        let a = eval(&f, &expr);
        let b = eval(&f, &expr);
        assert_eq!(a.row_ids, b.row_ids);
        assert_eq!(a.matched_rows, b.matched_rows);
    }

    #[test]
    fn and_or_combinators() {
        let f = fixture();
        let expr = FilterExpr::and(
            FilterExpr::leaf(FilterLeaf::new("age", FilterOperator::Eq, "30")),
            FilterExpr::leaf(FilterLeaf::new("name", FilterOperator::Contains, "car")),
        );
        assert_eq!(eval(&f, &expr).matched_rows, 1);

        let expr = FilterExpr::or(
            FilterExpr::leaf(FilterLeaf::new("name", FilterOperator::Eq, "alice")),
            FilterExpr::leaf(FilterLeaf::new("name", FilterOperator::Eq, "bob")),
        );
        assert_eq!(eval(&f, &expr).matched_rows, 2);
    }

    #[test]
    fn disabled_leaf_collapses_onto_sibling() {
        let f = fixture();
        let mut disabled = FilterLeaf::new("name", FilterOperator::Eq, "nobody");
        disabled.enabled = false;
        let expr = FilterExpr::and(
            FilterExpr::leaf(FilterLeaf::new("age", FilterOperator::Eq, "30")),
            FilterExpr::leaf(disabled.clone()),
        );
        assert_eq!(eval(&f, &expr).matched_rows, 2);

        // All leaves disabled: match everything.
        let expr = FilterExpr::leaf(disabled);
        assert_eq!(eval(&f, &expr).matched_rows, 3);
    }

    #[test]
    fn range_operators_on_numbers_and_dates() {
        let f = fixture();
        let expr = FilterExpr::leaf(FilterLeaf::new("age", FilterOperator::Gt, "27"));
        assert_eq!(eval(&f, &expr).matched_rows, 2);

        let mut between = FilterLeaf::new("joined", FilterOperator::Between, "2024-01-01");
        between.value2 = Some("2024-12-31".to_string());
        let out = eval(&f, &FilterExpr::leaf(between));
        let rows: Vec<u32> = out.row_ids.iter().collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn regex_operators_and_invalid_pattern() {
        let f = fixture();
        let expr = FilterExpr::leaf(FilterLeaf::new("name", FilterOperator::Matches, "^[AB]"));
        assert_eq!(eval(&f, &expr).matched_rows, 2);

        let bad = FilterExpr::leaf(FilterLeaf::new("name", FilterOperator::Matches, "["));
        let err = FilterEvaluator {
            store: &f.store,
            batches: &f.batches,
            tags: &f.tags,
            fuzzy: Some(&f.fuzzy),
            max_suggestions: 8,
        }
        .evaluate(&bad)
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn fuzzy_fallback_after_exact_miss() {
        let f = fixture();
        let mut leaf = FilterLeaf::new("name", FilterOperator::Eq, "alicia");
        leaf.fuzzy = true;
        leaf.fuzzy_distance = Some(2);
        let out = eval(&f, &FilterExpr::leaf(leaf));
        assert_eq!(out.fuzzy_used, vec![0]);
        assert_eq!(out.matched_rows, 1);
        let rows: Vec<u32> = out.row_ids.iter().collect();
        assert_eq!(rows, vec![0]);
        assert_eq!(out.fuzzy_suggestions[&0][0], "alice");
    }

    #[test]
    fn label_pseudo_column() {
        let mut f = fixture();
        f.tags
            .update_label(Some("vip".into()), "VIP".into(), None, None);
        f.tags
            .tag_rows(&[1], &["vip".to_string()], None, TagMode::Replace)
            .unwrap();

        let eq = FilterExpr::leaf(FilterLeaf::new(LABELS_COLUMN, FilterOperator::Eq, "vip"));
        let rows: Vec<u32> = eval(&f, &eq).row_ids.iter().collect();
        assert_eq!(rows, vec![1]);

        let none = FilterExpr::leaf(FilterLeaf::new(LABELS_COLUMN, FilterOperator::Eq, NO_LABEL));
        let rows: Vec<u32> = eval(&f, &none).row_ids.iter().collect();
        assert_eq!(rows, vec![0, 2]);

        let neq = FilterExpr::leaf(FilterLeaf::new(LABELS_COLUMN, FilterOperator::Neq, "vip"));
        let rows: Vec<u32> = eval(&f, &neq).row_ids.iter().collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn per_leaf_match_counts() {
        let f = fixture();
        let expr = FilterExpr::and(
            FilterExpr::leaf(FilterLeaf::new("age", FilterOperator::Eq, "30")),
            FilterExpr::leaf(FilterLeaf::new("name", FilterOperator::StartsWith, "a")),
        );
        let out = eval(&f, &expr);
        assert_eq!(out.leaf_match_counts[&0], 2);
        assert_eq!(out.leaf_match_counts[&1], 1);
        assert_eq!(out.matched_rows, 1);
    }
}
