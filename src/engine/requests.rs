use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::batch::parser::TextEncoding;
use crate::core::types::RowId;
use crate::query::ast::{FilterExpr, SortKey};
use crate::tags::controller::{MergeStrategy, TagMode, TagState};

/// One materialized row: id plus display cells in header order. Null
/// cells stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowView {
    pub row_id: RowId,
    pub cells: Vec<Option<String>>,
}

/// Caller-tunable ingestion knobs; unset fields fall back to config.
#[derive(Debug, Clone, Default)]
pub struct LoadFileOptions {
    pub delimiter: Option<u8>,
    pub encoding: Option<TextEncoding>,
    pub batch_size: Option<usize>,
    pub checkpoint_interval: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRequest {
    pub expression: FilterExpr,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResponse {
    pub rows: Vec<RowView>,
    pub total_rows: u64,
    pub matched_rows: u64,
    pub expression: FilterExpr,
    /// Leaf indices that fell back to fuzzy matching, so the caller can
    /// offer "back to exact".
    pub fuzzy_used: Vec<usize>,
    pub fuzzy_suggestions: HashMap<usize, Vec<String>>,
    pub predicate_match_counts: HashMap<usize, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortRequest {
    pub sorts: Vec<SortKey>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    /// Force or suppress the progressive path; unset defers to the
    /// dataset-size threshold.
    #[serde(default)]
    pub progressive: Option<bool>,
    /// Row ids currently on screen, ordered first during a progressive
    /// sort.
    #[serde(default)]
    pub visible_rows: Option<Vec<RowId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortResponse {
    pub rows: Vec<RowView>,
    pub total_rows: u64,
    pub matched_rows: u64,
    pub sorts: Vec<SortKey>,
    /// False while a background pass is still computing the full
    /// ordering.
    pub sort_complete: bool,
    pub sorted_row_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub max_distance: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSearchResponse {
    pub rows: Vec<RowView>,
    pub matched_rows: u64,
    /// Per-column fuzzy suggestions, populated when the exact scan
    /// found nothing.
    pub suggestions: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRowsRequest {
    pub row_ids: Vec<RowId>,
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub mode: TagMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLabelRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportTagsRequest {
    pub snapshot: TagState,
    pub merge_strategy: MergeStrategy,
}
