use roaring::RoaringBitmap;

use crate::batch::store::RowBatchStore;
use crate::core::types::{Fingerprint, RowId};
use crate::fuzzy::index::FuzzyIndex;
use crate::query::ast::{FilterExpr, SortKey};

/// Aggregate root for one loaded file. Exactly one dataset is live per
/// engine; loading a new file replaces it wholesale.
pub struct Dataset {
    pub fingerprint: Fingerprint,
    /// Sanitized name + fingerprint key; prefixes this dataset's files
    /// in the durable store.
    pub dataset_key: String,
    pub batches: RowBatchStore,
    pub fuzzy: Option<FuzzyIndex>,
    /// Current matching row-id set; `None` means "all rows".
    pub filter_row_ids: Option<RoaringBitmap>,
    pub filter_expr: Option<FilterExpr>,
    /// Current ordering over the filtered set; `None` means insertion
    /// order.
    pub sorted_row_ids: Option<Vec<RowId>>,
    pub sorts: Vec<SortKey>,
    pub sort_complete: bool,
}

impl Dataset {
    pub fn new(fingerprint: Fingerprint, dataset_key: String, batches: RowBatchStore) -> Self {
        Dataset {
            fingerprint,
            dataset_key,
            batches,
            fuzzy: None,
            filter_row_ids: None,
            filter_expr: None,
            sorted_row_ids: None,
            sorts: Vec::new(),
            sort_complete: true,
        }
    }

    /// Rows in the current view, filtered when a filter is active.
    pub fn matched_rows(&self) -> u64 {
        match &self.filter_row_ids {
            Some(bitmap) => bitmap.len(),
            None => self.batches.total_rows(),
        }
    }

    /// The filtered row set in insertion order.
    pub fn filtered_rows(&self) -> Vec<RowId> {
        match &self.filter_row_ids {
            Some(bitmap) => bitmap.iter().collect(),
            None => (0..self.batches.total_rows() as RowId).collect(),
        }
    }

    /// A window of the current view: sorted order when present,
    /// insertion order otherwise.
    pub fn view_window(&self, offset: u64, limit: u64) -> Vec<RowId> {
        if let Some(sorted) = &self.sorted_row_ids {
            return sorted
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .copied()
                .collect();
        }
        match &self.filter_row_ids {
            Some(bitmap) => bitmap
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect(),
            None => {
                let total = self.batches.total_rows();
                let start = offset.min(total);
                let end = offset.saturating_add(limit).min(total);
                (start as RowId..end as RowId).collect()
            }
        }
    }
}
