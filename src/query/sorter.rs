use crossbeam::channel::{Receiver, Sender, unbounded};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::time::Duration;

use crate::batch::store::RowBatchStore;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{CellValue, ColumnType, RowId, parse_datetime};
use crate::query::ast::{SortDirection, SortKey};
use crate::store::object_store::ObjectStore;

/// Normalized comparison key for one cell. Dates become timestamps so
/// datetime columns order numerically.
#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    Number(f64),
    Text(String),
    Null,
}

/// Nulls order last; numbers order before text in mixed columns.
fn cmp_values(a: &SortValue, b: &SortValue) -> Ordering {
    match (a, b) {
        (SortValue::Null, SortValue::Null) => Ordering::Equal,
        (SortValue::Null, _) => Ordering::Greater,
        (_, SortValue::Null) => Ordering::Less,
        (SortValue::Number(x), SortValue::Number(y)) => x.total_cmp(y),
        (SortValue::Number(_), SortValue::Text(_)) => Ordering::Less,
        (SortValue::Text(_), SortValue::Number(_)) => Ordering::Greater,
        (SortValue::Text(x), SortValue::Text(y)) => x.cmp(y),
    }
}

/// Materialize comparison keys for `row_ids`, one vector per sort key.
/// Extraction happens on the calling thread so the ordering pass can
/// run anywhere without touching the store.
pub fn extract_keys(
    store: &ObjectStore,
    batches: &RowBatchStore,
    row_ids: &[RowId],
    keys: &[SortKey],
) -> Result<Vec<Vec<SortValue>>> {
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let col = batches.column_index(&key.column).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("unknown sort column {}", key.column),
            )
        })?;
        let is_date = batches.column_type(col) == ColumnType::Date;

        let mut values = Vec::with_capacity(row_ids.len());
        for &row_id in row_ids {
            let cell = batches.cell(store, row_id, col)?;
            values.push(sort_value(&cell, is_date, key.case_sensitive));
        }
        out.push(values);
    }
    Ok(out)
}

fn sort_value(cell: &CellValue, is_date: bool, case_sensitive: bool) -> SortValue {
    match cell {
        CellValue::Null => SortValue::Null,
        CellValue::Number(n) => SortValue::Number(*n),
        CellValue::Boolean(b) => SortValue::Number(if *b { 1.0 } else { 0.0 }),
        CellValue::Text(_) => {
            let text = cell.display().unwrap_or_default();
            if is_date {
                match parse_datetime(&text) {
                    Some(dt) => SortValue::Number(dt.timestamp_millis() as f64),
                    None => SortValue::Null,
                }
            } else if case_sensitive {
                SortValue::Text(text)
            } else {
                SortValue::Text(text.to_lowercase())
            }
        }
    }
}

/// Stable multi-key ordering with original row id as the final
/// deterministic tie-break.
pub fn order_by_keys(
    row_ids: &[RowId],
    key_values: &[Vec<SortValue>],
    keys: &[SortKey],
    parallel: bool,
) -> Vec<RowId> {
    let mut indices: Vec<usize> = (0..row_ids.len()).collect();
    let comparator = |&a: &usize, &b: &usize| -> Ordering {
        for (k, key) in keys.iter().enumerate() {
            let mut ord = cmp_values(&key_values[k][a], &key_values[k][b]);
            if key.direction == SortDirection::Descending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        row_ids[a].cmp(&row_ids[b])
    };

    if parallel {
        indices.par_sort_by(comparator);
    } else {
        indices.sort_by(comparator);
    }
    indices.into_iter().map(|i| row_ids[i]).collect()
}

/// Completed background ordering, tagged with the generation of the
/// request that started it.
#[derive(Debug)]
pub struct SortCompletion {
    pub generation: u64,
    pub ordering: Vec<RowId>,
}

/// Hands full-ordering work to a background thread and delivers results
/// over a channel. The receiver decides whether a completion is still
/// current by comparing generations.
pub struct ProgressiveSorter {
    tx: Sender<SortCompletion>,
    rx: Receiver<SortCompletion>,
}

impl Default for ProgressiveSorter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressiveSorter {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        ProgressiveSorter { tx, rx }
    }

    /// Compute the full ordering off-thread. Keys must already be
    /// extracted; the worker owns its inputs outright.
    pub fn spawn_full(
        &self,
        generation: u64,
        row_ids: Vec<RowId>,
        key_values: Vec<Vec<SortValue>>,
        keys: Vec<SortKey>,
    ) {
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let parallel = num_cpus::get() > 1 && row_ids.len() > 10_000;
            let ordering = order_by_keys(&row_ids, &key_values, &keys, parallel);
            // The engine may already be gone; a dropped receiver is fine.
            let _ = tx.send(SortCompletion {
                generation,
                ordering,
            });
        });
    }

    pub fn try_complete(&self) -> Option<SortCompletion> {
        self.rx.try_recv().ok()
    }

    pub fn wait_complete(&self, timeout: Duration) -> Option<SortCompletion> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::store::{LoadCallbacks, LoadOptions};
    use std::io::Cursor;

    const CSV: &str = "name,age\nAlice,30\nBob,25\nCarol,30\nDave,\n";

    fn fixture() -> (tempfile::TempDir, ObjectStore, RowBatchStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let (batches, _) = RowBatchStore::load(
            &store,
            "s",
            Cursor::new(CSV),
            &LoadOptions::from_config(&Default::default()),
            LoadCallbacks::default(),
        )
        .unwrap();
        (dir, store, batches)
    }

    #[test]
    fn single_key_sort_with_row_id_tie_break() {
        let (_dir, store, batches) = fixture();
        let row_ids = vec![0, 1, 2, 3];
        let keys = vec![SortKey::asc("age")];
        let values = extract_keys(&store, &batches, &row_ids, &keys).unwrap();
        let ordered = order_by_keys(&row_ids, &values, &keys, false);
        // Bob(25), Alice(30) before Carol(30) by row id, null age last.
        assert_eq!(ordered, vec![1, 0, 2, 3]);
    }

    #[test]
    fn descending_sort() {
        let (_dir, store, batches) = fixture();
        let row_ids = vec![0, 1, 2, 3];
        let keys = vec![SortKey::desc("name")];
        let values = extract_keys(&store, &batches, &row_ids, &keys).unwrap();
        let ordered = order_by_keys(&row_ids, &values, &keys, false);
        assert_eq!(ordered, vec![3, 2, 1, 0]);
    }

    #[test]
    fn multi_key_sort() {
        let (_dir, store, batches) = fixture();
        let row_ids = vec![0, 1, 2, 3];
        let keys = vec![SortKey::asc("age"), SortKey::desc("name")];
        let values = extract_keys(&store, &batches, &row_ids, &keys).unwrap();
        let ordered = order_by_keys(&row_ids, &values, &keys, false);
        // Age ties broken by name descending: Carol before Alice.
        assert_eq!(ordered, vec![1, 2, 0, 3]);
    }

    #[test]
    fn unknown_sort_column_is_rejected() {
        let (_dir, store, batches) = fixture();
        let err = extract_keys(&store, &batches, &[0], &[SortKey::asc("ghost")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn background_completion_carries_generation() {
        let (_dir, store, batches) = fixture();
        let sorter = ProgressiveSorter::new();
        let row_ids = vec![0, 1, 2, 3];
        let keys = vec![SortKey::asc("age")];
        let values = extract_keys(&store, &batches, &row_ids, &keys).unwrap();
        sorter.spawn_full(7, row_ids, values, keys);
        let done = sorter.wait_complete(Duration::from_secs(5)).unwrap();
        assert_eq!(done.generation, 7);
        assert_eq!(done.ordering, vec![1, 0, 2, 3]);
    }
}
