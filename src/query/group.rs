use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::batch::store::RowBatchStore;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::RowId;
use crate::query::ast::{AggregateOp, AggregateSpec, GroupRequest};
use crate::store::object_store::ObjectStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRow {
    /// Composite key, one entry per grouping column; null cells stay
    /// null rather than collapsing into empty strings.
    pub key: Vec<Option<String>>,
    pub row_count: u64,
    /// One value per requested aggregate, in request order. `None` when
    /// the group held no usable values (all-null sum, for instance).
    pub aggregates: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub groups: Vec<GroupRow>,
    pub group_count: usize,
    pub total_rows: u64,
}

#[derive(Debug, Clone, Default)]
struct AggregateAccum {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl AggregateAccum {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn result(&self, op: AggregateOp) -> Option<f64> {
        match op {
            AggregateOp::Count => Some(self.count as f64),
            AggregateOp::Sum => (self.count > 0).then_some(self.sum),
            AggregateOp::Min => self.min,
            AggregateOp::Max => self.max,
            AggregateOp::Avg => (self.count > 0).then(|| self.sum / self.count as f64),
        }
    }
}

/// Partition `row_ids` by the composite key of the requested columns
/// and fold the requested aggregates per group. Requests with non-count
/// aggregates lacking a target column are rejected before any scan.
pub fn group_rows(
    store: &ObjectStore,
    batches: &RowBatchStore,
    row_ids: impl Iterator<Item = RowId>,
    request: &GroupRequest,
) -> Result<GroupOutcome> {
    if request.columns.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "group by requires at least one column",
        ));
    }
    let mut key_cols = Vec::with_capacity(request.columns.len());
    for name in &request.columns {
        key_cols.push(batches.column_index(name).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("unknown group column {}", name),
            )
        })?);
    }

    let mut agg_cols: Vec<Option<usize>> = Vec::with_capacity(request.aggregates.len());
    for spec in &request.aggregates {
        agg_cols.push(resolve_aggregate_column(batches, spec)?);
    }

    let mut groups: HashMap<Vec<Option<String>>, (u64, Vec<AggregateAccum>)> = HashMap::new();
    let mut total_rows = 0u64;

    for row_id in row_ids {
        total_rows += 1;
        let key: Vec<Option<String>> = key_cols
            .iter()
            .map(|&c| {
                batches
                    .cell(store, row_id, c)
                    .map(|cell| cell.display())
                    .unwrap_or(None)
            })
            .collect();

        let entry = groups
            .entry(key)
            .or_insert_with(|| (0, vec![AggregateAccum::default(); request.aggregates.len()]));
        entry.0 += 1;

        for (i, col) in agg_cols.iter().enumerate() {
            match col {
                Some(c) => {
                    if let Ok(cell) = batches.cell(store, row_id, *c) {
                        if let Some(n) = cell.as_number() {
                            entry.1[i].observe(n);
                        }
                    }
                }
                // Count aggregates track the group size directly.
                None => entry.1[i].count += 1,
            }
        }
    }

    let mut rows: Vec<GroupRow> = groups
        .into_iter()
        .map(|(key, (row_count, accums))| GroupRow {
            key,
            row_count,
            aggregates: accums
                .iter()
                .zip(&request.aggregates)
                .map(|(acc, spec)| acc.result(spec.op))
                .collect(),
        })
        .collect();
    rows.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(GroupOutcome {
        group_count: rows.len(),
        groups: rows,
        total_rows,
    })
}

fn resolve_aggregate_column(
    batches: &RowBatchStore,
    spec: &AggregateSpec,
) -> Result<Option<usize>> {
    match (&spec.column, spec.op) {
        (None, AggregateOp::Count) => Ok(None),
        (None, op) => Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("aggregate {:?} requires a target column", op),
        )),
        (Some(name), _) => batches
            .column_index(name)
            .map(Some)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidArgument,
                    format!("unknown aggregate column {}", name),
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::store::{LoadCallbacks, LoadOptions};
    use std::io::Cursor;

    const CSV: &str = "city,amount\nOslo,10\nBergen,5\nOslo,20\nBergen,\n";

    fn fixture() -> (tempfile::TempDir, ObjectStore, RowBatchStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let (batches, _) = RowBatchStore::load(
            &store,
            "g",
            Cursor::new(CSV),
            &LoadOptions::from_config(&Default::default()),
            LoadCallbacks::default(),
        )
        .unwrap();
        (dir, store, batches)
    }

    fn request(aggregates: Vec<AggregateSpec>) -> GroupRequest {
        GroupRequest {
            columns: vec!["city".to_string()],
            aggregates,
            use_filter: false,
        }
    }

    #[test]
    fn groups_with_count_and_sum() {
        let (_dir, store, batches) = fixture();
        let req = request(vec![
            AggregateSpec {
                op: AggregateOp::Count,
                column: None,
            },
            AggregateSpec {
                op: AggregateOp::Sum,
                column: Some("amount".to_string()),
            },
        ]);
        let out = group_rows(&store, &batches, 0..4, &req).unwrap();
        assert_eq!(out.group_count, 2);
        assert_eq!(out.total_rows, 4);

        let bergen = &out.groups[0];
        assert_eq!(bergen.key, vec![Some("Bergen".to_string())]);
        assert_eq!(bergen.row_count, 2);
        assert_eq!(bergen.aggregates, vec![Some(2.0), Some(5.0)]);

        let oslo = &out.groups[1];
        assert_eq!(oslo.row_count, 2);
        assert_eq!(oslo.aggregates, vec![Some(2.0), Some(30.0)]);
    }

    #[test]
    fn min_max_avg() {
        let (_dir, store, batches) = fixture();
        let req = request(
            [AggregateOp::Min, AggregateOp::Max, AggregateOp::Avg]
                .into_iter()
                .map(|op| AggregateSpec {
                    op,
                    column: Some("amount".to_string()),
                })
                .collect(),
        );
        let out = group_rows(&store, &batches, 0..4, &req).unwrap();
        let oslo = &out.groups[1];
        assert_eq!(oslo.aggregates, vec![Some(10.0), Some(20.0), Some(15.0)]);
    }

    #[test]
    fn non_count_aggregate_without_column_is_rejected() {
        let (_dir, store, batches) = fixture();
        let req = request(vec![AggregateSpec {
            op: AggregateOp::Sum,
            column: None,
        }]);
        let err = group_rows(&store, &batches, 0..4, &req).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn grouping_respects_the_row_subset() {
        let (_dir, store, batches) = fixture();
        let req = request(vec![AggregateSpec {
            op: AggregateOp::Count,
            column: None,
        }]);
        let out = group_rows(&store, &batches, [0u32, 2].into_iter(), &req).unwrap();
        assert_eq!(out.group_count, 1);
        assert_eq!(out.groups[0].key, vec![Some("Oslo".to_string())]);
        assert_eq!(out.total_rows, 2);
    }
}
