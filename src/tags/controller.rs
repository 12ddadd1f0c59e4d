use chrono::{DateTime, Utc};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Fingerprint, RowId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-row annotation. A record with no labels and no note is
/// equivalent to "untagged" and is compacted out of the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    Replace,
    Append,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Merge,
    Replace,
}

/// Full catalog + tag map, the unit of export/import and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagState {
    pub labels: Vec<LabelDefinition>,
    pub tags: HashMap<RowId, TagRecord>,
}

const LABEL_PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#e5c07b", "#c678dd", "#56b6c2", "#d19a66", "#abb2bf",
];

/// Authoritative in-memory label catalog and per-row annotation map,
/// scoped to the active dataset's fingerprint. Persistence is debounced;
/// the debounce deadline is an owned resource cleared on reset.
pub struct TagController {
    fingerprint: Option<Fingerprint>,
    labels: Vec<LabelDefinition>,
    tags: HashMap<RowId, TagRecord>,
    dirty: bool,
    dirty_since: Option<Instant>,
    debounce: Duration,
}

impl TagController {
    pub fn new(debounce: Duration) -> Self {
        TagController {
            fingerprint: None,
            labels: Vec::new(),
            tags: HashMap::new(),
            dirty: false,
            dirty_since: None,
            debounce,
        }
    }

    /// Drop all state, including the pending debounce deadline.
    pub fn reset(&mut self) {
        self.fingerprint = None;
        self.labels.clear();
        self.tags.clear();
        self.dirty = false;
        self.dirty_since = None;
    }

    /// Scope the controller to a freshly loaded dataset.
    pub fn attach(&mut self, fingerprint: Fingerprint) {
        self.reset();
        self.fingerprint = Some(fingerprint);
    }

    /// Restore state from a persisted snapshot for the same fingerprint.
    pub fn hydrate(&mut self, state: TagState) {
        self.labels = state.labels;
        self.tags = state.tags;
        self.dirty = false;
        self.dirty_since = None;
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn labels(&self) -> &[LabelDefinition] {
        &self.labels
    }

    pub fn tags(&self) -> &HashMap<RowId, TagRecord> {
        &self.tags
    }

    pub fn tag(&self, row_id: RowId) -> Option<&TagRecord> {
        self.tags.get(&row_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        if self.dirty_since.is_none() {
            self.dirty_since = Some(Instant::now());
        }
    }

    /// True once dirty state has sat past the debounce window.
    pub fn flush_due(&self, now: Instant) -> bool {
        match (self.dirty, self.dirty_since) {
            (true, Some(since)) => now.duration_since(since) >= self.debounce,
            _ => false,
        }
    }

    /// Called after a successful persist.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
        self.dirty_since = None;
    }

    pub fn snapshot_state(&self) -> TagState {
        TagState {
            labels: self.labels.clone(),
            tags: self.tags.clone(),
        }
    }

    fn require_known_labels(&self, label_ids: &[String]) -> Result<()> {
        for id in label_ids {
            if !self.labels.iter().any(|l| &l.id == id) {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("unknown label id {}", id),
                ));
            }
        }
        Ok(())
    }

    /// Apply labels/note to a set of rows. Idempotent: re-applying an
    /// identical request leaves the tag map unchanged (timestamps
    /// included, since untouched records are not rewritten).
    pub fn tag_rows(
        &mut self,
        row_ids: &[RowId],
        label_ids: &[String],
        note: Option<&str>,
        mode: TagMode,
    ) -> Result<()> {
        self.require_known_labels(label_ids)?;
        let incoming: BTreeSet<&String> = label_ids.iter().collect();

        for &row_id in row_ids {
            let existing = self.tags.get(&row_id);
            let current: BTreeSet<&String> = existing
                .map(|r| r.label_ids.iter().collect())
                .unwrap_or_default();

            let merged: BTreeSet<&String> = match mode {
                TagMode::Replace => incoming.clone(),
                TagMode::Append => current.union(&incoming).copied().collect(),
                TagMode::Remove => current.difference(&incoming).copied().collect(),
            };

            let new_note = match mode {
                // Replace keeps the prior note when none is supplied.
                TagMode::Replace => note
                    .map(|n| n.to_string())
                    .or_else(|| existing.and_then(|r| r.note.clone())),
                _ => existing.and_then(|r| r.note.clone()),
            };

            let new_labels: Vec<String> = merged.into_iter().cloned().collect();
            let unchanged = existing
                .map(|r| {
                    let mut sorted = r.label_ids.clone();
                    sorted.sort();
                    sorted == new_labels && r.note == new_note
                })
                .unwrap_or(new_labels.is_empty() && new_note.is_none());
            if unchanged {
                continue;
            }

            if new_labels.is_empty() && new_note.is_none() {
                self.tags.remove(&row_id);
            } else {
                self.tags.insert(
                    row_id,
                    TagRecord {
                        label_ids: new_labels,
                        note: new_note,
                        updated_at: Utc::now(),
                    },
                );
            }
        }

        self.mark_dirty();
        Ok(())
    }

    /// Empty labels and note for each row (tombstone, then compaction).
    pub fn clear_tag(&mut self, row_ids: &[RowId]) {
        for row_id in row_ids {
            self.tags.remove(row_id);
        }
        self.mark_dirty();
    }

    /// Upsert a label by id. Generates an id and a palette color when
    /// absent. Returns the stored definition.
    pub fn update_label(
        &mut self,
        id: Option<String>,
        name: String,
        color: Option<String>,
        description: Option<String>,
    ) -> LabelDefinition {
        let now = Utc::now();
        if let Some(id) = id {
            if let Some(pos) = self.labels.iter().position(|l| l.id == id) {
                let changed = {
                    let existing = &self.labels[pos];
                    existing.name != name
                        || color.as_ref().is_some_and(|c| c != &existing.color)
                        || description != existing.description
                };
                if changed {
                    let existing = &mut self.labels[pos];
                    existing.name = name;
                    if let Some(color) = color {
                        existing.color = color;
                    }
                    existing.description = description;
                    existing.updated_at = now;
                    self.mark_dirty();
                }
                return self.labels[pos].clone();
            }
            let label = LabelDefinition {
                id,
                name,
                color: color.unwrap_or_else(|| self.next_color()),
                description,
                created_at: now,
                updated_at: now,
            };
            self.labels.push(label.clone());
            self.mark_dirty();
            return label;
        }

        let label = LabelDefinition {
            id: Uuid::new_v4().to_string(),
            name,
            color: color.unwrap_or_else(|| self.next_color()),
            description,
            created_at: now,
            updated_at: now,
        };
        self.labels.push(label.clone());
        self.mark_dirty();
        label
    }

    fn next_color(&self) -> String {
        LABEL_PALETTE[self.labels.len() % LABEL_PALETTE.len()].to_string()
    }

    /// Remove a label from the catalog and cascade removal from every
    /// row. Returns the affected row ids.
    pub fn delete_label(&mut self, label_id: &str) -> Vec<RowId> {
        let before = self.labels.len();
        self.labels.retain(|l| l.id != label_id);

        let mut affected = Vec::new();
        self.tags.retain(|&row_id, record| {
            if let Some(pos) = record.label_ids.iter().position(|id| id == label_id) {
                record.label_ids.remove(pos);
                record.updated_at = Utc::now();
                affected.push(row_id);
                // Compact tombstones as they appear.
                !(record.label_ids.is_empty() && record.note.is_none())
            } else {
                true
            }
        });

        if before != self.labels.len() || !affected.is_empty() {
            self.mark_dirty();
        }
        affected.sort_unstable();
        affected
    }

    pub fn export(&self) -> TagState {
        self.snapshot_state()
    }

    /// Bring in an external catalog + tag map. `Replace` discards prior
    /// state; `Merge` reconciles labels by id, generating fresh ids for
    /// conflicting definitions and remapping their rows.
    pub fn import(&mut self, state: TagState, strategy: MergeStrategy) {
        match strategy {
            MergeStrategy::Replace => {
                self.labels = state.labels;
                self.tags = state.tags;
            }
            MergeStrategy::Merge => {
                let mut remap: HashMap<String, String> = HashMap::new();
                for mut label in state.labels {
                    match self.labels.iter().find(|l| l.id == label.id) {
                        Some(existing) if existing.name == label.name => {}
                        Some(_) => {
                            let fresh = Uuid::new_v4().to_string();
                            remap.insert(label.id.clone(), fresh.clone());
                            label.id = fresh;
                            self.labels.push(label);
                        }
                        None => self.labels.push(label),
                    }
                }
                for (row_id, mut record) in state.tags {
                    for id in record.label_ids.iter_mut() {
                        if let Some(fresh) = remap.get(id) {
                            *id = fresh.clone();
                        }
                    }
                    match self.tags.get_mut(&row_id) {
                        Some(existing) => {
                            let mut merged: BTreeSet<String> =
                                existing.label_ids.iter().cloned().collect();
                            merged.extend(record.label_ids);
                            existing.label_ids = merged.into_iter().collect();
                            if record.note.is_some() {
                                existing.note = record.note;
                            }
                            existing.updated_at = Utc::now();
                        }
                        None => {
                            self.tags.insert(row_id, record);
                        }
                    }
                }
            }
        }
        self.mark_dirty();
    }

    /// Rows whose label set contains `label_id`.
    pub fn rows_with_label(&self, label_id: &str) -> RoaringBitmap {
        let mut bitmap = RoaringBitmap::new();
        for (&row_id, record) in &self.tags {
            if record.label_ids.iter().any(|id| id == label_id) {
                bitmap.insert(row_id);
            }
        }
        bitmap
    }

    /// Rows with at least one label.
    pub fn rows_with_any_label(&self) -> RoaringBitmap {
        let mut bitmap = RoaringBitmap::new();
        for (&row_id, record) in &self.tags {
            if !record.label_ids.is_empty() {
                bitmap.insert(row_id);
            }
        }
        bitmap
    }
}
