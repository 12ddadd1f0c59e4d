use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use crate::batch::batch::{BatchBuilder, BatchStats, RowBatch, decode_batch, encode_batch};
use crate::batch::inference::ColumnInferenceBuilder;
use crate::batch::parser::{DelimitedParser, ParsedRecord, TextEncoding};
use crate::core::config::EngineConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{LoadProgress, LoadSummary};
use crate::core::types::{CellValue, ColumnInference, ColumnType, RowId};
use crate::store::layout::BATCHES_DIR;
use crate::store::object_store::ObjectStore;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub delimiter: u8,
    pub encoding: TextEncoding,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub checkpoint_interval: u32,
    pub batch_cache_size: usize,
}

impl LoadOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        LoadOptions {
            delimiter: b',',
            encoding: TextEncoding::Utf8,
            chunk_size: config.chunk_size,
            batch_size: config.batch_size,
            checkpoint_interval: config.checkpoint_interval,
            batch_cache_size: config.batch_cache_size,
        }
    }
}

/// Byte-offset checkpoint recorded during ingestion so later seeks can
/// start near a row instead of re-scanning from byte zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub row_index: u64,
    pub byte_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekResult {
    pub entries: Vec<CheckpointEntry>,
    pub checkpoint_interval: u32,
}

pub struct LoadCallbacks<'a> {
    pub on_progress: Option<&'a mut dyn FnMut(&LoadProgress)>,
    /// Invoked once per sealed batch, before it is persisted. The fuzzy
    /// index builder hooks in here.
    pub on_batch: Option<&'a mut dyn FnMut(&RowBatch, &[String])>,
}

impl Default for LoadCallbacks<'_> {
    fn default() -> Self {
        LoadCallbacks {
            on_progress: None,
            on_batch: None,
        }
    }
}

#[derive(Debug)]
struct BatchSlot {
    first_row_id: RowId,
    rows: u32,
    /// Populated when the durable store is unavailable and batches are
    /// retained in memory only.
    resident: Option<Arc<RowBatch>>,
}

/// Owner of all columnar batches for one dataset: writes them during
/// streaming ingestion, reads them back (through an LRU of decoded
/// batches) for query evaluation.
#[derive(Debug)]
pub struct RowBatchStore {
    dataset_key: String,
    header: Vec<String>,
    slots: Vec<BatchSlot>,
    cache: Mutex<LruCache<usize, Arc<RowBatch>>>,
    checkpoints: Vec<CheckpointEntry>,
    checkpoint_interval: u32,
    total_rows: u64,
    bytes_parsed: u64,
    persisted: bool,
    inference: Vec<ColumnInference>,
}

impl RowBatchStore {
    /// Stream `source` through the parser into columnar batches. The
    /// first record is the header. Batches go to the durable store when
    /// it is available, otherwise they stay resident. I/O failure while
    /// reading or writing aborts the whole load; the caller must not
    /// use partial state.
    pub fn load<R: Read>(
        store: &ObjectStore,
        dataset_key: &str,
        mut source: R,
        options: &LoadOptions,
        mut callbacks: LoadCallbacks<'_>,
    ) -> Result<(Self, LoadSummary)> {
        let started = Instant::now();
        let mut state = LoadState::new(store, dataset_key, options);

        loop {
            let mut buf = vec![0u8; options.chunk_size];
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            let chunk = Bytes::from(buf);
            for record in state.parser.feed(&chunk) {
                state.handle_record(record, &mut callbacks)?;
            }
            if let Some(on_progress) = callbacks.on_progress.as_mut() {
                on_progress(&LoadProgress {
                    rows_parsed: state.total_rows,
                    bytes_parsed: state.parser.bytes_consumed(),
                });
            }
        }

        if let Some(record) = state.parser.finish() {
            state.handle_record(record, &mut callbacks)?;
        }
        state.finish(&mut callbacks)?;

        let header = state
            .header
            .ok_or_else(|| Error::new(ErrorKind::Parse, "input has no header row"))?;
        let total_rows = state.total_rows;
        let bytes_parsed = state.parser.bytes_consumed();

        let inference: Vec<ColumnInference> = state.inference.iter().map(|b| b.finish()).collect();
        let summary = LoadSummary {
            rows_parsed: total_rows,
            bytes_parsed,
            duration_ms: started.elapsed().as_millis() as u64,
            column_types: inference
                .iter()
                .map(|i| (i.column.clone(), i.detected))
                .collect(),
            inference: inference.clone(),
        };

        if let Some(on_progress) = callbacks.on_progress.as_mut() {
            on_progress(&LoadProgress {
                rows_parsed: total_rows,
                bytes_parsed,
            });
        }

        Ok((
            RowBatchStore {
                dataset_key: dataset_key.to_string(),
                header,
                slots: state.slots,
                cache: Mutex::new(state.cache),
                checkpoints: state.checkpoints,
                checkpoint_interval: options.checkpoint_interval,
                total_rows,
                bytes_parsed,
                persisted: state.persisted,
                inference,
            },
            summary,
        ))
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn bytes_parsed(&self) -> u64 {
        self.bytes_parsed
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn inference(&self) -> &[ColumnInference] {
        &self.inference
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn column_type(&self, index: usize) -> ColumnType {
        self.inference
            .get(index)
            .map(|i| i.detected)
            .unwrap_or(ColumnType::Text)
    }

    pub fn batch_count(&self) -> usize {
        self.slots.len()
    }

    /// Decoded batch by index: resident, cached, or read back from the
    /// store and inserted into the LRU.
    pub fn batch(&self, store: &ObjectStore, index: usize) -> Result<Arc<RowBatch>> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, format!("batch {}", index)))?;
        if let Some(resident) = &slot.resident {
            return Ok(resident.clone());
        }
        if let Some(cached) = self.cache.lock().get(&index) {
            return Ok(cached.clone());
        }
        let data = store.read(BATCHES_DIR, &batch_file_name(&self.dataset_key, index))?;
        let batch = Arc::new(decode_batch(&data)?);
        self.cache.lock().put(index, batch.clone());
        Ok(batch)
    }

    pub fn locate(&self, row_id: RowId) -> Option<(usize, usize)> {
        let idx = self
            .slots
            .partition_point(|s| s.first_row_id + s.rows <= row_id)
            .min(self.slots.len().saturating_sub(1));
        let slot = self.slots.get(idx)?;
        if row_id < slot.first_row_id || row_id >= slot.first_row_id + slot.rows {
            return None;
        }
        Some((idx, (row_id - slot.first_row_id) as usize))
    }

    pub fn cell(&self, store: &ObjectStore, row_id: RowId, column: usize) -> Result<CellValue> {
        let Some((batch_idx, local)) = self.locate(row_id) else {
            return Ok(CellValue::Null);
        };
        Ok(self.batch(store, batch_idx)?.cell(local, column))
    }

    /// Checkpoint entries bracketing `[start_row, start_row + row_count)`.
    pub fn seek_rows(&self, start_row: u64, row_count: u64) -> Option<SeekResult> {
        if self.checkpoints.is_empty() {
            return None;
        }
        let end_row = start_row.saturating_add(row_count);
        let mut entries = Vec::new();

        let below = self
            .checkpoints
            .iter()
            .take_while(|c| c.row_index <= start_row)
            .last();
        if let Some(cp) = below {
            entries.push(*cp);
        }
        for cp in &self.checkpoints {
            if cp.row_index > start_row && cp.row_index < end_row {
                entries.push(*cp);
            }
        }
        if let Some(above) = self.checkpoints.iter().find(|c| c.row_index >= end_row) {
            entries.push(*above);
        }
        Some(SeekResult {
            entries,
            checkpoint_interval: self.checkpoint_interval,
        })
    }

    pub fn checkpoints(&self) -> &[CheckpointEntry] {
        &self.checkpoints
    }

    /// Remove this dataset's persisted batch files.
    pub fn discard_persisted(&self, store: &ObjectStore) -> Result<()> {
        if !self.persisted {
            return Ok(());
        }
        for index in 0..self.slots.len() {
            store.delete(BATCHES_DIR, &batch_file_name(&self.dataset_key, index))?;
        }
        Ok(())
    }
}

fn batch_file_name(dataset_key: &str, index: usize) -> String {
    format!("{}-{:05}.batch", dataset_key, index)
}

/// Mutable ingestion state threaded through one `load` call.
struct LoadState<'a> {
    store: &'a ObjectStore,
    dataset_key: &'a str,
    options: &'a LoadOptions,
    persisted: bool,
    parser: DelimitedParser,
    header: Option<Vec<String>>,
    inference: Vec<ColumnInferenceBuilder>,
    builder: Option<BatchBuilder>,
    slots: Vec<BatchSlot>,
    cache: LruCache<usize, Arc<RowBatch>>,
    checkpoints: Vec<CheckpointEntry>,
    total_rows: u64,
}

impl<'a> LoadState<'a> {
    fn new(store: &'a ObjectStore, dataset_key: &'a str, options: &'a LoadOptions) -> Self {
        LoadState {
            store,
            dataset_key,
            options,
            persisted: store.is_available(),
            parser: DelimitedParser::new(options.delimiter, options.encoding),
            header: None,
            inference: Vec::new(),
            builder: None,
            slots: Vec::new(),
            cache: LruCache::new(NonZeroUsize::new(options.batch_cache_size.max(1)).unwrap()),
            checkpoints: Vec::new(),
            total_rows: 0,
        }
    }

    fn handle_record(
        &mut self,
        record: ParsedRecord,
        callbacks: &mut LoadCallbacks<'_>,
    ) -> Result<()> {
        let Some(column_count) = self.header.as_ref().map(|h| h.len()) else {
            // First record is the header.
            let names: Vec<String> = record
                .fields
                .iter()
                .map(|f| String::from_utf8_lossy(f).trim().to_string())
                .collect();
            self.inference = names.iter().map(ColumnInferenceBuilder::new).collect();
            self.builder = Some(BatchBuilder::new(0, names.len()));
            self.header = Some(names);
            return Ok(());
        };

        if self.total_rows % self.options.checkpoint_interval as u64 == 0 {
            self.checkpoints.push(CheckpointEntry {
                row_index: self.total_rows,
                byte_offset: record.byte_offset,
            });
        }

        for (col, inf) in self.inference.iter_mut().enumerate() {
            let text = record
                .fields
                .get(col)
                .map(|f| String::from_utf8_lossy(f))
                .unwrap_or_default();
            inf.observe(&text);
        }

        let builder = self.builder.as_mut().expect("set with header");
        builder.push_row(record.fields);
        self.total_rows += 1;

        if self.builder.as_ref().expect("set with header").len() >= self.options.batch_size {
            let next_first = self.total_rows as RowId;
            let full = std::mem::replace(
                self.builder.as_mut().expect("set with header"),
                BatchBuilder::new(next_first, column_count),
            );
            self.seal(full, false, callbacks)?;
        }
        Ok(())
    }

    /// Seal the trailing partial batch, marking end-of-stream.
    fn finish(&mut self, callbacks: &mut LoadCallbacks<'_>) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            if !builder.is_empty() {
                self.seal(builder, true, callbacks)?;
            }
        }
        Ok(())
    }

    fn seal(
        &mut self,
        builder: BatchBuilder,
        end_of_file: bool,
        callbacks: &mut LoadCallbacks<'_>,
    ) -> Result<()> {
        let batch = builder.seal(BatchStats {
            rows_parsed: self.total_rows,
            bytes_parsed: self.parser.bytes_consumed(),
            end_of_file,
        });
        if let Some(on_batch) = callbacks.on_batch.as_mut() {
            on_batch(&batch, self.header.as_deref().unwrap_or_default());
        }

        let index = self.slots.len();
        let first_row_id = batch.first_row_id;
        let rows = batch.len() as u32;

        if self.persisted {
            let encoded = encode_batch(&batch)?;
            self.store.write_atomic(
                BATCHES_DIR,
                &batch_file_name(self.dataset_key, index),
                &encoded,
            )?;
            // Freshly written batches are the likeliest to be read next.
            self.cache.put(index, Arc::new(batch));
            self.slots.push(BatchSlot {
                first_row_id,
                rows,
                resident: None,
            });
        } else {
            self.slots.push(BatchSlot {
                first_row_id,
                rows,
                resident: Some(Arc::new(batch)),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn small_options() -> LoadOptions {
        LoadOptions {
            delimiter: b',',
            encoding: TextEncoding::Utf8,
            chunk_size: 7, // force records to span chunks
            batch_size: 2,
            checkpoint_interval: 2,
            batch_cache_size: 4,
        }
    }

    const CSV: &str = "name,age\nAlice,30\nBob,25\nCarol,30\nDave,41\nEve,25\n";

    #[test]
    fn load_splits_into_batches_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let (rbs, summary) = RowBatchStore::load(
            &store,
            "people",
            Cursor::new(CSV),
            &small_options(),
            LoadCallbacks::default(),
        )
        .unwrap();

        assert_eq!(summary.rows_parsed, 5);
        assert_eq!(rbs.total_rows(), 5);
        assert_eq!(rbs.header(), &["name", "age"]);
        assert_eq!(rbs.batch_count(), 3);
        assert_eq!(summary.column_types["age"], ColumnType::Number);

        // Checkpoints at rows 0, 2, 4.
        let cps: Vec<u64> = rbs.checkpoints().iter().map(|c| c.row_index).collect();
        assert_eq!(cps, vec![0, 2, 4]);

        // Cell access crosses batch boundaries and readback.
        assert_eq!(rbs.cell(&store, 0, 0).unwrap().display().unwrap(), "Alice");
        assert_eq!(rbs.cell(&store, 4, 1).unwrap(), CellValue::Number(25.0));
    }

    #[test]
    fn memory_fallback_when_store_unavailable() {
        let store = ObjectStore::unavailable();
        let (rbs, _) = RowBatchStore::load(
            &store,
            "people",
            Cursor::new(CSV),
            &small_options(),
            LoadCallbacks::default(),
        )
        .unwrap();
        assert!(!rbs.is_persisted());
        assert_eq!(rbs.cell(&store, 3, 0).unwrap().display().unwrap(), "Dave");
    }

    #[test]
    fn progress_and_batch_callbacks_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let mut progress_calls = 0u32;
        let mut batch_rows = 0u64;
        {
            let mut on_progress = |_p: &LoadProgress| progress_calls += 1;
            let mut on_batch = |b: &RowBatch, _h: &[String]| batch_rows += b.len() as u64;
            RowBatchStore::load(
                &store,
                "people",
                Cursor::new(CSV),
                &small_options(),
                LoadCallbacks {
                    on_progress: Some(&mut on_progress),
                    on_batch: Some(&mut on_batch),
                },
            )
            .unwrap();
        }
        assert!(progress_calls > 0);
        assert_eq!(batch_rows, 5);
    }

    #[test]
    fn seek_rows_brackets_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let (rbs, _) = RowBatchStore::load(
            &store,
            "people",
            Cursor::new(CSV),
            &small_options(),
            LoadCallbacks::default(),
        )
        .unwrap();

        let seek = rbs.seek_rows(1, 2).unwrap();
        assert_eq!(seek.checkpoint_interval, 2);
        let rows: Vec<u64> = seek.entries.iter().map(|e| e.row_index).collect();
        // Last checkpoint at-or-before row 1, one inside (1, 3), first at-or-after 3.
        assert_eq!(rows, vec![0, 2, 4]);
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        let store = ObjectStore::unavailable();
        let err = RowBatchStore::load(
            &store,
            "empty",
            Cursor::new(""),
            &small_options(),
            LoadCallbacks::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn discard_persisted_removes_batch_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path());
        let (rbs, _) = RowBatchStore::load(
            &store,
            "people",
            Cursor::new(CSV),
            &small_options(),
            LoadCallbacks::default(),
        )
        .unwrap();
        assert!(!store.list(BATCHES_DIR).unwrap().is_empty());
        rbs.discard_persisted(&store).unwrap();
        assert!(store.list(BATCHES_DIR).unwrap().is_empty());
    }
}
