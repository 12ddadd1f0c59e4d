use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::batch::batch::RowBatch;
use crate::batch::store::{LoadCallbacks, LoadOptions, RowBatchStore, SeekResult};
use crate::core::config::EngineConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{EngineStats, LoadProgress, LoadSummary};
use crate::core::types::{Fingerprint, RowId};
use crate::engine::dataset::Dataset;
use crate::engine::requests::{
    FilterRequest, FilterResponse, GlobalSearchRequest, GlobalSearchResponse, ImportTagsRequest,
    LoadFileOptions, RowView, SortRequest, SortResponse, TagRowsRequest, UpdateLabelRequest,
};
use crate::fuzzy::index::FuzzyIndex;
use crate::fuzzy::{matcher, snapshot as fuzzy_snapshot};
use crate::query::ast::GroupRequest;
use crate::query::evaluator::FilterEvaluator;
use crate::query::group::{GroupOutcome, group_rows};
use crate::query::sorter::{ProgressiveSorter, extract_keys, order_by_keys};
use crate::store::layout::{BATCHES_DIR, INDEX_DIR, TAGS_DIR, sanitize_file_name};
use crate::store::object_store::{ObjectStore, StoreEntry};
use crate::store::quota;
use crate::tags::controller::{LabelDefinition, TagController, TagState};
use crate::tags::snapshot as tag_snapshot;

fn fuzzy_file_name(file_name: &str) -> String {
    format!("{}.fuzzy.json", sanitize_file_name(file_name))
}

/// Lifecycle coordinator owning the dataset, tagging and fuzzy-index
/// slices, serving the request surface the host calls into. One engine
/// per session; one dataset live at a time.
pub struct Engine {
    config: EngineConfig,
    store: ObjectStore,
    dataset: Option<Dataset>,
    tags: TagController,
    sorter: ProgressiveSorter,
    filter_generation: u64,
    accepted_filter_generation: u64,
    sort_generation: u64,
    accepted_sort_generation: u64,
    start_time: Instant,
    filter_requests: u64,
    sort_requests: u64,
}

impl Engine {
    pub fn open(store_root: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self::with_store(ObjectStore::open(store_root), config)
    }

    /// Engine with no durable store; everything stays in memory.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_store(ObjectStore::unavailable(), config)
    }

    pub fn with_store(store: ObjectStore, config: EngineConfig) -> Self {
        let tags = TagController::new(config.tag_flush_debounce);
        Engine {
            config,
            store,
            dataset: None,
            tags,
            sorter: ProgressiveSorter::new(),
            filter_generation: 0,
            accepted_filter_generation: 0,
            sort_generation: 0,
            accepted_sort_generation: 0,
            start_time: Instant::now(),
            filter_requests: 0,
            sort_requests: 0,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    fn require_dataset(&self) -> Result<&Dataset> {
        self.dataset
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "no dataset loaded"))
    }

    // ---- lifecycle ----------------------------------------------------

    /// Atomically replace any prior dataset: flush dirty tags
    /// best-effort, drop dataset state, clear the tag controller (and
    /// its debounce deadline), and invalidate in-flight sort work.
    pub fn prepare_dataset_for_load(&mut self) {
        if self.tags.is_dirty() {
            let _ = self.persist_tags();
        }
        self.dataset = None;
        self.tags.reset();
        // Drain stale completions; their generations can never match a
        // future request.
        while self.sorter.try_complete().is_some() {}
        self.sort_generation += 1;
        self.accepted_sort_generation = self.sort_generation;
        self.filter_generation += 1;
        self.accepted_filter_generation = self.filter_generation;
    }

    /// Full reset, exposed to the host.
    pub fn reset_dataset(&mut self) {
        self.prepare_dataset_for_load();
    }

    /// Stream a file into the engine. On failure no partial dataset
    /// remains. When a persisted fuzzy snapshot matches the
    /// fingerprint it is reattached instead of rebuilt, and prior tag
    /// state for the same fingerprint is rehydrated.
    pub fn load_file<R: Read>(
        &mut self,
        source: R,
        fingerprint: Fingerprint,
        options: LoadFileOptions,
        on_progress: Option<&mut dyn FnMut(&LoadProgress)>,
    ) -> Result<LoadSummary> {
        self.prepare_dataset_for_load();

        let dataset_key = format!(
            "{}-{}",
            sanitize_file_name(&fingerprint.file_name),
            fingerprint.cache_key()
        );

        let mut load_options = LoadOptions::from_config(&self.config);
        if let Some(delimiter) = options.delimiter {
            load_options.delimiter = delimiter;
        }
        if let Some(encoding) = options.encoding {
            load_options.encoding = encoding;
        }
        if let Some(batch_size) = options.batch_size {
            load_options.batch_size = batch_size;
        }
        if let Some(interval) = options.checkpoint_interval {
            load_options.checkpoint_interval = interval;
        }

        let hydrated = self.read_fuzzy_snapshot(&fingerprint);
        let build_fresh = hydrated.is_none();
        let token_limit = self.config.token_limit;
        let fp = fingerprint.clone();
        let mut building: Option<FuzzyIndex> = None;

        let mut on_progress = on_progress;
        let (batches, summary) = {
            let mut on_progress = |progress: &LoadProgress| {
                if let Some(cb) = on_progress.as_deref_mut() {
                    cb(progress);
                }
            };
            let mut on_batch = |batch: &RowBatch, header: &[String]| {
                if build_fresh {
                    building
                        .get_or_insert_with(|| FuzzyIndex::new(fp.clone(), header, token_limit))
                        .observe_batch(batch);
                }
            };
            RowBatchStore::load(
                &self.store,
                &dataset_key,
                source,
                &load_options,
                LoadCallbacks {
                    on_progress: Some(&mut on_progress),
                    on_batch: Some(&mut on_batch),
                },
            )?
        };

        let mut dataset = Dataset::new(fingerprint.clone(), dataset_key, batches);
        dataset.fuzzy = hydrated.or(building);
        self.dataset = Some(dataset);

        self.tags.attach(fingerprint.clone());
        if let Some(state) = self.read_tag_snapshot(&fingerprint) {
            self.tags.hydrate(state);
        }

        if build_fresh {
            // Snapshot the fresh index; an unavailable store is fine.
            let _ = self.persist_fuzzy_snapshot();
        }

        Ok(summary)
    }

    // ---- row access ---------------------------------------------------

    pub fn seek_rows(&self, start_row: u64, row_count: u64) -> Result<Option<SeekResult>> {
        Ok(self.require_dataset()?.batches.seek_rows(start_row, row_count))
    }

    pub fn fetch_rows(&self, offset: u64, limit: u64) -> Result<Vec<RowView>> {
        let ds = self.require_dataset()?;
        let window = ds.view_window(offset, limit);
        self.materialize_rows(ds, &window)
    }

    pub fn fetch_rows_by_ids(&self, row_ids: &[RowId]) -> Result<Vec<RowView>> {
        let ds = self.require_dataset()?;
        self.materialize_rows(ds, row_ids)
    }

    fn materialize_rows(&self, ds: &Dataset, row_ids: &[RowId]) -> Result<Vec<RowView>> {
        let columns = ds.batches.header().len();
        let mut rows = Vec::with_capacity(row_ids.len());
        for &row_id in row_ids {
            let mut cells = Vec::with_capacity(columns);
            for col in 0..columns {
                cells.push(ds.batches.cell(&self.store, row_id, col)?.display());
            }
            rows.push(RowView { row_id, cells });
        }
        Ok(rows)
    }

    // ---- filtering ----------------------------------------------------

    /// Reserve a generation for a filter request issued now. Results
    /// from an older generation never overwrite a newer accepted one.
    pub fn next_filter_generation(&mut self) -> u64 {
        self.filter_generation += 1;
        self.filter_generation
    }

    pub fn apply_filter(&mut self, request: &FilterRequest) -> Result<FilterResponse> {
        let generation = self.next_filter_generation();
        self.apply_filter_at(generation, request)
    }

    /// Evaluate at an explicit generation. The response always reflects
    /// this evaluation; dataset state only moves forward.
    pub fn apply_filter_at(
        &mut self,
        generation: u64,
        request: &FilterRequest,
    ) -> Result<FilterResponse> {
        let outcome = {
            let ds = self.require_dataset()?;
            FilterEvaluator {
                store: &self.store,
                batches: &ds.batches,
                tags: &self.tags,
                fuzzy: ds.fuzzy.as_ref(),
                max_suggestions: self.config.max_suggestions,
            }
            .evaluate(&request.expression)?
        };
        self.filter_requests += 1;

        if generation > self.accepted_filter_generation {
            self.accepted_filter_generation = generation;
            let ds = self.dataset.as_mut().expect("checked above");
            ds.filter_row_ids = Some(outcome.row_ids.clone());
            ds.filter_expr = Some(request.expression.clone());
            // The previous ordering covered a different row set.
            ds.sorted_row_ids = None;
            ds.sort_complete = true;
        }

        let offset = request.offset.unwrap_or(0);
        let limit = request.limit.unwrap_or(100);
        let window: Vec<RowId> = outcome
            .row_ids
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        let ds = self.require_dataset()?;
        let rows = self.materialize_rows(ds, &window)?;

        Ok(FilterResponse {
            rows,
            total_rows: outcome.total_rows,
            matched_rows: outcome.matched_rows,
            expression: request.expression.clone(),
            fuzzy_used: outcome.fuzzy_used,
            fuzzy_suggestions: outcome.fuzzy_suggestions,
            predicate_match_counts: outcome.leaf_match_counts,
        })
    }

    /// Drop the active filter; the view returns to all rows. Any
    /// ordering is invalidated with it.
    pub fn clear_filter(&mut self) -> Result<()> {
        let ds = self
            .dataset
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "no dataset loaded"))?;
        ds.filter_row_ids = None;
        ds.filter_expr = None;
        ds.sorted_row_ids = None;
        ds.sort_complete = true;
        Ok(())
    }

    // ---- sorting ------------------------------------------------------

    pub fn next_sort_generation(&mut self) -> u64 {
        self.sort_generation += 1;
        self.sort_generation
    }

    pub fn apply_sorts(&mut self, request: &SortRequest) -> Result<SortResponse> {
        let generation = self.next_sort_generation();
        self.apply_sorts_at(generation, request)
    }

    pub fn apply_sorts_at(
        &mut self,
        generation: u64,
        request: &SortRequest,
    ) -> Result<SortResponse> {
        self.sort_requests += 1;
        let (ordering, sort_complete, sorted_row_count) = {
            let ds = self.require_dataset()?;
            let row_ids = ds.filtered_rows();
            let progressive = request
                .progressive
                .unwrap_or(row_ids.len() as u64 > self.config.progressive_sort_threshold);

            if !progressive {
                let key_values =
                    extract_keys(&self.store, &ds.batches, &row_ids, &request.sorts)?;
                let parallel = row_ids.len() > 10_000 && num_cpus::get() > 1;
                let ordering = order_by_keys(&row_ids, &key_values, &request.sorts, parallel);
                let count = ordering.len() as u64;
                (ordering, true, count)
            } else {
                // Fast pass over the visible window only; the full
                // ordering lands later via the background worker.
                let visible: Vec<RowId> = match &request.visible_rows {
                    Some(rows) => rows.clone(),
                    None => row_ids.iter().take(200).copied().collect(),
                };
                let visible_keys =
                    extract_keys(&self.store, &ds.batches, &visible, &request.sorts)?;
                let visible_order =
                    order_by_keys(&visible, &visible_keys, &request.sorts, false);

                let full_keys = extract_keys(&self.store, &ds.batches, &row_ids, &request.sorts)?;
                self.sorter
                    .spawn_full(generation, row_ids.clone(), full_keys, request.sorts.clone());

                // Partial view: ordered visible rows first, the rest in
                // insertion order.
                let in_visible: std::collections::HashSet<RowId> =
                    visible_order.iter().copied().collect();
                let mut partial = visible_order.clone();
                partial.extend(row_ids.iter().filter(|r| !in_visible.contains(r)));
                let count = visible_order.len() as u64;
                (partial, false, count)
            }
        };

        if generation > self.accepted_sort_generation {
            self.accepted_sort_generation = generation;
            let ds = self.dataset.as_mut().expect("checked above");
            ds.sorted_row_ids = Some(ordering.clone());
            ds.sorts = request.sorts.clone();
            ds.sort_complete = sort_complete;
        }

        let offset = request.offset.unwrap_or(0) as usize;
        let limit = request.limit.unwrap_or(100) as usize;
        let window: Vec<RowId> = ordering.iter().skip(offset).take(limit).copied().collect();
        let ds = self.require_dataset()?;
        let rows = self.materialize_rows(ds, &window)?;

        Ok(SortResponse {
            rows,
            total_rows: ds.batches.total_rows(),
            matched_rows: ds.matched_rows(),
            sorts: request.sorts.clone(),
            sort_complete,
            sorted_row_count,
        })
    }

    /// Apply any finished background sort whose generation is still
    /// current; stale completions are discarded silently.
    pub fn poll_sort_completion(&mut self) -> bool {
        let mut updated = false;
        while let Some(done) = self.sorter.try_complete() {
            if done.generation == self.sort_generation {
                if let Some(ds) = self.dataset.as_mut() {
                    ds.sorted_row_ids = Some(done.ordering);
                    ds.sort_complete = true;
                    self.accepted_sort_generation = done.generation;
                    updated = true;
                }
            }
        }
        updated
    }

    /// Block until the current background sort lands or the timeout
    /// expires. Intended for hosts that want a synchronous follow-up.
    pub fn wait_for_sort(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_sort_completion() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.sorter.wait_complete(deadline - now) {
                Some(done) => {
                    if done.generation == self.sort_generation {
                        if let Some(ds) = self.dataset.as_mut() {
                            ds.sorted_row_ids = Some(done.ordering);
                            ds.sort_complete = true;
                            self.accepted_sort_generation = done.generation;
                            return true;
                        }
                    }
                }
                None => return false,
            }
        }
    }

    // ---- grouping and search ------------------------------------------

    pub fn group_by(&self, request: &GroupRequest) -> Result<GroupOutcome> {
        let ds = self.require_dataset()?;
        if request.use_filter {
            group_rows(
                &self.store,
                &ds.batches,
                ds.filtered_rows().into_iter(),
                request,
            )
        } else {
            group_rows(
                &self.store,
                &ds.batches,
                0..ds.batches.total_rows() as RowId,
                request,
            )
        }
    }

    /// Case-insensitive substring scan across every column, with
    /// per-column fuzzy suggestions when nothing matches.
    pub fn global_search(&self, request: &GlobalSearchRequest) -> Result<GlobalSearchResponse> {
        let ds = self.require_dataset()?;
        let query = request.query.trim();
        if query.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "empty search query"));
        }
        let needle = query.to_lowercase();
        let columns = ds.batches.header().len();

        let mut matched = RoaringBitmap::new();
        for index in 0..ds.batches.batch_count() {
            let batch = ds.batches.batch(&self.store, index)?;
            for local in 0..batch.len() {
                for col in 0..columns {
                    if let Some(text) = batch.cell(local, col).display() {
                        if text.to_lowercase().contains(&needle) {
                            matched.insert(batch.row_ids[local]);
                            break;
                        }
                    }
                }
            }
        }

        let limit = request.limit.unwrap_or(100);
        let window: Vec<RowId> = matched.iter().take(limit).collect();
        let rows = self.materialize_rows(ds, &window)?;

        let mut suggestions = HashMap::new();
        if matched.is_empty() {
            if let Some(fuzzy) = &ds.fuzzy {
                let distance = request.max_distance.unwrap_or(2);
                for column in &fuzzy.columns {
                    let lookup = matcher::lookup(
                        column,
                        query,
                        distance,
                        self.config.max_suggestions,
                    );
                    if !lookup.suggestions.is_empty() {
                        suggestions.insert(column.key.clone(), lookup.suggestions);
                    }
                }
            }
        }

        Ok(GlobalSearchResponse {
            matched_rows: matched.len(),
            rows,
            suggestions,
        })
    }

    // ---- tagging ------------------------------------------------------

    pub fn load_tags(&self) -> TagState {
        self.tags.snapshot_state()
    }

    pub fn tag_rows(&mut self, request: &TagRowsRequest) -> Result<()> {
        self.tags.tag_rows(
            &request.row_ids,
            &request.label_ids,
            request.note.as_deref(),
            request.mode,
        )?;
        self.flush_tags_if_due();
        Ok(())
    }

    pub fn clear_tag(&mut self, row_ids: &[RowId]) {
        self.tags.clear_tag(row_ids);
        self.flush_tags_if_due();
    }

    pub fn update_label(&mut self, request: UpdateLabelRequest) -> LabelDefinition {
        let label = self.tags.update_label(
            request.id,
            request.name,
            request.color,
            request.description,
        );
        self.flush_tags_if_due();
        label
    }

    pub fn delete_label(&mut self, label_id: &str) -> Vec<RowId> {
        let affected = self.tags.delete_label(label_id);
        self.flush_tags_if_due();
        affected
    }

    pub fn export_tags(&self) -> TagState {
        self.tags.export()
    }

    pub fn import_tags(&mut self, request: ImportTagsRequest) {
        self.tags.import(request.snapshot, request.merge_strategy);
        self.flush_tags_if_due();
    }

    /// Explicit flush. A store failure leaves the in-memory state
    /// intact and dirty, so the next debounce tick retries.
    pub fn persist_tags(&mut self) -> Result<()> {
        let Some(fingerprint) = self.tags.fingerprint().cloned() else {
            return Ok(());
        };
        let data = tag_snapshot::encode(&fingerprint, self.tags.snapshot_state())?;
        self.store
            .write_atomic(TAGS_DIR, &tag_snapshot::file_name(&fingerprint), &data)?;
        self.tags.mark_clean();
        Ok(())
    }

    fn flush_tags_if_due(&mut self) {
        if self.tags.flush_due(Instant::now()) {
            // Failures are retryable warnings; dirty state is retained.
            let _ = self.persist_tags();
        }
    }

    fn read_tag_snapshot(&self, fingerprint: &Fingerprint) -> Option<TagState> {
        let data = self
            .store
            .read(TAGS_DIR, &tag_snapshot::file_name(fingerprint))
            .ok()?;
        tag_snapshot::decode(&data, fingerprint)
    }

    // ---- fuzzy snapshots ----------------------------------------------

    pub fn fuzzy_index(&self) -> Option<&FuzzyIndex> {
        self.dataset.as_ref().and_then(|d| d.fuzzy.as_ref())
    }

    /// Serialized snapshot of the current index, if one exists.
    pub fn get_fuzzy_snapshot(&self) -> Result<Option<Vec<u8>>> {
        match self.fuzzy_index() {
            Some(index) => Ok(Some(fuzzy_snapshot::encode(index)?)),
            None => Ok(None),
        }
    }

    /// Write the current index to the store. Returns false when there
    /// is nothing to persist.
    pub fn persist_fuzzy_snapshot(&mut self) -> Result<bool> {
        let Some(index) = self.fuzzy_index() else {
            return Ok(false);
        };
        let data = fuzzy_snapshot::encode(index)?;
        let name = fuzzy_file_name(&index.fingerprint.file_name);
        self.store.write_atomic(INDEX_DIR, &name, &data)?;
        Ok(true)
    }

    pub fn clear_fuzzy_snapshot(&mut self) -> Result<()> {
        let Some(ds) = self.dataset.as_ref() else {
            return Ok(());
        };
        match self
            .store
            .delete(INDEX_DIR, &fuzzy_file_name(&ds.fingerprint.file_name))
        {
            Err(e) if e.is_store_unavailable() => Ok(()),
            other => other,
        }
    }

    fn read_fuzzy_snapshot(&self, fingerprint: &Fingerprint) -> Option<FuzzyIndex> {
        let data = self
            .store
            .read(INDEX_DIR, &fuzzy_file_name(&fingerprint.file_name))
            .ok()?;
        let index = fuzzy_snapshot::decode(&data)?;
        // A snapshot is valid only while the file identity matches.
        (&index.fingerprint == fingerprint).then_some(index)
    }

    // ---- quota and stats ----------------------------------------------

    /// Evict cache files oldest-first until usage fits the configured
    /// budget, never touching the active dataset's files.
    pub fn enforce_store_budget(&self) -> Result<Vec<(String, String)>> {
        let batch_prefix = self.dataset.as_ref().map(|d| d.dataset_key.clone());
        let index_name = self
            .dataset
            .as_ref()
            .map(|d| fuzzy_file_name(&d.fingerprint.file_name));
        let tags_name = self.tags.fingerprint().map(tag_snapshot::file_name);

        let preserve = move |entry: &StoreEntry| -> bool {
            match entry.directory.as_str() {
                BATCHES_DIR => batch_prefix
                    .as_deref()
                    .is_some_and(|p| entry.name.starts_with(p)),
                INDEX_DIR => index_name.as_deref() == Some(entry.name.as_str()),
                TAGS_DIR => tags_name.as_deref() == Some(entry.name.as_str()),
                _ => false,
            }
        };
        quota::enforce_budget(&self.store, self.config.max_store_bytes, &preserve)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            total_rows: self
                .dataset
                .as_ref()
                .map(|d| d.batches.total_rows())
                .unwrap_or(0),
            bytes_parsed: self
                .dataset
                .as_ref()
                .map(|d| d.batches.bytes_parsed())
                .unwrap_or(0),
            store_available: self.store.is_available(),
            store_usage_bytes: self.store.usage(),
            filter_requests: self.filter_requests,
            sort_requests: self.sort_requests,
        }
    }
}
