pub mod core;
pub mod store;
pub mod batch;
pub mod fuzzy;
pub mod query;
pub mod tags;
pub mod engine;

pub use crate::engine::controller::Engine;

/*
┌──────────────────────────────────────────────────────────────────────────────┐
│                          GRIDSIFT STRUCT ARCHITECTURE                        │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── ENGINE LAYER ────────────────────────────────┐
│                                                                              │
│  ┌────────────────────────────────────────────────────────────────────┐     │
│  │                           struct Engine                            │     │
│  │  ┌──────────────────────────────────────────────────────────────┐ │     │
│  │  │ config: EngineConfig          // Knobs (chunk, batch, budget)│ │     │
│  │  │ store: ObjectStore            // Durable file tree           │ │     │
│  │  │ dataset: Option<Dataset>      // One live dataset            │ │     │
│  │  │ tags: TagController           // Labels + row annotations    │ │     │
│  │  │ sorter: ProgressiveSorter     // Background ordering worker  │ │     │
│  │  │ filter/sort generations       // Staleness gating            │ │     │
│  │  └──────────────────────────────────────────────────────────────┘ │     │
│  └────────────────────────────────────────────────────────────────────┘     │
│                                                                              │
│  ┌──────────────────────┐   ┌───────────────────────────────────────┐       │
│  │ struct Dataset       │   │ requests: RowView, FilterRequest/     │       │
│  │ • fingerprint        │   │ Response, SortRequest/Response,       │       │
│  │ • batches: RowBatch  │   │ GlobalSearch*, TagRows*, ImportTags*  │       │
│  │   Store              │   └───────────────────────────────────────┘       │
│  │ • fuzzy: FuzzyIndex  │                                                   │
│  │ • filter_row_ids     │                                                   │
│  │ • sorted_row_ids     │                                                   │
│  └──────────────────────┘                                                   │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── BATCH LAYER ─────────────────────────────────┐
│                                                                              │
│  ┌──────────────────────┐   ┌──────────────────────┐   ┌─────────────────┐  │
│  │ DelimitedParser      │   │ struct RowBatch      │   │ RowBatchStore   │  │
│  │ • chunked, quote-    │   │ • row_ids: Vec<u32>  │   │ • load()        │  │
│  │   aware, zero-copy   │   │ • columns: typed     │   │ • checkpoints   │  │
│  │ • byte offsets       │   │   buffers + nulls    │   │ • LRU readback  │  │
│  └──────────────────────┘   └──────────────────────┘   └─────────────────┘  │
│                                                                              │
│  ┌──────────────────────┐   batch file: magic + bincode header +            │
│  │ ColumnInference      │   lz4 frame body + crc32                          │
│  │ Builder (type guess, │                                                   │
│  │ confidence, min/max) │                                                   │
│  └──────────────────────┘                                                   │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── QUERY LAYER ─────────────────────────────────┐
│                                                                              │
│  ┌──────────────────────┐   ┌──────────────────────┐   ┌─────────────────┐  │
│  │ enum FilterExpr      │   │ FilterEvaluator      │   │ sorter          │  │
│  │ • And / Or / Leaf    │   │ • per-leaf bitmaps   │   │ • extract_keys  │  │
│  │ • 9 operators        │   │ • label pseudo-col   │   │ • order_by_keys │  │
│  │ • label pseudo-col   │   │ • fuzzy fallback     │   │ • Progressive   │  │
│  └──────────────────────┘   └──────────────────────┘   │   Sorter (gen)  │  │
│                                                        └─────────────────┘  │
│  ┌──────────────────────┐                                                   │
│  │ group_rows           │                                                   │
│  │ • composite keys     │                                                   │
│  │ • count/sum/min/     │                                                   │
│  │   max/avg            │                                                   │
│  └──────────────────────┘                                                   │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── FUZZY LAYER ─────────────────────────────────┐
│                                                                              │
│  ┌──────────────────────┐   ┌──────────────────────┐   ┌─────────────────┐  │
│  │ ValueTokenizer       │   │ ColumnIndex          │   │ matcher         │  │
│  │ • unicode words,     │   │ • token table (50k)  │   │ • trigram union │  │
│  │   lowercase          │   │ • trigram inverted   │   │ • Levenshtein   │  │
│  └──────────────────────┘   │   map                │   │   DFA + DP      │  │
│                             └──────────────────────┘   │ • suggestions   │  │
│  snapshot: versioned JSON envelope, fingerprint-keyed, └─────────────────┘  │
│  clamping decoder that never throws                                         │
└──────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────── STORAGE LAYER ────────────────────────────────┐
│                                                                              │
│  ┌──────────────────────┐   ┌──────────────────────┐   ┌─────────────────┐  │
│  │ ObjectStore          │   │ StoreLayout          │   │ quota           │  │
│  │ • availability probe │   │ • batches/ index/    │   │ • oldest-first  │  │
│  │ • write_atomic (temp │   │   tags/              │   │   eviction      │  │
│  │   + rename)          │   │ • sanitize names     │   │ • preserve      │  │
│  │ • list / usage       │   └──────────────────────┘   │   predicate     │  │
│  └──────────────────────┘                              └─────────────────┘  │
│                                                                              │
│  ┌──────────────────────┐                                                   │
│  │ TagController        │  tags snapshot: versioned JSON envelope keyed     │
│  │ • label catalog      │  by fingerprint, debounced atomic writes          │
│  │ • row annotations    │                                                   │
│  │ • debounce deadline  │                                                   │
│  └──────────────────────┘                                                   │
└──────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────── RELATIONSHIPS ─────────────────────────────────┐
│                                                                              │
│  Engine ──owns──> Dataset ──owns──> RowBatchStore ──reads/writes──> Object  │
│     │                 │                                             Store    │
│     │                 └──owns──> FuzzyIndex ──persists──> snapshot (JSON)   │
│     │                                                                        │
│     ├──owns──> TagController ──persists──> tag snapshot (JSON)              │
│     │                                                                        │
│     ├──owns──> ProgressiveSorter ──sends──> SortCompletion (generation)     │
│     │                                                                        │
│     └──calls──> FilterEvaluator ──falls back──> fuzzy::matcher              │
│                                                                              │
│  quota::enforce_budget ──walks──> ObjectStore ──never touches──> preserved  │
│  entries (active dataset files)                                             │
│                                                                              │
└──────────────────────────────────────────────────────────────────────────────┘
*/
