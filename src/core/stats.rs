use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::types::{ColumnInference, ColumnType};

/// Cumulative progress reported to the caller during streaming ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProgress {
    pub rows_parsed: u64,
    pub bytes_parsed: u64,
}

/// Emitted once at end-of-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub rows_parsed: u64,
    pub bytes_parsed: u64,
    pub duration_ms: u64,
    pub column_types: HashMap<String, ColumnType>,
    pub inference: Vec<ColumnInference>,
}

/// Engine-level counters for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub total_rows: u64,
    pub bytes_parsed: u64,
    pub store_available: bool,
    pub store_usage_bytes: u64,
    pub filter_requests: u64,
    pub sort_requests: u64,
}
