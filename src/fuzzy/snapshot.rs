use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::error::Result;
use crate::core::types::Fingerprint;
use crate::fuzzy::index::{ColumnIndex, FuzzyIndex, TRIGRAM_SIZE, TokenEntry};

pub const SNAPSHOT_VERSION: u64 = 1;

#[derive(Serialize)]
struct SnapshotFile<'a> {
    version: u64,
    created_at: DateTime<Utc>,
    row_count: u64,
    bytes_parsed: u64,
    token_limit: u64,
    trigram_size: u64,
    fingerprint: &'a Fingerprint,
    columns: Vec<SnapshotColumn<'a>>,
}

#[derive(Serialize)]
struct SnapshotColumn<'a> {
    key: &'a str,
    truncated: bool,
    tokens: Vec<SnapshotToken<'a>>,
    trigram_index: BTreeMap<&'a str, &'a [u32]>,
}

#[derive(Serialize)]
struct SnapshotToken<'a> {
    id: u32,
    token: &'a str,
    frequency: u64,
}

/// Serialize the index as a versioned JSON envelope. Trigram id lists
/// go out as plain arrays; the storage format cannot carry typed
/// buffers.
pub fn encode(index: &FuzzyIndex) -> Result<Vec<u8>> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        created_at: index.created_at,
        row_count: index.row_count,
        bytes_parsed: index.bytes_parsed,
        token_limit: index.token_limit as u64,
        trigram_size: TRIGRAM_SIZE as u64,
        fingerprint: &index.fingerprint,
        columns: index
            .columns
            .iter()
            .map(|c| SnapshotColumn {
                key: &c.key,
                truncated: c.truncated,
                tokens: c
                    .tokens
                    .iter()
                    .map(|t| SnapshotToken {
                        id: t.id,
                        token: &t.token,
                        frequency: t.frequency,
                    })
                    .collect(),
                trigram_index: c
                    .trigram_index
                    .iter()
                    .map(|(g, ids)| (g.as_str(), ids.as_slice()))
                    .collect(),
            })
            .collect(),
    };
    Ok(serde_json::to_vec(&file)?)
}

/// Deserialize a snapshot. Malformed or foreign input is a cache miss
/// (`None`), never an error: the caller rebuilds the index. Token ids
/// are clamped into u32 range; negative or non-finite ids are dropped.
pub fn decode(data: &[u8]) -> Option<FuzzyIndex> {
    let value: Value = serde_json::from_slice(data).ok()?;
    let obj = value.as_object()?;

    if obj.get("version")?.as_u64()? != SNAPSHOT_VERSION {
        return None;
    }
    if obj.get("trigram_size")?.as_u64()? != TRIGRAM_SIZE as u64 {
        return None;
    }

    let fp = obj.get("fingerprint")?.as_object()?;
    let fingerprint = Fingerprint {
        file_name: fp.get("file_name")?.as_str()?.to_string(),
        file_size: fp.get("file_size")?.as_u64()?,
        last_modified: fp.get("last_modified")?.as_i64()?,
    };

    let created_at = obj
        .get("created_at")?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;
    let row_count = obj.get("row_count")?.as_u64()?;
    let bytes_parsed = obj.get("bytes_parsed")?.as_u64()?;
    let token_limit = obj.get("token_limit")?.as_u64()? as usize;

    let mut columns = Vec::new();
    for col in obj.get("columns")?.as_array()? {
        columns.push(decode_column(col)?);
    }

    Some(FuzzyIndex::from_parts(
        fingerprint,
        created_at,
        row_count,
        bytes_parsed,
        token_limit,
        columns,
    ))
}

fn decode_column(value: &Value) -> Option<ColumnIndex> {
    let obj = value.as_object()?;
    let mut column = ColumnIndex::new(obj.get("key")?.as_str()?);
    column.truncated = obj.get("truncated")?.as_bool()?;

    for token in obj.get("tokens")?.as_array()? {
        let token = token.as_object()?;
        let Some(id) = clamp_token_id(token.get("id")?) else {
            continue;
        };
        column.tokens.push(TokenEntry {
            id,
            token: token.get("token")?.as_str()?.to_string(),
            frequency: token.get("frequency").and_then(Value::as_u64).unwrap_or(0),
        });
    }

    for (gram, ids) in obj.get("trigram_index")?.as_object()? {
        let mut ids: Vec<u32> = ids.as_array()?.iter().filter_map(clamp_token_id).collect();
        ids.sort_unstable();
        ids.dedup();
        column.trigram_index.insert(gram.clone(), ids);
    }

    column.rebuild_lookup();
    Some(column)
}

/// Out-of-range ids clamp into u32; truly invalid ones (negative, NaN,
/// non-numeric) are dropped.
fn clamp_token_id(value: &Value) -> Option<u32> {
    let n = value.as_f64()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some(n.min(u32::MAX as f64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzy::tokenizer::ValueTokenizer;
    use std::collections::HashMap;

    fn sample_index() -> FuzzyIndex {
        let fp = Fingerprint::new("people.csv", 100, 1700000000);
        let mut index = FuzzyIndex::new(fp, &["name".to_string(), "city".to_string()], 1000);
        let tok = ValueTokenizer::default();
        for value in ["alice", "alicia", "bob"] {
            // Columns are independent; fill only the first.
            if let Some(col) = index.columns.get_mut(0) {
                col.add_value(value, &tok, 1000);
            }
        }
        index.row_count = 3;
        index
    }

    #[test]
    fn round_trip_preserves_tokens_and_trigram_sets() {
        let index = sample_index();
        let bytes = encode(&index).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.fingerprint, index.fingerprint);
        assert_eq!(decoded.row_count, 3);
        let original = index.column("name").unwrap();
        let restored = decoded.column("name").unwrap();
        assert_eq!(restored.tokens.len(), original.tokens.len());
        for (a, b) in original.tokens.iter().zip(&restored.tokens) {
            assert_eq!(a.token, b.token);
            assert_eq!(a.id, b.id);
            assert_eq!(a.frequency, b.frequency);
        }

        // Trigram sets compare order-insensitively.
        let as_sets = |c: &ColumnIndex| -> HashMap<String, Vec<u32>> {
            c.trigram_index
                .iter()
                .map(|(g, ids)| {
                    let mut ids = ids.clone();
                    ids.sort_unstable();
                    (g.clone(), ids)
                })
                .collect()
        };
        assert_eq!(as_sets(original), as_sets(restored));
    }

    #[test]
    fn version_mismatch_is_a_cache_miss() {
        let index = sample_index();
        let mut value: Value = serde_json::from_slice(&encode(&index).unwrap()).unwrap();
        value["version"] = Value::from(99);
        assert!(decode(&serde_json::to_vec(&value).unwrap()).is_none());
    }

    #[test]
    fn missing_fingerprint_is_a_cache_miss() {
        let index = sample_index();
        let mut value: Value = serde_json::from_slice(&encode(&index).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("fingerprint");
        assert!(decode(&serde_json::to_vec(&value).unwrap()).is_none());
    }

    #[test]
    fn garbage_never_panics() {
        assert!(decode(b"not json").is_none());
        assert!(decode(b"[]").is_none());
        assert!(decode(b"{}").is_none());
        assert!(decode(b"{\"version\": 1}").is_none());
    }

    #[test]
    fn out_of_range_ids_clamp_and_invalid_ids_drop() {
        let index = sample_index();
        let mut value: Value = serde_json::from_slice(&encode(&index).unwrap()).unwrap();
        let grams = value["columns"][0]["trigram_index"].as_object_mut().unwrap();
        grams.insert(
            "zzz".to_string(),
            Value::from(vec![
                Value::from(-5),               // dropped
                Value::from(8_589_934_592i64), // clamped to u32::MAX
                Value::from(1.75),             // truncated to 1
            ]),
        );
        let decoded = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        let ids = &decoded.column("name").unwrap().trigram_index["zzz"];
        assert_eq!(ids, &vec![1, u32::MAX]);
    }
}
