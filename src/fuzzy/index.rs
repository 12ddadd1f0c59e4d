use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::batch::batch::RowBatch;
use crate::core::types::Fingerprint;
use crate::fuzzy::tokenizer::ValueTokenizer;

/// Trigram width is fixed for the life of a snapshot version.
pub const TRIGRAM_SIZE: usize = 3;

#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub id: u32,
    pub token: String,
    pub frequency: u64,
}

/// Overlapping 3-character windows of a token. Tokens shorter than the
/// window index as themselves so they stay findable.
pub fn trigrams(token: &str) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < TRIGRAM_SIZE {
        return vec![token.to_string()];
    }
    (0..=chars.len() - TRIGRAM_SIZE)
        .map(|i| chars[i..i + TRIGRAM_SIZE].iter().collect())
        .collect()
}

/// Token table and trigram inverted index for one column.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    pub key: String,
    pub truncated: bool,
    pub tokens: Vec<TokenEntry>,
    token_ids: HashMap<String, u32>,
    /// trigram -> ascending token-id list.
    pub trigram_index: HashMap<String, Vec<u32>>,
}

impl ColumnIndex {
    pub fn new(key: impl Into<String>) -> Self {
        ColumnIndex {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Index one cell value. Once the token budget is exhausted the
    /// column is marked truncated: novel tokens are dropped, known
    /// tokens keep accumulating frequency.
    pub fn add_value(&mut self, value: &str, tokenizer: &ValueTokenizer, token_limit: usize) {
        for token in tokenizer.tokenize(value) {
            if let Some(&id) = self.token_ids.get(&token) {
                self.tokens[id as usize].frequency += 1;
                continue;
            }
            if self.tokens.len() >= token_limit {
                self.truncated = true;
                continue;
            }
            let id = self.tokens.len() as u32;
            for gram in trigrams(&token) {
                // Ids are assigned in increasing order, so pushing
                // keeps each posting list sorted.
                self.trigram_index.entry(gram).or_default().push(id);
            }
            self.token_ids.insert(token.clone(), id);
            self.tokens.push(TokenEntry {
                id,
                token,
                frequency: 1,
            });
        }
    }

    pub fn token(&self, id: u32) -> Option<&TokenEntry> {
        self.tokens.get(id as usize)
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.token_ids.contains_key(token)
    }

    /// Rebuild the reverse lookup after snapshot hydration.
    pub fn rebuild_lookup(&mut self) {
        self.token_ids = self
            .tokens
            .iter()
            .map(|t| (t.token.clone(), t.id))
            .collect();
    }
}

/// Per-dataset fuzzy index, built during ingestion and persisted as a
/// versioned snapshot keyed by the source file's fingerprint.
#[derive(Debug, Clone)]
pub struct FuzzyIndex {
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub row_count: u64,
    pub bytes_parsed: u64,
    pub token_limit: usize,
    pub columns: Vec<ColumnIndex>,
    tokenizer: ValueTokenizer,
}

impl FuzzyIndex {
    pub fn new(fingerprint: Fingerprint, column_keys: &[String], token_limit: usize) -> Self {
        FuzzyIndex {
            fingerprint,
            created_at: Utc::now(),
            row_count: 0,
            bytes_parsed: 0,
            token_limit,
            columns: column_keys.iter().map(ColumnIndex::new).collect(),
            tokenizer: ValueTokenizer::default(),
        }
    }

    pub fn from_parts(
        fingerprint: Fingerprint,
        created_at: DateTime<Utc>,
        row_count: u64,
        bytes_parsed: u64,
        token_limit: usize,
        columns: Vec<ColumnIndex>,
    ) -> Self {
        FuzzyIndex {
            fingerprint,
            created_at,
            row_count,
            bytes_parsed,
            token_limit,
            columns,
            tokenizer: ValueTokenizer::default(),
        }
    }

    pub fn tokenizer(&self) -> &ValueTokenizer {
        &self.tokenizer
    }

    /// Fold one sealed batch into the index.
    pub fn observe_batch(&mut self, batch: &RowBatch) {
        for local in 0..batch.len() {
            for (col_idx, column) in self.columns.iter_mut().enumerate() {
                let cell = batch.cell(local, col_idx);
                if let Some(text) = cell.display() {
                    column.add_value(&text, &self.tokenizer, self.token_limit);
                }
            }
        }
        self.row_count += batch.len() as u64;
        self.bytes_parsed = batch.stats.bytes_parsed;
    }

    pub fn column(&self, key: &str) -> Option<&ColumnIndex> {
        self.columns.iter().find(|c| c.key == key)
    }
}
