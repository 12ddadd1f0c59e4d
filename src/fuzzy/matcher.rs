use levenshtein_automata::{DFA, Distance, LevenshteinAutomatonBuilder};
use std::collections::{BTreeSet, HashSet};

use crate::fuzzy::index::{ColumnIndex, trigrams};

/// Result of a fuzzy lookup against one column: the set of tokens that
/// survived edit-distance verification, plus ranked suggestion strings
/// for display.
#[derive(Debug, Clone)]
pub struct FuzzyLookup {
    pub surviving: HashSet<String>,
    pub suggestions: Vec<String>,
}

impl FuzzyLookup {
    pub fn is_empty(&self) -> bool {
        self.surviving.is_empty()
    }
}

/// Edit-distance probe for one query string. Uses a Levenshtein DFA for
/// the small distances it is built for, with a DP fallback beyond that.
pub struct FuzzyProbe {
    query: String,
    max_distance: u8,
    dfa: Option<DFA>,
}

impl FuzzyProbe {
    pub fn new(query: &str, max_distance: u8) -> Self {
        let max_distance = max_distance.clamp(1, 3);
        // DFA construction cost grows steeply with distance; beyond 2 the
        // DP fallback wins.
        let dfa = (max_distance <= 2).then(|| {
            LevenshteinAutomatonBuilder::new(max_distance, true).build_dfa(query)
        });
        FuzzyProbe {
            query: query.to_string(),
            max_distance,
            dfa,
        }
    }

    /// Distance to `candidate` if it is within the allowed maximum.
    pub fn distance(&self, candidate: &str) -> Option<u8> {
        if let Some(dfa) = &self.dfa {
            let mut state = dfa.initial_state();
            for &byte in candidate.as_bytes() {
                state = dfa.transition(state, byte);
            }
            match dfa.distance(state) {
                Distance::Exact(d) if d <= self.max_distance => Some(d),
                _ => None,
            }
        } else {
            let d = edit_distance(&self.query, candidate);
            (d <= self.max_distance as usize).then_some(d as u8)
        }
    }
}

/// Damerau-Levenshtein distance with adjacent transpositions, two-row DP.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev_prev: Vec<usize> = vec![0; b.len() + 1];
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                curr[j] = curr[j].min(prev_prev[j - 2] + 1);
            }
        }
        std::mem::swap(&mut prev_prev, &mut prev);
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Fuzzy lookup: trigram the query, union candidate token ids sharing at
/// least one query trigram, verify each candidate by true edit distance,
/// and rank suggestions closest-first with frequency breaking ties.
pub fn lookup(
    column: &ColumnIndex,
    query: &str,
    max_distance: u8,
    max_suggestions: usize,
) -> FuzzyLookup {
    let query = query.to_lowercase();
    let probe = FuzzyProbe::new(&query, max_distance);

    let mut candidates: BTreeSet<u32> = BTreeSet::new();
    for gram in trigrams(&query) {
        if let Some(ids) = column.trigram_index.get(&gram) {
            candidates.extend(ids.iter().copied());
        }
    }

    let mut scored: Vec<(u8, u64, &str)> = Vec::new();
    for id in candidates {
        let Some(entry) = column.token(id) else {
            continue;
        };
        if let Some(d) = probe.distance(&entry.token) {
            scored.push((d, entry.frequency, entry.token.as_str()));
        }
    }

    // Closest distance first; ties broken by higher frequency.
    scored.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(b.2)));

    FuzzyLookup {
        suggestions: scored
            .iter()
            .take(max_suggestions)
            .map(|(_, _, t)| t.to_string())
            .collect(),
        surviving: scored.into_iter().map(|(_, _, t)| t.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzy::tokenizer::ValueTokenizer;

    fn sample_column() -> ColumnIndex {
        let mut col = ColumnIndex::new("name");
        let tok = ValueTokenizer::default();
        col.add_value("alice", &tok, 1000);
        col.add_value("alicia", &tok, 1000);
        col.add_value("bob", &tok, 1000);
        col.add_value("alice", &tok, 1000); // bump frequency
        col
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("", "abc"), 3);
        // Transposition counts as a single edit.
        assert_eq!(edit_distance("teh", "the"), 1);
    }

    #[test]
    fn lookup_finds_near_matches() {
        let col = sample_column();
        let result = lookup(&col, "alise", 2, 8);
        assert!(result.surviving.contains("alice"));
        assert!(!result.surviving.contains("bob"));
        assert_eq!(result.suggestions[0], "alice");
    }

    #[test]
    fn lookup_respects_max_distance() {
        let col = sample_column();
        let tight = lookup(&col, "alic", 1, 8);
        assert!(tight.surviving.contains("alice"));
        assert!(!tight.surviving.contains("alicia"));
        let loose = lookup(&col, "alic", 2, 8);
        assert!(loose.surviving.contains("alicia"));
    }

    #[test]
    fn suggestions_rank_distance_then_frequency() {
        let mut col = ColumnIndex::new("word");
        let tok = ValueTokenizer::default();
        col.add_value("cart", &tok, 1000);
        for _ in 0..5 {
            col.add_value("card", &tok, 1000);
        }
        let result = lookup(&col, "carp", 1, 8);
        // Both at distance 1; "card" is more frequent.
        assert_eq!(result.suggestions[0], "card");
        assert_eq!(result.suggestions[1], "cart");
    }

    #[test]
    fn dp_fallback_used_for_distance_three() {
        let col = sample_column();
        let result = lookup(&col, "alixyz", 3, 8);
        assert!(result.surviving.contains("alice"));
    }

    #[test]
    fn no_shared_trigram_means_no_candidates() {
        let col = sample_column();
        let result = lookup(&col, "zzz", 2, 8);
        assert!(result.is_empty());
    }
}
