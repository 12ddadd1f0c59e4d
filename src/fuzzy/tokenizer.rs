use unicode_segmentation::UnicodeSegmentation;

/// Splits cell values into lowercase unicode words for indexing and for
/// row-level match resolution. Both sides must tokenize identically.
#[derive(Debug, Clone)]
pub struct ValueTokenizer {
    pub max_token_length: usize,
}

impl Default for ValueTokenizer {
    fn default() -> Self {
        ValueTokenizer {
            max_token_length: 255,
        }
    }
}

impl ValueTokenizer {
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .filter(|w| w.len() <= self.max_token_length)
            .map(|w| w.to_lowercase())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_lowercases() {
        let t = ValueTokenizer::default();
        assert_eq!(t.tokenize("Hello, World!"), vec!["hello", "world"]);
    }

    #[test]
    fn handles_unicode_words() {
        let t = ValueTokenizer::default();
        assert_eq!(t.tokenize("crème brûlée"), vec!["crème", "brûlée"]);
    }

    #[test]
    fn oversized_tokens_are_skipped() {
        let t = ValueTokenizer {
            max_token_length: 4,
        };
        assert_eq!(t.tokenize("tiny enormous"), vec!["tiny"]);
    }
}
