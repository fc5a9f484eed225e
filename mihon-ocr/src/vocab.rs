use std::path::Path;

use anyhow::{Context, Result};

const CONTINUATION_PREFIX: &str = "##";

/// Token id to text fragment table, one entry per line of a BERT `vocab.txt`.
///
/// The table may be shorter than the decoder's vocabulary; ids past the end are treated as
/// absent when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    entries: Vec<String>,
}

impl Vocabulary {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Parses `vocab.txt` content. WordPiece continuation markers are stripped since the
    /// decoder output is concatenated without separators anyway.
    pub fn from_text(text: &str) -> Self {
        let entries = text
            .lines()
            .map(|line| {
                let line = line.strip_suffix('\r').unwrap_or(line);
                match line.strip_prefix(CONTINUATION_PREFIX) {
                    Some(rest) if !rest.is_empty() => rest.to_string(),
                    _ => line.to_string(),
                }
            })
            .collect();
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
        Ok(Self::from_text(&text))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(id as usize).map(String::as_str)
    }
}

/// Turns generated token ids back into text.
#[derive(Debug, Clone)]
pub struct VocabularyDecoder {
    vocabulary: Vocabulary,
    special_token_threshold: u32,
}

impl VocabularyDecoder {
    pub fn new(vocabulary: Vocabulary, special_token_threshold: u32) -> Self {
        Self {
            vocabulary,
            special_token_threshold,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Concatenates the entries of `tokens` in order, skipping control tokens and ids the
    /// vocabulary does not cover.
    pub fn decode(&self, tokens: &[u32]) -> String {
        let mut text = String::with_capacity(tokens.len() * 3);
        for &id in tokens {
            if id < self.special_token_threshold {
                continue;
            }
            if let Some(entry) = self.vocabulary.get(id) {
                text.push_str(entry);
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> VocabularyDecoder {
        let mut entries: Vec<String> = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "x", "y"]
            .into_iter()
            .map(String::from)
            .collect();
        entries.push("あ".to_string());
        entries.push("い".to_string());
        VocabularyDecoder::new(Vocabulary::new(entries), 5)
    }

    #[test]
    fn skips_control_tokens() {
        assert_eq!(decoder().decode(&[2, 7, 8, 3]), "あい");
        assert_eq!(decoder().decode(&[0, 1, 2, 3, 4]), "");
    }

    #[test]
    fn ids_past_vocabulary_are_absent() {
        assert_eq!(decoder().decode(&[2, 7, 9, 6143, u32::MAX, 8]), "あい");
    }

    #[test]
    fn entries_are_joined_without_separator() {
        assert_eq!(decoder().decode(&[5, 6, 5]), "xyx");
    }

    #[test]
    fn from_text_indexes_lines_and_strips_continuations() {
        let vocab = Vocabulary::from_text("[PAD]\r\n[UNK]\n##ん\n##\nあ\n");
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.get(0), Some("[PAD]"));
        assert_eq!(vocab.get(1), Some("[UNK]"));
        assert_eq!(vocab.get(2), Some("ん"));
        assert_eq!(vocab.get(3), Some("##"));
        assert_eq!(vocab.get(4), Some("あ"));
        assert_eq!(vocab.get(5), None);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Vocabulary::load(Path::new("/nonexistent/vocab.txt")).unwrap_err();
        assert!(err.to_string().contains("failed to read vocabulary"));
    }
}
