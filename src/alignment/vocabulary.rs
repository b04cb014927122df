use std::collections::HashMap;
use std::path::Path;

use crate::error::{ConversionError, Result};

/// Ordered CTC label set: index 0 is the blank, the last index is the word separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVocabulary {
    symbols: Vec<String>,
    by_char: HashMap<char, usize>,
}

impl LabelVocabulary {
    pub fn from_symbols<S: Into<String>>(symbols: impl IntoIterator<Item = S>) -> Result<Self> {
        let symbols: Vec<String> = symbols.into_iter().map(Into::into).collect();
        if symbols.len() < 2 {
            return Err(ConversionError::invalid_input(format!(
                "a CTC vocabulary needs a blank and a separator, got {} symbols",
                symbols.len()
            )));
        }
        let mut by_char = HashMap::new();
        for (i, symbol) in symbols.iter().enumerate() {
            let mut chars = symbol.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                by_char.entry(c).or_insert(i);
            }
        }
        Ok(Self { symbols, by_char })
    }

    /// Reads `labels.txt`: one symbol per line, index = line number.
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            std::fs::read_to_string(path).map_err(|e| ConversionError::io("read labels.txt", e))?;
        let symbols: Vec<&str> = data.lines().map(|l| l.trim_end_matches('\r')).collect();
        let end = symbols
            .iter()
            .rposition(|s| !s.is_empty())
            .map_or(0, |i| i + 1);
        Self::from_symbols(symbols[..end].iter().copied())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = self.symbols.join("\n");
        data.push('\n');
        std::fs::write(path, data).map_err(|e| ConversionError::io("write labels.txt", e))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn blank_id(&self) -> usize {
        0
    }

    pub fn separator_id(&self) -> usize {
        self.symbols.len() - 1
    }

    pub fn symbol(&self, id: usize) -> Option<&str> {
        self.symbols.get(id).map(String::as_str)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn id_of(&self, c: char) -> Option<usize> {
        self.by_char.get(&c).copied()
    }

    /// Target label sequence for a transcript, without blanks.
    ///
    /// Letters are lower-cased unless the vocabulary only has upper-case
    /// letters. Characters outside the vocabulary are dropped, and words left
    /// empty are skipped. Consecutive words are joined by the separator.
    pub fn encode_transcript(&self, transcript: &str) -> Vec<usize> {
        let (mut has_upper, mut has_lower) = (false, false);
        for c in self.by_char.keys().filter(|c| c.is_alphabetic()) {
            has_upper |= c.is_uppercase();
            has_lower |= c.is_lowercase();
        }
        let cleaned = if has_upper && !has_lower {
            transcript.to_uppercase()
        } else {
            transcript.to_lowercase()
        };

        let separator = self.separator_id();
        let mut targets = Vec::new();
        for word in cleaned.split_whitespace() {
            let ids: Vec<usize> = word
                .chars()
                .filter_map(|c| self.id_of(c))
                .filter(|&id| id != self.blank_id() && id != separator)
                .collect();
            if ids.is_empty() {
                continue;
            }
            if !targets.is_empty() {
                targets.push(separator);
            }
            targets.extend(ids);
        }
        targets
    }

    /// Greedy CTC reading of a per-frame label path: repeats collapse, blanks
    /// drop out, separators become spaces.
    pub fn render(&self, labels: &[usize]) -> String {
        let mut out = String::new();
        let mut last = None;
        for &label in labels {
            if Some(label) == last {
                continue;
            }
            last = Some(label);
            if label == self.blank_id() {
                continue;
            }
            if label == self.separator_id() {
                if !out.is_empty() && !out.ends_with(' ') {
                    out.push(' ');
                }
            } else if let Some(symbol) = self.symbol(label) {
                out.push_str(symbol);
            }
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> LabelVocabulary {
        LabelVocabulary::from_symbols(["-", "a", "b", "c", "'", "|"]).unwrap()
    }

    #[test]
    fn blank_and_separator_positions() {
        let v = vocab();
        assert_eq!(v.blank_id(), 0);
        assert_eq!(v.separator_id(), 5);
        assert_eq!(v.id_of('c'), Some(3));
    }

    #[test]
    fn encode_lowercases_and_separates_words() {
        let v = vocab();
        assert_eq!(v.encode_transcript("AB  c"), vec![1, 2, 5, 3]);
        assert_eq!(v.encode_transcript("a'b"), vec![1, 4, 2]);
    }

    #[test]
    fn encode_drops_unknown_characters_and_empty_words() {
        let v = vocab();
        assert_eq!(v.encode_transcript("x a? zz b"), vec![1, 5, 2]);
        assert!(v.encode_transcript("   ").is_empty());
    }

    #[test]
    fn upper_case_vocabulary_upper_cases_transcript() {
        let v = LabelVocabulary::from_symbols(["<pad>", "A", "B", "|"]).unwrap();
        assert_eq!(v.encode_transcript("ab a"), vec![1, 2, 3, 1]);
    }

    #[test]
    fn render_collapses_ctc_path() {
        let v = vocab();
        assert_eq!(v.render(&[0, 1, 1, 0, 1, 5, 5, 2, 0, 5]), "aa b");
    }

    #[test]
    fn save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        let v = vocab();
        v.save(&path).unwrap();
        assert_eq!(LabelVocabulary::load(&path).unwrap(), v);
    }

    #[test]
    fn too_small_vocabulary_is_rejected() {
        assert!(LabelVocabulary::from_symbols(["-"]).is_err());
    }
}
