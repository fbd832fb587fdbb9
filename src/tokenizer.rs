//! Byte-pair tokenizer over a vocabulary and merge-rank table.
//!
//! Encoding is a deliberately simplified take on BPE: text starts as
//! single-character tokens and the lowest-ranked adjacent pair is merged one
//! occurrence at a time. Tokens that never reach a vocabulary entry are
//! silently dropped, so encoding is lossy for out-of-vocabulary text. This is
//! documented behavior, not full GPT-2 BPE fidelity.

use std::{collections::HashMap, path::Path};

use crate::error::{Result, WhisperError};

/// Special-token vocabulary keys, looked up literally.
pub const SOT_TOKEN: &str = "<|startoftranscript|>";
pub const EOT_TOKEN: &str = "<|endoftext|>";
pub const TRANSLATE_TOKEN: &str = "<|translate|>";
pub const TRANSCRIBE_TOKEN: &str = "<|transcribe|>";

/// Special-token ids resolved at construction. Absent entries are `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialTokens {
    pub sot: Option<u32>,
    pub eot: Option<u32>,
    pub translate: Option<u32>,
    pub transcribe: Option<u32>,
}

/// Vocabulary plus merge ranks, immutable after construction.
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    reverse: HashMap<u32, String>,
    merges: HashMap<(String, String), usize>,
    specials: SpecialTokens,
}

impl Tokenizer {
    /// Build a tokenizer from an in-memory vocabulary and an ordered merge
    /// list (earlier entries have higher priority).
    pub fn new(vocab: HashMap<String, u32>, merges: Vec<(String, String)>) -> Self {
        let reverse = vocab.iter().map(|(s, &id)| (id, s.clone())).collect();
        let merges = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();
        let specials = SpecialTokens {
            sot: vocab.get(SOT_TOKEN).copied(),
            eot: vocab.get(EOT_TOKEN).copied(),
            translate: vocab.get(TRANSLATE_TOKEN).copied(),
            transcribe: vocab.get(TRANSCRIBE_TOKEN).copied(),
        };
        Self {
            vocab,
            reverse,
            merges,
            specials,
        }
    }

    /// Load from a JSON vocabulary (`{"token": id, ...}`) and a merges file
    /// with one space-separated pair per line. Malformed merge lines (such as
    /// a `#version` header) are skipped.
    pub fn from_files(vocab_path: &Path, merges_path: &Path) -> Result<Self> {
        let vocab_data =
            std::fs::read_to_string(vocab_path).map_err(|_| WhisperError::VocabMissing)?;
        let vocab: HashMap<String, u32> =
            serde_json::from_str(&vocab_data).map_err(|_| WhisperError::VocabMissing)?;

        let merges_data =
            std::fs::read_to_string(merges_path).map_err(|_| WhisperError::MergesMissing)?;
        let merges = merges_data
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| {
                let mut parts = line.split(' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => {
                        Some((a.to_string(), b.to_string()))
                    }
                    _ => None,
                }
            })
            .collect();

        Ok(Self::new(vocab, merges))
    }

    /// Encode text to token ids.
    ///
    /// Repeatedly merges the first occurrence of the lowest-ranked adjacent
    /// pair until no mergeable pair remains, then maps token strings to ids,
    /// dropping any token absent from the vocabulary.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut tokens: Vec<String> = text.chars().map(String::from).collect();

        loop {
            let mut best: Option<(usize, usize)> = None; // (position, rank)
            for i in 0..tokens.len().saturating_sub(1) {
                let pair = (tokens[i].clone(), tokens[i + 1].clone());
                if let Some(&rank) = self.merges.get(&pair) {
                    if best.map_or(true, |(_, r)| rank < r) {
                        best = Some((i, rank));
                    }
                }
            }
            match best {
                Some((i, _)) => {
                    let merged = format!("{}{}", tokens[i], tokens[i + 1]);
                    tokens.splice(i..i + 2, [merged]);
                }
                None => break,
            }
        }

        tokens
            .iter()
            .filter_map(|t| self.vocab.get(t).copied())
            .collect()
    }

    /// Decode ids back to text, skipping ids without a vocabulary entry.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|id| self.reverse.get(id).map(String::as_str))
            .collect()
    }

    /// Look up a special token by its literal vocabulary key.
    pub fn special(&self, name: &str) -> Option<u32> {
        self.vocab.get(name).copied()
    }

    /// Resolved special-token ids.
    pub fn specials(&self) -> &SpecialTokens {
        &self.specials
    }

    /// String form of a single id, if known.
    pub fn token_string(&self, id: u32) -> Option<&str> {
        self.reverse.get(&id).map(String::as_str)
    }
}
