/// Text to token ids and back.
///
/// Two modes: token-table (longest-prefix match with a single-byte
/// fallback) and BPE (byte split plus ranked merges). Construction from
/// model metadata degrades gracefully: no vocabulary means a byte-level
/// vocabulary, a missing merge table means table mode. Each degradation
/// is reported as a telemetry event.
mod bpe;
mod vocab;

pub use vocab::Vocabulary;

use crate::model::hparams::TokenizerMetadata;
use crate::telemetry::{Telemetry, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerMode {
    Table,
    Bpe,
}

/// Where `encode_with_special` puts which special token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialInsert {
    /// BOS at the front
    Bos,
    /// EOS at the end
    Eos,
}

#[derive(Debug)]
pub struct Tokenizer {
    vocab: Vocabulary,
    mode: TokenizerMode,
    merges: Option<bpe::MergeTable>,
}

impl Tokenizer {
    /// Build from model metadata, degrading as needed.
    pub fn from_metadata(meta: &TokenizerMetadata, telemetry: &Telemetry) -> Self {
        let vocab = match &meta.vocab {
            Some(entries) if !entries.is_empty() => {
                Vocabulary::from_strings(entries, meta.specials)
            }
            _ => {
                telemetry.record(TelemetryEvent::VocabMissing);
                telemetry.record(TelemetryEvent::FallbackByteBpe);
                Vocabulary::byte_level(meta.specials)
            }
        };

        let wants_bpe = meta.mode.as_deref() != Some("table");
        let merges = if wants_bpe {
            match &meta.merges {
                Some(pairs) if !pairs.is_empty() => Some(bpe::MergeTable::build(pairs, &vocab)),
                _ => {
                    if meta.vocab.is_some() {
                        telemetry.record(TelemetryEvent::MergesMissing);
                    }
                    None
                }
            }
        } else {
            None
        };

        let mode = if merges.is_some() {
            TokenizerMode::Bpe
        } else {
            TokenizerMode::Table
        };
        Self {
            vocab,
            mode,
            merges,
        }
    }

    pub fn from_vocab(vocab: Vocabulary) -> Self {
        Self {
            vocab,
            mode: TokenizerMode::Table,
            merges: None,
        }
    }

    pub fn mode(&self) -> TokenizerMode {
        self.mode
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn encode(&self, text: &str) -> Vec<i32> {
        match self.mode {
            TokenizerMode::Table => self.encode_table(text),
            TokenizerMode::Bpe => {
                let merges = self.merges.as_ref();
                match merges {
                    Some(table) => bpe::encode(text, &self.vocab, table),
                    None => self.encode_table(text),
                }
            }
        }
    }

    /// Encode plus the requested special tokens. Specials the model does
    /// not define are skipped silently (their absence is configuration,
    /// not an error).
    pub fn encode_with_special(&self, text: &str, inserts: &[SpecialInsert]) -> Vec<i32> {
        let mut out = Vec::new();
        if inserts.contains(&SpecialInsert::Bos) {
            if let Some(bos) = self.vocab.specials().bos {
                out.push(bos);
            }
        }
        out.extend(self.encode(text));
        if inserts.contains(&SpecialInsert::Eos) {
            if let Some(eos) = self.vocab.specials().eos {
                out.push(eos);
            }
        }
        out
    }

    /// Longest-prefix match, falling back to single-byte tokens, then UNK.
    fn encode_table(&self, text: &str) -> Vec<i32> {
        let bytes = text.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        let max_len = self.vocab.max_token_len();
        while i < bytes.len() {
            let mut matched = None;
            let end = (i + max_len).min(bytes.len());
            for j in (i + 1..=end).rev() {
                if let Some(id) = self.vocab.id_of(&bytes[i..j]) {
                    matched = Some((id, j - i));
                    break;
                }
            }
            match matched {
                Some((id, len)) => {
                    out.push(id);
                    i += len;
                }
                None => {
                    if let Some(id) = self.vocab.byte_token(bytes[i]) {
                        out.push(id);
                    } else if let Some(unk) = self.vocab.specials().unk {
                        out.push(unk);
                    }
                    i += 1;
                }
            }
        }
        out
    }

    /// Lossy decode: unknown ids render as the replacement character, and
    /// so do invalid UTF-8 stretches.
    pub fn decode(&self, tokens: &[i32]) -> String {
        let mut bytes = Vec::new();
        for &id in tokens {
            match self.vocab.get(id) {
                Some(tok) => bytes.extend_from_slice(tok),
                None => bytes.extend_from_slice("\u{FFFD}".as_bytes()),
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Lossless decode: fails on unknown ids, returns the exact bytes.
    pub fn decode_bytes(&self, tokens: &[i32]) -> crate::error::QuernResult<Vec<u8>> {
        let mut bytes = Vec::new();
        for &id in tokens {
            match self.vocab.get(id) {
                Some(tok) => bytes.extend_from_slice(tok),
                None => {
                    return Err(crate::error::QuernError::InvalidToken {
                        id,
                        vocab_size: self.vocab.len(),
                    })
                }
            }
        }
        Ok(bytes)
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}
