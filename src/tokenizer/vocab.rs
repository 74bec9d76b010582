use std::collections::HashMap;

use crate::model::hparams::SpecialTokenIds;

/// Ordered token table. The index in the table is the token id.
///
/// Tokens are byte strings; single-byte entries double as the fallback
/// table for unmatched input bytes.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, i32>,
    byte_tokens: [Option<i32>; 256],
    specials: SpecialTokenIds,
    max_token_len: usize,
}

impl Vocabulary {
    pub fn from_strings(entries: &[String], specials: SpecialTokenIds) -> Self {
        Self::from_bytes(
            entries.iter().map(|s| s.as_bytes().to_vec()).collect(),
            specials,
        )
    }

    pub fn from_bytes(tokens: Vec<Vec<u8>>, specials: SpecialTokenIds) -> Self {
        let mut lookup = HashMap::with_capacity(tokens.len());
        let mut byte_tokens = [None; 256];
        let mut max_token_len = 0;
        for (id, tok) in tokens.iter().enumerate() {
            // first occurrence wins on duplicates
            lookup.entry(tok.clone()).or_insert(id as i32);
            if tok.len() == 1 && byte_tokens[tok[0] as usize].is_none() {
                byte_tokens[tok[0] as usize] = Some(id as i32);
            }
            max_token_len = max_token_len.max(tok.len());
        }
        Self {
            tokens,
            lookup,
            byte_tokens,
            specials,
            max_token_len,
        }
    }

    /// 256 single-byte tokens; the degraded mode when a model ships no
    /// vocabulary.
    pub fn byte_level(specials: SpecialTokenIds) -> Self {
        let tokens: Vec<Vec<u8>> = (0u16..256).map(|b| vec![b as u8]).collect();
        Self::from_bytes(tokens, specials)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, id: i32) -> Option<&[u8]> {
        if id < 0 {
            return None;
        }
        self.tokens.get(id as usize).map(Vec::as_slice)
    }

    pub fn id_of(&self, token: &[u8]) -> Option<i32> {
        self.lookup.get(token).copied()
    }

    pub fn byte_token(&self, byte: u8) -> Option<i32> {
        self.byte_tokens[byte as usize]
    }

    pub fn specials(&self) -> SpecialTokenIds {
        self.specials
    }

    /// Ids the sampler treats as special (exempt from repetition penalty).
    pub fn special_ids(&self) -> Vec<i32> {
        [
            self.specials.bos,
            self.specials.eos,
            self.specials.pad,
            self.specials.unk,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn max_token_len(&self) -> usize {
        self.max_token_len.max(1)
    }
}
