/// Byte-pair encoding.
///
/// Text starts as single-byte tokens; the highest-priority applicable
/// merge (lowest rank in the table) is applied repeatedly until no pair of
/// adjacent tokens has a rule. Merge rules whose parts or result are not
/// in the vocabulary are dropped at build time.
use std::collections::HashMap;

use crate::tokenizer::vocab::Vocabulary;

#[derive(Debug)]
pub struct MergeTable {
    /// (left id, right id) -> (rank, merged id)
    rules: HashMap<(i32, i32), (u32, i32)>,
}

impl MergeTable {
    pub fn build(pairs: &[(String, String)], vocab: &Vocabulary) -> Self {
        let mut rules = HashMap::with_capacity(pairs.len());
        for (rank, (a, b)) in pairs.iter().enumerate() {
            let (Some(left), Some(right)) = (vocab.id_of(a.as_bytes()), vocab.id_of(b.as_bytes()))
            else {
                continue;
            };
            let mut merged = a.as_bytes().to_vec();
            merged.extend_from_slice(b.as_bytes());
            let Some(merged_id) = vocab.id_of(&merged) else {
                continue;
            };
            rules
                .entry((left, right))
                .or_insert((rank as u32, merged_id));
        }
        Self { rules }
    }

    fn rank(&self, left: i32, right: i32) -> Option<(u32, i32)> {
        self.rules.get(&(left, right)).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

pub fn encode(text: &str, vocab: &Vocabulary, merges: &MergeTable) -> Vec<i32> {
    // initial byte split
    let mut tokens: Vec<i32> = Vec::with_capacity(text.len());
    for &byte in text.as_bytes() {
        match vocab.byte_token(byte) {
            Some(id) => tokens.push(id),
            None => {
                if let Some(unk) = vocab.specials().unk {
                    tokens.push(unk);
                }
            }
        }
    }

    // greedy merge loop: always the best-ranked applicable pair
    loop {
        let mut best: Option<(u32, usize, i32)> = None;
        for i in 0..tokens.len().saturating_sub(1) {
            if let Some((rank, merged)) = merges.rank(tokens[i], tokens[i + 1]) {
                if best.map_or(true, |(r, _, _)| rank < r) {
                    best = Some((rank, i, merged));
                }
            }
        }
        let Some((_, at, merged)) = best else {
            break;
        };
        tokens[at] = merged;
        tokens.remove(at + 1);
    }

    tokens
}
