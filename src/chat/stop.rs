/// Stop-sequence detection over streamed text.
///
/// Decode emits tokens one at a time; the matcher keeps just enough
/// detokenized tail to recognize any configured sequence across token
/// boundaries.
#[derive(Debug, Default)]
pub struct StopMatcher {
    sequences: Vec<String>,
    tail: String,
    max_len: usize,
}

impl StopMatcher {
    pub fn new(sequences: Vec<String>) -> Self {
        let max_len = sequences.iter().map(String::len).max().unwrap_or(0);
        Self {
            sequences,
            tail: String::new(),
            max_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Feed the next decoded piece. Returns the matched stop sequence, if
    /// any piece of the rolling tail now ends one.
    pub fn push(&mut self, piece: &str) -> Option<&str> {
        if self.sequences.is_empty() {
            return None;
        }
        self.tail.push_str(piece);
        // keep at most 2x the longest sequence around (on a char boundary)
        if self.tail.len() > self.max_len * 2 {
            let cut = self.tail.len() - self.max_len * 2;
            let cut = (cut..self.tail.len())
                .find(|i| self.tail.is_char_boundary(*i))
                .unwrap_or(0);
            self.tail.drain(..cut);
        }
        self.sequences
            .iter()
            .find(|seq| self.tail.contains(seq.as_str()))
            .map(String::as_str)
    }

    /// Strip the matched sequence and anything after it from accumulated
    /// output text.
    pub fn trim_output(text: &str, matched: &str) -> String {
        match text.find(matched) {
            Some(at) => text[..at].to_string(),
            None => text.to_string(),
        }
    }
}
