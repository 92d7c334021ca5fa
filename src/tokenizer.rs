/* ------------------------------------------------------------------ */
/* Character-level tokenizer with BOS/EOS                            */
/* ------------------------------------------------------------------ */
//
// ids 0 and 1 are reserved for BOS and EOS, so vocab sizes line up with
// RGPT checkpoints; the remaining ids are the sorted distinct characters
// of the corpus. Unknown characters are dropped on encode.

use std::collections::HashMap;

pub struct Tokenizer {
    pub vocab_size: usize,
    pub bos_id:     usize,
    pub eos_id:     usize,
    char_to_idx:    HashMap<char, usize>,
}

impl Tokenizer {
    pub fn from_text(text: &str) -> Self {
        let mut chars: Vec<char> = text.chars().collect();
        chars.sort_unstable();
        chars.dedup();

        let char_to_idx = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i + 2))
            .collect();

        Self { vocab_size: chars.len() + 2, bos_id: 0, eos_id: 1, char_to_idx }
    }

    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.chars()
            .filter_map(|c| self.char_to_idx.get(&c).copied())
            .collect()
    }

    /// `encode`, framed by BOS and EOS.
    pub fn encode_document(&self, text: &str) -> Vec<usize> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        ids.push(self.bos_id);
        ids.extend(self.encode(text));
        ids.push(self.eos_id);
        ids
    }
}
