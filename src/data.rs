/* ------------------------------------------------------------------ */
/* Token batches for the training loop                               */
/* ------------------------------------------------------------------ */

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{Result, SqkError};
use crate::rng::Rng;
use crate::tokenizer::Tokenizer;

#[derive(Clone, Debug)]
pub struct Batch {
    /// `[batch, seq]`, u32 token ids.
    pub tokens: Tensor,
}

impl Batch {
    pub fn new(tokens: Tensor) -> Result<Self> {
        if tokens.rank() != 2 {
            return Err(SqkError::Shape(format!(
                "batch tokens must be [batch, seq], got {:?}", tokens.dims()
            )));
        }
        Ok(Self { tokens })
    }

    /// Number of (query, key) position pairs: batch · seq².
    pub fn token_pairs(&self) -> u64 {
        let d = self.tokens.dims();
        (d[0] * d[1] * d[1]) as u64
    }
}

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

pub trait BatchSource {
    /// A fresh, finite pass over the data for `epoch`. A pass cannot be rewound.
    fn epoch(&mut self, epoch: usize) -> Result<BatchIter<'_>>;
}

/// Fixed batches, replayed in the same order every epoch.
impl BatchSource for Vec<Batch> {
    fn epoch(&mut self, _epoch: usize) -> Result<BatchIter<'_>> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}

// ── Text corpus ───────────────────────────────────────────────────────────

/// Tiles a token stream into non-overlapping `seq_len` windows and deals
/// them out as `[batch_size, seq_len]` batches, reshuffled every epoch.
/// A trailing partial batch is dropped.
pub struct TextBatches {
    tokens:     Vec<u32>,
    batch_size: usize,
    seq_len:    usize,
    rng:        Rng,
    device:     Device,
}

impl TextBatches {
    pub fn new(
        tokens: Vec<u32>,
        batch_size: usize,
        seq_len: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 || seq_len == 0 {
            return Err(SqkError::Data("batch_size and seq_len must be > 0".into()));
        }
        let windows = tokens.len() / seq_len;
        if windows < batch_size {
            return Err(SqkError::Data(format!(
                "{} tokens give {windows} windows of {seq_len}, need at least {batch_size}",
                tokens.len()
            )));
        }
        Ok(Self { tokens, batch_size, seq_len, rng: Rng::new(seed), device: device.clone() })
    }

    pub fn from_text(
        text: &str,
        tokenizer: &Tokenizer,
        batch_size: usize,
        seq_len: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let ids = tokenizer.encode_document(text).into_iter().map(|t| t as u32).collect();
        Self::new(ids, batch_size, seq_len, seed, device)
    }

    pub fn batches_per_epoch(&self) -> usize {
        (self.tokens.len() / self.seq_len) / self.batch_size
    }
}

impl BatchSource for TextBatches {
    fn epoch(&mut self, epoch: usize) -> Result<BatchIter<'_>> {
        let mut starts: Vec<usize> = (0..self.tokens.len() / self.seq_len)
            .map(|w| w * self.seq_len)
            .collect();
        self.rng.shuffle(&mut starts);
        debug!(epoch, windows = starts.len(), "shuffled corpus windows");

        let (bs, sl) = (self.batch_size, self.seq_len);
        let tokens = &self.tokens;
        let device = &self.device;
        let n_batches = starts.len() / bs;
        let iter = (0..n_batches).map(move |b| {
            let mut ids = Vec::with_capacity(bs * sl);
            for &s in &starts[b * bs..(b + 1) * bs] {
                ids.extend_from_slice(&tokens[s..s + sl]);
            }
            Batch::new(Tensor::from_vec(ids, (bs, sl), device)?)
        });
        Ok(Box::new(iter))
    }
}
