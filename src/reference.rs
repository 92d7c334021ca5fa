/* ------------------------------------------------------------------ */
/* Frozen reference transformer and its activation cache             */
/* ------------------------------------------------------------------ */
//
// The sparse model never looks inside the reference model; it only reads
// the cache returned by `run_with_cache`. Any transformer that can fill the
// four hooks below for a layer can be plugged in through `ReferenceModel`.
//
// The bundled `TinyGpt` is a pre-norm decoder: RMSNorm → causal MHA →
// residual → RMSNorm → squared-ReLU MLP → residual, learned token and
// position embeddings. Weights are frozen; nothing here tracks gradients.

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{Linear, Module};
use tracing::debug;

use crate::config::IGNORE;
use crate::error::{Result, SqkError};
use crate::ops::{masked_fill, rms_scale, squared_relu};
use crate::rng::Rng;

// ── Activation cache ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Residual stream entering the block, `[batch, pos, d_model]`.
    ResidPre,
    /// Pre-attention normalization divisor, `[batch, pos, 1]`.
    Ln1Scale,
    /// Queries, `[batch, pos, n_heads, d_head]`.
    Q,
    /// Keys, `[batch, pos, n_heads, d_head]`.
    K,
    /// Scaled, unmasked q·k, `[batch, n_heads, pos_q, pos_k]`. Nothing in
    /// training reads it; it is kept to check ground-truth scores rebuilt
    /// from `Q` and `K` against the scores the model actually attended with.
    AttnScores,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::ResidPre   => "resid_pre",
            Hook::Ln1Scale   => "ln1.hook_scale",
            Hook::Q          => "q",
            Hook::K          => "k",
            Hook::AttnScores => "attn_scores",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
pub struct ActivationCache {
    entries: HashMap<(Hook, usize), Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, hook: Hook, layer: usize, t: Tensor) {
        self.entries.insert((hook, layer), t);
    }

    pub fn get(&self, hook: Hook, layer: usize) -> Result<&Tensor> {
        self.entries.get(&(hook, layer)).ok_or_else(|| SqkError::MissingActivation {
            hook: hook.to_string(),
            layer,
        })
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

pub trait ReferenceModel {
    /// Run `tokens` (`[batch, seq]`, u32) and return every cached activation.
    fn run_with_cache(&self, tokens: &Tensor) -> Result<ActivationCache>;

    fn n_layers(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn d_head(&self) -> usize;
    fn d_model(&self) -> usize;
}

// ── TinyGpt ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptDims {
    pub vocab_size: usize,
    pub n_embd:     usize,
    pub n_head:     usize,
    pub n_layer:    usize,
    pub block_size: usize,
}

impl GptDims {
    pub fn head_dim(&self) -> usize { self.n_embd / self.n_head }
    pub fn mlp_dim(&self) -> usize { 4 * self.n_embd }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(SqkError::Config(format!(
                "n_embd {} must be a positive multiple of n_head {}", self.n_embd, self.n_head
            )));
        }
        if self.vocab_size == 0 || self.n_layer == 0 || self.block_size == 0 {
            return Err(SqkError::Config("reference dims must be > 0".into()));
        }
        Ok(())
    }
}

/// Bias-free projections of one block; weights are `[nout, nin]`.
pub struct BlockWeights {
    pub wq:  Linear,
    pub wk:  Linear,
    pub wv:  Linear,
    pub wo:  Linear,
    pub fc1: Linear,
    pub fc2: Linear,
}

impl BlockWeights {
    /// Weights in checkpoint order.
    pub fn weights(&self) -> [&Tensor; 6] {
        [&self.wq, &self.wk, &self.wv, &self.wo, &self.fc1, &self.fc2].map(|l| l.weight())
    }
}

pub struct TinyGpt {
    pub dims:   GptDims,
    pub wte:    Tensor,  // [vocab, n_embd]
    pub wpe:    Tensor,  // [block_size, n_embd]
    pub blocks: Vec<BlockWeights>,
    pub device: Device,
}

/// Flat host-side weights in checkpoint order.
pub struct FlatWeights {
    pub wte: Vec<f32>,
    pub wpe: Vec<f32>,
    /// Per layer: wq, wk, wv, wo, fc1, fc2.
    pub layers: Vec<[Vec<f32>; 6]>,
}

impl TinyGpt {
    /// GPT-2 style init: std 0.02 on inputs, 0.02/sqrt(2·n_layer) on output projections.
    pub fn random(dims: GptDims, seed: u64, device: &Device) -> Result<Self> {
        dims.validate()?;
        let mut rng = Rng::new(seed);
        let mut gauss = |n: usize, std: f32| -> Vec<f32> {
            (0..n).map(|_| rng.gauss(0.0, std)).collect()
        };

        let e = dims.n_embd;
        let m = dims.mlp_dim();
        let std_in  = 0.02;
        let std_out = 0.02 / (2.0 * dims.n_layer as f32).sqrt();

        let wte = gauss(dims.vocab_size * e, 0.02);
        let wpe = gauss(dims.block_size * e, 0.01);
        let layers = (0..dims.n_layer)
            .map(|_| [
                gauss(e * e, std_in),
                gauss(e * e, std_in),
                gauss(e * e, std_in),
                gauss(e * e, std_out),
                gauss(m * e, std_in),
                gauss(e * m, std_out),
            ])
            .collect();

        Self::from_flat(dims, FlatWeights { wte, wpe, layers }, device)
    }

    pub fn from_flat(dims: GptDims, w: FlatWeights, device: &Device) -> Result<Self> {
        dims.validate()?;
        if w.layers.len() != dims.n_layer {
            return Err(SqkError::Shape(format!(
                "{} layer weight sets for {} layers", w.layers.len(), dims.n_layer
            )));
        }
        let e = dims.n_embd;
        let m = dims.mlp_dim();
        let wte = Tensor::from_vec(w.wte, (dims.vocab_size, e), device)?;
        let wpe = Tensor::from_vec(w.wpe, (dims.block_size, e), device)?;

        let proj = |w: Vec<f32>, nout: usize, nin: usize| -> Result<Linear> {
            Ok(Linear::new(Tensor::from_vec(w, (nout, nin), device)?, None))
        };
        let blocks = w.layers
            .into_iter()
            .map(|[wq, wk, wv, wo, fc1, fc2]| -> Result<BlockWeights> {
                Ok(BlockWeights {
                    wq:  proj(wq, e, e)?,
                    wk:  proj(wk, e, e)?,
                    wv:  proj(wv, e, e)?,
                    wo:  proj(wo, e, e)?,
                    fc1: proj(fc1, m, e)?,
                    fc2: proj(fc2, e, m)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { dims, wte, wpe, blocks, device: device.clone() })
    }

    pub fn param_count(&self) -> usize {
        let per_block: usize = self.blocks.first().map_or(0, |b| {
            b.weights().iter().map(|t| t.elem_count()).sum()
        });
        self.wte.elem_count() + self.wpe.elem_count() + per_block * self.blocks.len()
    }

    // [b, s, n_embd] → [b, s, n_head, head_dim]
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        Ok(x.reshape((b, s, self.dims.n_head, self.dims.head_dim()))?)
    }
}

impl ReferenceModel for TinyGpt {
    fn run_with_cache(&self, tokens: &Tensor) -> Result<ActivationCache> {
        let (batch, seq) = tokens.dims2().map_err(|_| {
            SqkError::Shape(format!("tokens must be [batch, seq], got {:?}", tokens.dims()))
        })?;
        if seq > self.dims.block_size {
            return Err(SqkError::Shape(format!(
                "sequence length {seq} exceeds block size {}", self.dims.block_size
            )));
        }
        let e  = self.dims.n_embd;
        let nh = self.dims.n_head;
        let hd = self.dims.head_dim();
        let scale = 1.0 / (hd as f64).sqrt();

        let ids = tokens.to_dtype(DType::U32)?.flatten_all()?.to_device(&self.device)?;
        let tok = self.wte.index_select(&ids, 0)?.reshape((batch, seq, e))?;
        let mut x = tok.broadcast_add(&self.wpe.narrow(0, 0, seq)?)?;

        let mut cache = ActivationCache::new();

        for (li, blk) in self.blocks.iter().enumerate() {
            cache.insert(Hook::ResidPre, li, x.clone());

            // Attention pre-norm
            let ln1 = rms_scale(&x)?;
            let xn = x.broadcast_div(&ln1)?;
            cache.insert(Hook::Ln1Scale, li, ln1);

            let q = self.split_heads(&blk.wq.forward(&xn)?)?;
            let k = self.split_heads(&blk.wk.forward(&xn)?)?;
            let v = self.split_heads(&blk.wv.forward(&xn)?)?;

            // [b, nh, s, hd]
            let qh = q.transpose(1, 2)?.contiguous()?;
            let kh = k.transpose(1, 2)?.contiguous()?;
            let vh = v.transpose(1, 2)?.contiguous()?;
            cache.insert(Hook::Q, li, q);
            cache.insert(Hook::K, li, k);

            let scores = qh.matmul(&kh.t()?)?.affine(scale, 0.0)?;
            let weights = softmax_last_dim(&masked_fill(&scores, IGNORE)?)?;
            cache.insert(Hook::AttnScores, li, scores);

            let attn = weights
                .matmul(&vh)?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch, seq, nh * hd))?;
            x = (x + blk.wo.forward(&attn)?)?;

            // MLP pre-norm, squared ReLU
            let xn = x.broadcast_div(&rms_scale(&x)?)?;
            let h = squared_relu(&blk.fc1.forward(&xn)?)?;
            x = (x + blk.fc2.forward(&h)?)?;
        }

        debug!(batch, seq, entries = cache.len(), "reference forward cached");
        Ok(cache)
    }

    fn n_layers(&self) -> usize { self.dims.n_layer }
    fn n_heads(&self) -> usize { self.dims.n_head }
    fn d_head(&self) -> usize { self.dims.head_dim() }
    fn d_model(&self) -> usize { self.dims.n_embd }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> GptDims {
        GptDims { vocab_size: 11, n_embd: 8, n_head: 2, n_layer: 2, block_size: 16 }
    }

    fn tokens(batch: usize, seq: usize) -> Tensor {
        let ids: Vec<u32> = (0..batch * seq).map(|i| (i % 11) as u32).collect();
        Tensor::from_vec(ids, (batch, seq), &Device::Cpu).unwrap()
    }

    #[test]
    fn cache_has_every_hook_for_every_layer() {
        let gpt = TinyGpt::random(dims(), 5, &Device::Cpu).unwrap();
        let cache = gpt.run_with_cache(&tokens(3, 6)).unwrap();
        assert_eq!(cache.len(), 5 * 2);
        for li in 0..2 {
            assert_eq!(cache.get(Hook::ResidPre, li).unwrap().dims(), &[3, 6, 8]);
            assert_eq!(cache.get(Hook::Ln1Scale, li).unwrap().dims(), &[3, 6, 1]);
            assert_eq!(cache.get(Hook::Q, li).unwrap().dims(), &[3, 6, 2, 4]);
            assert_eq!(cache.get(Hook::K, li).unwrap().dims(), &[3, 6, 2, 4]);
            assert_eq!(cache.get(Hook::AttnScores, li).unwrap().dims(), &[3, 2, 6, 6]);
        }
    }

    #[test]
    fn missing_layer_is_an_error() {
        let gpt = TinyGpt::random(dims(), 5, &Device::Cpu).unwrap();
        let cache = gpt.run_with_cache(&tokens(1, 4)).unwrap();
        let err = cache.get(Hook::Q, 7).unwrap_err();
        assert!(matches!(err, SqkError::MissingActivation { layer: 7, .. }));
        assert!(err.to_string().contains("`q`"));
    }

    #[test]
    fn normalized_residual_has_unit_rms() {
        let gpt = TinyGpt::random(dims(), 5, &Device::Cpu).unwrap();
        let cache = gpt.run_with_cache(&tokens(2, 5)).unwrap();
        let xn = crate::train::normalized_resid(&cache, 0).unwrap();
        // eps in the scale keeps this slightly under 1 for small activations
        let ms = xn.sqr().unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(ms > 0.9 && ms <= 1.0 + 1e-5, "mean square {ms}");
    }

    #[test]
    fn attention_is_causal() {
        // Changing only the last token must leave every earlier position alone.
        let gpt = TinyGpt::random(dims(), 5, &Device::Cpu).unwrap();
        let a = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 2, 3, 9]], &Device::Cpu).unwrap();
        let ra = gpt.run_with_cache(&a).unwrap();
        let rb = gpt.run_with_cache(&b).unwrap();
        let head = |c: &ActivationCache| -> Vec<f32> {
            c.get(Hook::ResidPre, 1).unwrap().narrow(1, 0, 3).unwrap()
                .flatten_all().unwrap().to_vec1().unwrap()
        };
        let drift = head(&ra).iter().zip(head(&rb)).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max);
        assert!(drift < 1e-6, "earlier positions moved by {drift}");
        let last = |c: &ActivationCache| -> Vec<f32> {
            c.get(Hook::ResidPre, 1).unwrap().narrow(1, 3, 1).unwrap()
                .flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_ne!(last(&ra), last(&rb));
    }

    #[test]
    fn rejects_sequences_longer_than_block() {
        let gpt = TinyGpt::random(dims(), 5, &Device::Cpu).unwrap();
        assert!(matches!(gpt.run_with_cache(&tokens(1, 17)), Err(SqkError::Shape(_))));
    }

    #[test]
    fn random_init_is_seeded() {
        let a = TinyGpt::random(dims(), 9, &Device::Cpu).unwrap();
        let b = TinyGpt::random(dims(), 9, &Device::Cpu).unwrap();
        let va: Vec<f32> = a.wte.flatten_all().unwrap().to_vec1().unwrap();
        let vb: Vec<f32> = b.wte.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(va, vb);
        assert_eq!(a.param_count(), 11 * 8 + 16 * 8 + 2 * (4 * 64 + 2 * 32 * 8));
    }

    #[test]
    fn bad_dims_rejected() {
        let d = GptDims { n_head: 3, ..dims() };
        assert!(TinyGpt::random(d, 1, &Device::Cpu).is_err());
    }
}
