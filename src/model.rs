/* ------------------------------------------------------------------ */
/* SparseQk: sparse bilinear reconstruction of attention scores      */
/* ------------------------------------------------------------------ */
//
//   q    = ReLU(x · W_encQ + b_encQ)                  [batch, seq, d_hidden]
//   k    = ReLU(x · W_encK + b_encK)                  [batch, seq, d_hidden]
//   acts = q[:, i, None, :] * k[:, None, j, :]        [batch, seq_q, seq_k, d_hidden]
//   out  = acts · W_dec / sqrt(d_head) + b_dec        [batch, n_heads, seq_q, seq_k]
//
// Weight layout follows the activation: W_encQ/W_encK are [d_model, d_hidden]
// (one column per feature), W_dec is [d_hidden, n_heads].

use candle_core::{DType, Device, Tensor, Var};
use tracing::debug;

use crate::config::{SparseQkConfig, IGNORE};
use crate::device::select_device;
use crate::error::{Result, SqkError};
use crate::ops::{column_norms, masked_fill};
use crate::rng::Rng;

/// Output of one forward pass.
pub struct SparseOutput {
    /// `[batch, n_heads, seq_q, seq_k]`
    pub scores: Tensor,
    /// Scalar `reg_coeff * sum(sqrt(|acts| + eps))`, part of the autograd graph.
    pub reg_loss: Tensor,
    /// `[batch, seq_q, seq_k, d_hidden]` as u8: 1 where the joint activation is > 0.
    pub fires: Tensor,
}

pub struct SparseQk {
    pub cfg: SparseQkConfig,
    pub device: Device,

    pub w_enc_q: Var,
    pub w_enc_k: Var,
    pub w_dec: Var,
    pub b_enc_q: Var,
    pub b_enc_k: Var,
    pub b_dec: Var,
}

impl SparseQk {
    pub fn new(cfg: SparseQkConfig) -> Result<Self> {
        let device = select_device(&cfg.device)?;
        Self::with_device(cfg, device)
    }

    /// Same as `new`, but on an explicit device instead of `cfg.device`.
    pub fn with_device(cfg: SparseQkConfig, device: Device) -> Result<Self> {
        cfg.validate()?;
        let mut rng = Rng::new(cfg.seed);
        let (d_model, d_hidden, n_heads) = (cfg.d_model, cfg.d_hidden, cfg.n_heads);

        // fan_in is the second dimension of each matrix
        let mut kaiming = |rows: usize, cols: usize| -> Result<Var> {
            let data = rng.kaiming_uniform(rows * cols, cols);
            Ok(Var::from_tensor(&Tensor::from_vec(data, (rows, cols), &device)?)?)
        };
        let w_enc_q = kaiming(d_model, d_hidden)?;
        let w_enc_k = kaiming(d_model, d_hidden)?;
        let w_dec   = kaiming(d_hidden, n_heads)?;

        let b_enc_q = Var::zeros(d_hidden, DType::F32, &device)?;
        let b_enc_k = Var::zeros(d_hidden, DType::F32, &device)?;
        let b_dec   = Var::zeros(n_heads, DType::F32, &device)?;

        debug!(d_model, d_hidden, n_heads, seed = cfg.seed, "initialized sparse QK model");

        Ok(Self { cfg, device, w_enc_q, w_enc_k, w_dec, b_enc_q, b_enc_k, b_dec })
    }

    /// All trainable parameters, in a fixed order.
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.w_enc_q.clone(),
            self.w_enc_k.clone(),
            self.w_dec.clone(),
            self.b_enc_q.clone(),
            self.b_enc_k.clone(),
            self.b_dec.clone(),
        ]
    }

    pub fn param_count(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Feature encodings `(q, k)`, each `[batch, seq, d_hidden]`.
    pub fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, d_model) = x.dims3().map_err(|_| {
            SqkError::Shape(format!("expected [batch, seq, d_model], got {:?}", x.dims()))
        })?;
        if d_model != self.cfg.d_model {
            return Err(SqkError::Shape(format!(
                "input d_model {d_model} != configured {}", self.cfg.d_model
            )));
        }
        let x = x.to_dtype(DType::F32)?;
        let q = x.broadcast_matmul(self.w_enc_q.as_tensor())?
            .broadcast_add(self.b_enc_q.as_tensor())?
            .relu()?;
        let k = x.broadcast_matmul(self.w_enc_k.as_tensor())?
            .broadcast_add(self.b_enc_k.as_tensor())?
            .relu()?;
        Ok((q, k))
    }

    pub fn forward(&self, x: &Tensor, masked: bool) -> Result<SparseOutput> {
        let (q, k) = self.encode(x)?;
        let (batch, seq, d_hidden) = q.dims3()?;

        // [b, q, 1, h] * [b, 1, k, h] → [b, q, k, h]
        let acts = q.unsqueeze(2)?.broadcast_mul(&k.unsqueeze(1)?)?;

        let reg_loss = acts
            .abs()?
            .affine(1.0, self.cfg.eps)?
            .sqrt()?
            .sum_all()?
            .affine(self.cfg.reg_coeff, 0.0)?;

        let fires = acts.gt(0f32)?;

        let scale = 1.0 / (self.cfg.d_head as f64).sqrt();
        let scores = acts
            .reshape((batch * seq * seq, d_hidden))?
            .matmul(self.w_dec.as_tensor())?
            .affine(scale, 0.0)?
            .broadcast_add(self.b_dec.as_tensor())?
            .reshape((batch, seq, seq, self.cfg.n_heads))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let scores = if masked { self.apply_causal_mask(&scores)? } else { scores };

        Ok(SparseOutput { scores, reg_loss, fires })
    }

    /// Replace every cell with key position > query position by `IGNORE`.
    pub fn apply_causal_mask(&self, scores: &Tensor) -> Result<Tensor> {
        masked_fill(scores, IGNORE)
    }

    /// Rescale every column of W_encQ and W_encK to unit L2 norm, each by its own norm.
    pub fn renorm_weights(&self) -> Result<()> {
        for w in [&self.w_enc_q, &self.w_enc_k] {
            let t = w.as_tensor().detach();
            let norms = column_norms(&t)?.clamp(1e-12f32, f32::MAX)?;
            w.set(&t.broadcast_div(&norms)?)?;
        }
        Ok(())
    }
}
