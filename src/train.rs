/* ------------------------------------------------------------------ */
/* Training loop: reference scores, losses, one step, all epochs     */
/* ------------------------------------------------------------------ */

use candle_core::{DType, Tensor};
use tracing::{info, warn};

use crate::config::{SparseQkConfig, TrainConfig};
use crate::data::{Batch, BatchSource};
use crate::error::{Result, SqkError};
use crate::metrics::{FeatureStats, MetricsSink, StepMetrics};
use crate::model::SparseQk;
use crate::ops::scalar;
use crate::optimizer::{AdamW, ParamOptimizer};
use crate::reference::{ActivationCache, Hook, ReferenceModel};

pub struct TrainOutcome {
    pub model: SparseQk,
    pub stats: FeatureStats,
    pub steps: usize,
    pub last:  Option<StepMetrics>,
}

/* ------------------------------------------------------------------ */
/* Ground truth and losses                                            */
/* ------------------------------------------------------------------ */

/// Residual stream entering `layer`, divided by the layer's pre-attention scale.
pub fn normalized_resid(cache: &ActivationCache, layer: usize) -> Result<Tensor> {
    let resid = cache.get(Hook::ResidPre, layer)?;
    let scale = cache.get(Hook::Ln1Scale, layer)?;
    Ok(resid.broadcast_div(scale)?)
}

/// q·kᵀ / sqrt(d_head) for `layer`, laid out `[batch, n_heads, pos_q, pos_k]`.
pub fn reference_scores(cache: &ActivationCache, layer: usize, d_head: usize) -> Result<Tensor> {
    let q = cache.get(Hook::Q, layer)?;
    let k = cache.get(Hook::K, layer)?;
    if q.dims() != k.dims() || q.rank() != 4 {
        return Err(SqkError::Shape(format!(
            "q {:?} and k {:?} must both be [batch, pos, n_heads, d_head]", q.dims(), k.dims()
        )));
    }
    let qh = q.transpose(1, 2)?.contiguous()?;
    let kh = k.transpose(1, 2)?.contiguous()?;
    Ok(qh.matmul(&kh.t()?)?.affine(1.0 / (d_head as f64).sqrt(), 0.0)?)
}

/// Σ |truth| · (pred − truth)², averaged over every score cell.
pub fn reconstruction_loss(pred: &Tensor, truth: &Tensor) -> Result<Tensor> {
    if pred.dims() != truth.dims() {
        return Err(SqkError::Shape(format!(
            "reconstructed scores {:?} vs reference {:?}", pred.dims(), truth.dims()
        )));
    }
    let cells = pred.elem_count() as f64;
    let weighted = (truth.abs()? * (pred - truth)?.sqr()?)?;
    Ok(weighted.sum_all()?.affine(1.0 / cells, 0.0)?)
}

/// Average number of features firing per (query, key) pair, plus the per-feature counts.
pub fn fire_summary(fires: &Tensor) -> Result<(f32, Vec<f32>)> {
    let (batch, seq_q, seq_k, _) = fires.dims4()?;
    let per_feature: Vec<f32> = fires.to_dtype(DType::F32)?.sum((0, 1, 2))?.to_vec1()?;
    let total: f32 = per_feature.iter().sum();
    Ok((total / (batch * seq_q * seq_k) as f32, per_feature))
}

/* ------------------------------------------------------------------ */
/* One optimizer step                                                 */
/* ------------------------------------------------------------------ */

fn check_compatible(
    reference: &dyn ReferenceModel,
    model: &SparseQkConfig,
    cfg: &TrainConfig,
) -> Result<()> {
    for (name, layer) in [("layer", cfg.layer), ("qk_layer", cfg.qk_layer())] {
        if layer >= reference.n_layers() {
            return Err(SqkError::Config(format!(
                "{name} {layer} out of range for a {}-layer reference model", reference.n_layers()
            )));
        }
    }
    let pairs = [
        ("d_model", model.d_model, reference.d_model()),
        ("n_heads", model.n_heads, reference.n_heads()),
        ("d_head", model.d_head, reference.d_head()),
    ];
    for (name, ours, theirs) in pairs {
        if ours != theirs {
            return Err(SqkError::Shape(format!(
                "{name} is {ours} but the reference model has {theirs}"
            )));
        }
    }
    Ok(())
}

/// Renormalize, run the reference model, take one optimizer step and fold
/// this batch into `stats`. The updated stats are handed back with the metrics.
pub fn train_step(
    model: &SparseQk,
    reference: &dyn ReferenceModel,
    opt: &mut dyn ParamOptimizer,
    cfg: &TrainConfig,
    batch: &Batch,
    mut stats: FeatureStats,
) -> Result<(FeatureStats, StepMetrics)> {
    model.renorm_weights()?;

    let cache = reference.run_with_cache(&batch.tokens)?;
    let x = normalized_resid(&cache, cfg.layer)?.to_device(&model.device)?;
    let truth = reference_scores(&cache, cfg.qk_layer(), model.cfg.d_head)?
        .to_device(&model.device)?;
    drop(cache);

    let out = model.forward(&x, false)?;
    let recon = reconstruction_loss(&out.scores, &truth)?;
    let loss = (&recon + &out.reg_loss)?;

    let loss_value = scalar(&loss)?;
    if !loss_value.is_finite() {
        warn!(loss = loss_value, "non-finite loss; this step will corrupt the parameters");
    }

    let grads = loss.backward()?;
    opt.step(&model.vars(), &grads)?;

    let (l0, per_feature) = fire_summary(&out.fires)?;
    stats.record(&per_feature, batch.token_pairs())?;

    let metrics = StepMetrics {
        recons_score:  scalar(&recon)?,
        loss:          loss_value,
        reg_loss:      scalar(&out.reg_loss)?,
        l0,
        dead_features: stats.dead_features(model.cfg.dead_freq),
    };
    Ok((stats, metrics))
}

/* ------------------------------------------------------------------ */
/* Main training loop                                                 */
/* ------------------------------------------------------------------ */

/// Build a fresh model and AdamW, then run `train`.
pub fn train_sparse_qk(
    reference: &dyn ReferenceModel,
    model_cfg: SparseQkConfig,
    cfg: &TrainConfig,
    data: &mut dyn BatchSource,
    sink: &mut dyn MetricsSink,
) -> Result<TrainOutcome> {
    let model = SparseQk::new(model_cfg)?;
    let mut opt = AdamW::new(cfg.learning_rate, cfg.weight_decay);
    train(reference, model, &mut opt, cfg, data, sink)
}

pub fn train(
    reference: &dyn ReferenceModel,
    model: SparseQk,
    opt: &mut dyn ParamOptimizer,
    cfg: &TrainConfig,
    data: &mut dyn BatchSource,
    sink: &mut dyn MetricsSink,
) -> Result<TrainOutcome> {
    cfg.validate()?;
    check_compatible(reference, &model.cfg, cfg)?;

    info!(
        features = model.cfg.d_hidden,
        params = model.param_count(),
        layer = cfg.layer,
        qk_layer = cfg.qk_layer(),
        epochs = cfg.n_epochs,
        lr = opt.learning_rate(),
        "Training model with {} feature pairs.", model.cfg.d_hidden
    );
    sink.init(&cfg.project, &cfg.namespace)?;

    let mut stats = FeatureStats::new(model.cfg.d_hidden);
    let mut steps = 0usize;
    let mut last: Option<StepMetrics> = None;

    for epoch in 0..cfg.n_epochs {
        let mut epoch_steps = 0usize;
        for batch in data.epoch(epoch)?.take(cfg.max_batches_per_epoch) {
            let batch = batch?;
            let (next, metrics) = train_step(&model, reference, opt, cfg, &batch, stats)?;
            stats = next;
            sink.log(&metrics)?;
            last = Some(metrics);
            steps += 1;
            epoch_steps += 1;
        }

        match last {
            Some(m) if epoch_steps > 0 => {
                info!(
                    "Epoch {epoch} reconstruction loss: {} l0: {} reg_loss {}",
                    m.recons_score, m.l0, m.reg_loss
                );
                info!("Epoch {epoch} loss: {}", m.loss);
            }
            _ => warn!(epoch, "data source produced no batches"),
        }
    }

    info!(steps, dead = last.map_or(0, |m| m.dead_features), "training complete");
    Ok(TrainOutcome { model, stats, steps, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use crate::optimizer::Sgd;
    use crate::reference::{GptDims, TinyGpt};
    use candle_core::Device;

    fn gpt() -> TinyGpt {
        let dims = GptDims { vocab_size: 13, n_embd: 8, n_head: 2, n_layer: 2, block_size: 16 };
        TinyGpt::random(dims, 21, &Device::Cpu).unwrap()
    }

    fn model_cfg() -> SparseQkConfig {
        SparseQkConfig {
            d_hidden:  6,
            n_heads:   2,
            d_head:    4,
            d_model:   8,
            reg_coeff: 1e-3,
            eps:       1e-6,
            seed:      4,
            device:    "cpu".into(),
            dead_freq: 1e-2,
        }
    }

    fn batch(seed: u32) -> Batch {
        let ids: Vec<u32> = (0..2 * 5).map(|i| (i * 7 + seed) % 13).collect();
        Batch::new(Tensor::from_vec(ids, (2, 5), &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn reference_scores_match_the_models_own_attention() {
        let g = gpt();
        let cache = g.run_with_cache(&batch(0).tokens).unwrap();
        let ours: Vec<f32> = reference_scores(&cache, 1, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let theirs: Vec<f32> = cache.get(Hook::AttnScores, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in ours.iter().zip(theirs.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn reconstruction_loss_weights_by_truth_magnitude() {
        let dev = Device::Cpu;
        let truth = Tensor::new(&[[[[2.0f32, 0.0], [-1.0, 4.0]]]], &dev).unwrap();
        let pred = Tensor::new(&[[[[1.0f32, 5.0], [-1.0, 2.0]]]], &dev).unwrap();
        // |2|·1 + |0|·25 + |−1|·0 + |4|·4 = 18, over 4 cells
        let l = reconstruction_loss(&pred, &truth).unwrap().to_scalar::<f32>().unwrap();
        assert!((l - 4.5).abs() < 1e-6);
        let zero = reconstruction_loss(&truth, &truth).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(zero, 0.0);
    }

    #[test]
    fn reconstruction_loss_rejects_shape_mismatch() {
        let a = Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(reconstruction_loss(&a, &b), Err(SqkError::Shape(_))));
    }

    #[test]
    fn step_updates_stats_and_keeps_l0_in_range() {
        let g = gpt();
        let model = SparseQk::new(model_cfg()).unwrap();
        let mut opt = Sgd::new(0.01);
        let cfg = TrainConfig { layer: 1, ..Default::default() };

        let mut stats = FeatureStats::new(6);
        for s in 0..3 {
            let (next, m) = train_step(&model, &g, &mut opt, &cfg, &batch(s), stats).unwrap();
            assert!(m.loss.is_finite());
            assert!(m.reg_loss >= 0.0);
            assert!((0.0..=6.0).contains(&m.l0), "l0 {}", m.l0);
            assert!(m.dead_features <= 6);
            stats = next;
        }
        assert_eq!(stats.token_pairs, 3 * 2 * 25);
        assert!(stats.frequencies().iter().all(|f| (0.0..=1.0).contains(f)));
    }

    #[test]
    fn incompatible_reference_is_rejected_up_front() {
        let g = gpt();
        let mut sink = MemorySink::default();
        let mut data = vec![batch(0)];

        let cfg = TrainConfig { layer: 5, ..Default::default() };
        let err = train_sparse_qk(&g, model_cfg(), &cfg, &mut data, &mut sink).err().unwrap();
        assert!(matches!(err, SqkError::Config(_)));

        let cfg = TrainConfig { layer: 0, ..Default::default() };
        let wrong = SparseQkConfig { d_model: 9, ..model_cfg() };
        let err = train_sparse_qk(&g, wrong, &cfg, &mut data, &mut sink).err().unwrap();
        assert!(matches!(err, SqkError::Shape(_)));
        assert!(sink.records.is_empty());
    }

    #[test]
    fn loop_caps_batches_and_logs_every_step() {
        let g = gpt();
        let mut sink = MemorySink::default();
        let mut data: Vec<Batch> = (0..5).map(batch).collect();
        let cfg = TrainConfig {
            layer: 0,
            qk_layer: Some(1),
            n_epochs: 2,
            max_batches_per_epoch: 3,
            project: "p".into(),
            namespace: "n".into(),
            ..Default::default()
        };
        let out = train_sparse_qk(&g, model_cfg(), &cfg, &mut data, &mut sink).unwrap();
        assert_eq!(out.steps, 6);
        assert_eq!(sink.records.len(), 6);
        assert_eq!(sink.run, Some(("p".to_string(), "n".to_string())));
        assert_eq!(out.stats.token_pairs, 6 * 2 * 25);
        assert_eq!(out.last, sink.records.last().copied());
    }
}
