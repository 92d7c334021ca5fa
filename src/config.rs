/* ------------------------------------------------------------------ */
/* Hyperparameters, run configuration and global constants           */
/* ------------------------------------------------------------------ */
//
// A run file is JSON with a model section, a train section and an
// optional reference section (geometry of the bundled transformer):
//
//   {
//     "model": { "d_hidden": 3072, "n_heads": 12, "d_head": 64, "d_model": 768,
//                "reg_coeff": 1e-4, "eps": 1e-6, "seed": 42, "device": "cuda",
//                "dead_freq": 1e-6 },
//     "train": { "n_epochs": 1, "layer": 10, ... },
//     "reference": { "n_embd": 768, "n_head": 12, "n_layer": 12, ... }
//   }
//
// The model section is validated once, when SparseQk is constructed.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SqkError};

// ── Sparse model ──────────────────────────────────────────────────────────

/// Score written into causally masked cells (key position after query position).
pub const IGNORE: f32 = -1e6;

/// Keys every model section must carry.
pub const MODEL_KEYS: [&str; 9] = [
    "d_hidden", "n_heads", "d_head", "d_model", "reg_coeff", "eps", "seed", "device", "dead_freq",
];

// ── Training ──────────────────────────────────────────────────────────────

pub const MAX_BATCHES_PER_EPOCH: usize = 10_000;
pub const LEARNING_RATE: f64 = 1e-3;
pub const WEIGHT_DECAY: f64  = 0.01;  // AdamW default decay
pub const BETA1: f64 = 0.9;
pub const BETA2: f64 = 0.999;
pub const EPSILON: f64 = 1e-8;
pub const BATCH_SIZE: usize = 8;
pub const SEQ_LEN: usize = 64;

pub const PROJECT: &str   = "sparse_QK_L0.5";
pub const NAMESPACE: &str = "default";

// ── Reference model ───────────────────────────────────────────────────────

pub const RMS_EPS: f32 = 1e-5;

/* ------------------------------------------------------------------ */
/* Sparse model configuration                                         */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseQkConfig {
    pub d_hidden:  usize,
    pub n_heads:   usize,
    pub d_head:    usize,
    pub d_model:   usize,
    pub reg_coeff: f64,
    pub eps:       f64,
    pub seed:      u64,
    pub device:    String,
    pub dead_freq: f64,
}

impl SparseQkConfig {
    /// Build from a loose key/value mapping. Every key in `MODEL_KEYS` must be present.
    pub fn from_map(map: &HashMap<String, serde_json::Value>) -> Result<Self> {
        if let Some(missing) = MODEL_KEYS.iter().find(|k| !map.contains_key(**k)) {
            return Err(SqkError::Config(format!("missing required key `{missing}`")));
        }
        let obj: serde_json::Map<String, serde_json::Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| SqkError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("d_hidden", self.d_hidden),
            ("n_heads", self.n_heads),
            ("d_head", self.d_head),
            ("d_model", self.d_model),
        ];
        for (name, v) in positive {
            if v == 0 {
                return Err(SqkError::Config(format!("`{name}` must be > 0")));
            }
        }
        if !self.reg_coeff.is_finite() || self.reg_coeff < 0.0 {
            return Err(SqkError::Config(format!(
                "`reg_coeff` must be finite and >= 0, got {}", self.reg_coeff
            )));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(SqkError::Config(format!("`eps` must be finite and > 0, got {}", self.eps)));
        }
        if !(0.0..=1.0).contains(&self.dead_freq) {
            return Err(SqkError::Config(format!(
                "`dead_freq` must lie in [0, 1], got {}", self.dead_freq
            )));
        }
        if self.device.trim().is_empty() {
            return Err(SqkError::Config("`device` must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for SparseQkConfig {
    // GPT-2 small attention geometry, 4x over-complete.
    fn default() -> Self {
        Self {
            d_hidden:  3072,
            n_heads:   12,
            d_head:    64,
            d_model:   768,
            reg_coeff: 1e-4,
            eps:       1e-6,
            seed:      42,
            device:    "cpu".into(),
            dead_freq: 1e-6,
        }
    }
}

/* ------------------------------------------------------------------ */
/* Training loop configuration                                        */
/* ------------------------------------------------------------------ */

fn default_epochs() -> usize { 1 }
fn default_max_batches() -> usize { MAX_BATCHES_PER_EPOCH }
fn default_lr() -> f64 { LEARNING_RATE }
fn default_weight_decay() -> f64 { WEIGHT_DECAY }
fn default_batch_size() -> usize { BATCH_SIZE }
fn default_seq_len() -> usize { SEQ_LEN }
fn default_project() -> String { PROJECT.into() }
fn default_namespace() -> String { NAMESPACE.into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_epochs")]
    pub n_epochs: usize,
    #[serde(default = "default_max_batches")]
    pub max_batches_per_epoch: usize,
    /// Layer whose pre-attention residual stream feeds the sparse model.
    pub layer: usize,
    /// Attention sublayer whose query/key scores are reconstructed. Defaults to `layer`.
    #[serde(default)]
    pub qk_layer: Option<usize>,
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl TrainConfig {
    pub fn qk_layer(&self) -> usize {
        self.qk_layer.unwrap_or(self.layer)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.seq_len == 0 {
            return Err(SqkError::Config("`batch_size` and `seq_len` must be > 0".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(SqkError::Config(format!(
                "`learning_rate` must be finite and > 0, got {}", self.learning_rate
            )));
        }
        Ok(())
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epochs:              default_epochs(),
            max_batches_per_epoch: default_max_batches(),
            layer:                 0,
            qk_layer:              None,
            learning_rate:         default_lr(),
            weight_decay:          default_weight_decay(),
            batch_size:            default_batch_size(),
            seq_len:               default_seq_len(),
            project:               default_project(),
            namespace:             default_namespace(),
        }
    }
}

/* ------------------------------------------------------------------ */
/* Bundled reference transformer                                      */
/* ------------------------------------------------------------------ */

// vocab_size is not configured: it comes from the corpus tokenizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub n_embd:     usize,
    pub n_head:     usize,
    pub n_layer:    usize,
    pub block_size: usize,
    /// Seed for random weights when no checkpoint is given.
    pub seed:       u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self { n_embd: 64, n_head: 4, n_layer: 2, block_size: 64, seed: 1337 }
    }
}

/* ------------------------------------------------------------------ */
/* Run file                                                           */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: SparseQkConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let raw: serde_json::Value = serde_json::from_str(&json)?;
        let model_map: HashMap<String, serde_json::Value> = raw
            .get("model")
            .and_then(|m| m.as_object())
            .ok_or_else(|| SqkError::Config(format!("{}: missing `model` section", path.display())))?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let model = SparseQkConfig::from_map(&model_map)?;
        let train: TrainConfig = match raw.get("train") {
            Some(t) => serde_json::from_value(t.clone())
                .map_err(|e| SqkError::Config(format!("train section: {e}")))?,
            None => TrainConfig::default(),
        };
        let reference: ReferenceConfig = match raw.get("reference") {
            Some(r) => serde_json::from_value(r.clone())
                .map_err(|e| SqkError::Config(format!("reference section: {e}")))?,
            None => ReferenceConfig::default(),
        };
        Ok(Self { model, train, reference })
    }

    /// A run that fits the bundled reference transformer: the model section
    /// takes its attention geometry from the reference section.
    pub fn for_reference(reference: ReferenceConfig) -> Self {
        let d_head = reference.n_embd / reference.n_head.max(1);
        let model = SparseQkConfig {
            d_hidden: 4 * reference.n_embd,
            n_heads:  reference.n_head,
            d_head,
            d_model:  reference.n_embd,
            ..Default::default()
        };
        let train = TrainConfig {
            layer:   reference.n_layer.saturating_sub(1),
            seq_len: reference.block_size.min(SEQ_LEN),
            ..Default::default()
        };
        Self { model, train, reference }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
