//! Sparse bilinear dictionaries for attention scores.
//!
//! A [`model::SparseQk`] learns over-complete query and key feature
//! directions whose pairwise products, decoded per head, reconstruct the
//! `q·kᵀ / sqrt(d_head)` scores of one layer of a frozen transformer.
//! [`train::train`] drives it from any [`reference::ReferenceModel`] and any
//! [`data::BatchSource`], reporting to a [`metrics::MetricsSink`].

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod optimizer;
pub mod reference;
pub mod rng;
pub mod tokenizer;
pub mod train;

pub use config::{ReferenceConfig, RunConfig, SparseQkConfig, TrainConfig};
pub use error::{Result, SqkError};
pub use model::{SparseOutput, SparseQk};
pub use train::{train, train_sparse_qk, train_step, TrainOutcome};
