/* ------------------------------------------------------------------ */
/* Optimizers over candle Vars                                       */
/* ------------------------------------------------------------------ */

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW};

use crate::config::{BETA1, BETA2, EPSILON};
use crate::error::Result;

/// One in-place update of `params` from the gradients of the current step.
/// Parameters without a gradient entry are left untouched.
pub trait ParamOptimizer {
    fn step(&mut self, params: &[Var], grads: &GradStore) -> Result<()>;
    fn learning_rate(&self) -> f64;
}

// A candle optimizer, bound to the parameter list of its first step.
struct Bound<O: Optimizer> {
    config: O::Config,
    inner:  Option<O>,
}

impl<O: Optimizer> Bound<O>
where
    O::Config: Clone,
{
    fn new(config: O::Config) -> Self {
        Self { config, inner: None }
    }

    fn step(&mut self, params: &[Var], grads: &GradStore) -> Result<()> {
        let opt = match self.inner.take() {
            Some(opt) => opt,
            None => O::new(params.to_vec(), self.config.clone())?,
        };
        self.inner.insert(opt).step(grads)?;
        Ok(())
    }
}

pub struct Sgd {
    bound: Bound<candle_nn::SGD>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { bound: Bound::new(lr) }
    }
}

impl ParamOptimizer for Sgd {
    fn step(&mut self, params: &[Var], grads: &GradStore) -> Result<()> {
        self.bound.step(params, grads)
    }

    fn learning_rate(&self) -> f64 { self.bound.config }
}

/// Adam with decoupled weight decay; moments live inside `candle_nn::AdamW`.
pub struct AdamW {
    bound: Bound<candle_nn::AdamW>,
}

impl AdamW {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        let params = ParamsAdamW { lr, beta1: BETA1, beta2: BETA2, eps: EPSILON, weight_decay };
        Self { bound: Bound::new(params) }
    }
}

impl ParamOptimizer for AdamW {
    fn step(&mut self, params: &[Var], grads: &GradStore) -> Result<()> {
        self.bound.step(params, grads)
    }

    fn learning_rate(&self) -> f64 { self.bound.config.lr }
}
