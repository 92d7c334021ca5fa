/* ------------------------------------------------------------------ */
/* Feature statistics and per-step metric sinks                      */
/* ------------------------------------------------------------------ */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{Result, SqkError};

// ── Running feature statistics ────────────────────────────────────────────

/// Per-feature fire totals and the number of (query, key) position pairs
/// seen so far. Both only ever grow.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStats {
    pub totals:      Vec<f64>,
    pub token_pairs: u64,
}

impl FeatureStats {
    pub fn new(d_hidden: usize) -> Self {
        Self { totals: vec![0.0; d_hidden], token_pairs: 0 }
    }

    pub fn record(&mut self, fires_per_feature: &[f32], token_pairs: u64) -> Result<()> {
        if fires_per_feature.len() != self.totals.len() {
            return Err(SqkError::Shape(format!(
                "{} feature counts for {} features", fires_per_feature.len(), self.totals.len()
            )));
        }
        for (t, &f) in self.totals.iter_mut().zip(fires_per_feature) {
            *t += f as f64;
        }
        self.token_pairs += token_pairs;
        Ok(())
    }

    /// Fraction of token pairs on which each feature fired. All zero before any data.
    pub fn frequencies(&self) -> Vec<f64> {
        if self.token_pairs == 0 {
            return vec![0.0; self.totals.len()];
        }
        let n = self.token_pairs as f64;
        self.totals.iter().map(|t| t / n).collect()
    }

    pub fn dead_features(&self, threshold: f64) -> usize {
        self.frequencies().iter().filter(|&&f| f < threshold).count()
    }
}

// ── Step metrics ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepMetrics {
    pub recons_score:  f32,
    pub loss:          f32,
    pub reg_loss:      f32,
    pub l0:            f32,
    pub dead_features: usize,
}

pub trait MetricsSink {
    fn init(&mut self, project: &str, namespace: &str) -> Result<()>;
    fn log(&mut self, metrics: &StepMetrics) -> Result<()>;
}

/// Emits one structured log line per step at `info`.
#[derive(Default)]
pub struct TracingSink {
    run: String,
}

impl MetricsSink for TracingSink {
    fn init(&mut self, project: &str, namespace: &str) -> Result<()> {
        self.run = format!("{namespace}/{project}");
        info!(run = %self.run, "metrics run started");
        Ok(())
    }

    fn log(&mut self, m: &StepMetrics) -> Result<()> {
        info!(
            run = %self.run,
            recons_score = m.recons_score,
            loss = m.loss,
            reg_loss = m.reg_loss,
            l0 = m.l0,
            dead_features = m.dead_features,
            "step"
        );
        Ok(())
    }
}

/// One JSON object per line: a header on `init`, then one record per step.
pub struct JsonlSink {
    out: BufWriter<File>,
    step: usize,
}

#[derive(Serialize)]
struct JsonlHeader<'a> {
    project: &'a str,
    namespace: &'a str,
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    step: usize,
    #[serde(flatten)]
    metrics: &'a StepMetrics,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path)
            .map_err(|e| SqkError::Metrics(format!("{}: {e}", path.display())))?;
        Ok(Self { out: BufWriter::new(f), step: 0 })
    }
}

impl MetricsSink for JsonlSink {
    fn init(&mut self, project: &str, namespace: &str) -> Result<()> {
        serde_json::to_writer(&mut self.out, &JsonlHeader { project, namespace })?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        serde_json::to_writer(&mut self.out, &JsonlRecord { step: self.step, metrics })?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.step += 1;
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    pub run: Option<(String, String)>,
    pub records: Vec<StepMetrics>,
}

impl MetricsSink for MemorySink {
    fn init(&mut self, project: &str, namespace: &str) -> Result<()> {
        self.run = Some((project.to_string(), namespace.to_string()));
        Ok(())
    }

    fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.records.push(*metrics);
        Ok(())
    }
}

/// Fans every call out to several sinks.
pub struct Tee(pub Vec<Box<dyn MetricsSink>>);

impl MetricsSink for Tee {
    fn init(&mut self, project: &str, namespace: &str) -> Result<()> {
        self.0.iter_mut().try_for_each(|s| s.init(project, namespace))
    }

    fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.0.iter_mut().try_for_each(|s| s.log(metrics))
    }
}
