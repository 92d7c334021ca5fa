/* ------------------------------------------------------------------ */
/* Compute device selection                                          */
/* ------------------------------------------------------------------ */
//
// Accepted selectors: "cpu", "cuda", "cuda:N", "metal", "metal:N".
// Accelerator backends that fail to initialize (or panic while doing so,
// which some Metal drivers do) fall back to the CPU with a warning.

use std::panic::{self, AssertUnwindSafe};

use candle_core::Device;
use tracing::{info, warn};

use crate::error::{Result, SqkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

pub fn parse_device(selector: &str) -> Result<DeviceKind> {
    let s = selector.trim().to_ascii_lowercase();
    let (name, ordinal) = match s.split_once(':') {
        Some((name, idx)) => {
            let idx = idx.parse::<usize>().map_err(|_| {
                SqkError::Config(format!("bad device ordinal in `{selector}`"))
            })?;
            (name.to_string(), idx)
        }
        None => (s.clone(), 0),
    };
    match name.as_str() {
        "cpu"  => Ok(DeviceKind::Cpu),
        "cuda" | "gpu" => Ok(DeviceKind::Cuda(ordinal)),
        "metal" | "mps" => Ok(DeviceKind::Metal(ordinal)),
        _ => Err(SqkError::Config(format!("unknown device `{selector}`"))),
    }
}

pub fn select_device(selector: &str) -> Result<Device> {
    let kind = parse_device(selector)?;
    let attempt = match kind {
        DeviceKind::Cpu => return Ok(Device::Cpu),
        DeviceKind::Cuda(i)  => panic::catch_unwind(AssertUnwindSafe(|| Device::new_cuda(i))),
        DeviceKind::Metal(i) => panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(i))),
    };

    match attempt {
        Ok(Ok(dev)) => {
            info!(device = ?dev, "accelerator enabled");
            Ok(dev)
        }
        Ok(Err(e)) => {
            warn!(%selector, error = %e, "accelerator unavailable, using CPU");
            Ok(Device::Cpu)
        }
        Err(_) => {
            warn!(%selector, "accelerator initialization panicked, using CPU");
            Ok(Device::Cpu)
        }
    }
}
