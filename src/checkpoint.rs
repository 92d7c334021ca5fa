/* ------------------------------------------------------------------ */
/* Reference model weights: load / save                              */
/* ------------------------------------------------------------------ */
//
// File format (little-endian):
//   [0..8]   magic      b"RGPT0001"
//   [8..12]  vocab_size u32
//   [12..16] iter       u32
//   [16..20] step       u32
//   [20..24] best_loss  f32
//   [24..]   flat f32 arrays:
//              wte, wpe, lm_head,
//              per layer: wq, wk, wv, wo, fc1, fc2
//            optionally followed by optimizer moments (m and v for every
//            weight array, twice the weight bytes), which are ignored.
// Any other amount of trailing data means the dims do not match the file.
//
// Only the weights needed to reproduce the residual stream and the
// attention inputs are kept; lm_head is skipped.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use candle_core::Device;
use tracing::info;

use crate::error::{Result, SqkError};
use crate::reference::{FlatWeights, GptDims, TinyGpt};

const MAGIC: &[u8; 8] = b"RGPT0001";
const HEADER_BYTES: u64 = 24;

fn bad(path: &Path, reason: impl Into<String>) -> SqkError {
    SqkError::Checkpoint { path: path.display().to_string(), reason: reason.into() }
}

fn write_f32s(buf: &mut Vec<u8>, s: &[f32]) {
    buf.reserve(s.len() * 4);
    for &v in s { buf.extend_from_slice(&v.to_le_bytes()); }
}

fn read_f32_slice<R: Read>(f: &mut R, n: usize) -> std::io::Result<Vec<f32>> {
    let mut raw = vec![0u8; n * 4];
    f.read_exact(&mut raw)?;
    Ok(raw.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Serialize reference weights (lm_head tied to wte) with a zeroed training header.
pub fn serialize_reference(model: &TinyGpt) -> Result<Vec<u8>> {
    let d = model.dims;
    let mut buf: Vec<u8> = Vec::with_capacity(24 + model.param_count() * 4);

    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(d.vocab_size as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&f32::INFINITY.to_le_bytes());

    let wte: Vec<f32> = model.wte.flatten_all()?.to_vec1()?;
    write_f32s(&mut buf, &wte);
    write_f32s(&mut buf, &model.wpe.flatten_all()?.to_vec1::<f32>()?);
    write_f32s(&mut buf, &wte);
    for b in &model.blocks {
        for t in b.weights() {
            write_f32s(&mut buf, &t.flatten_all()?.to_vec1::<f32>()?);
        }
    }
    Ok(buf)
}

/// Atomically flush a buffer to disk (write to .tmp then rename).
pub fn flush_checkpoint(path: &Path, buf: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(buf)?;
        f.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// Bytes of the weight arrays (lm_head included) for `dims`.
fn weight_bytes(dims: &GptDims) -> u64 {
    let e = dims.n_embd;
    let per_layer = 4 * e * e + 2 * dims.mlp_dim() * e;
    let floats = 2 * dims.vocab_size * e + dims.block_size * e + dims.n_layer * per_layer;
    floats as u64 * 4
}

/// Load reference weights. `dims.vocab_size` must match the file header and
/// the file size must fit `dims` exactly, with or without optimizer moments.
pub fn load_reference(path: &Path, dims: GptDims, device: &Device) -> Result<TinyGpt> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut f = BufReader::new(file);

    let mut magic = [0u8; 8];
    f.read_exact(&mut magic).map_err(|e| bad(path, e.to_string()))?;
    if &magic != MAGIC {
        return Err(bad(path, "bad magic bytes"));
    }

    let mut u32buf = [0u8; 4];
    f.read_exact(&mut u32buf).map_err(|e| bad(path, e.to_string()))?;
    let vocab = u32::from_le_bytes(u32buf) as usize;
    if vocab != dims.vocab_size {
        return Err(bad(path, format!(
            "checkpoint vocab_size {vocab} != expected {}", dims.vocab_size
        )));
    }
    let mut rest = [0u8; 12];
    f.read_exact(&mut rest).map_err(|e| bad(path, e.to_string()))?;
    let iter = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);

    let e = dims.n_embd;
    let m = dims.mlp_dim();
    let mut read = |n: usize| read_f32_slice(&mut f, n).map_err(|_| bad(path, "truncated weights"));

    let wte = read(vocab * e)?;
    let wpe = read(dims.block_size * e)?;
    let _lm_head = read(vocab * e)?;
    let mut layers = Vec::with_capacity(dims.n_layer);
    for _ in 0..dims.n_layer {
        layers.push([
            read(e * e)?,
            read(e * e)?,
            read(e * e)?,
            read(e * e)?,
            read(m * e)?,
            read(e * m)?,
        ]);
    }

    let weights = weight_bytes(&dims);
    let trailing = file_len.saturating_sub(HEADER_BYTES + weights);
    if trailing != 0 && trailing != 2 * weights {
        return Err(bad(path, format!(
            "{trailing} bytes after the weights; expected 0 or {} of optimizer moments \
             (do the configured dims match the checkpoint?)",
            2 * weights
        )));
    }

    info!(path = %path.display(), vocab, layers = dims.n_layer, iter, "loaded reference weights");
    TinyGpt::from_flat(dims, FlatWeights { wte, wpe, layers }, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> GptDims {
        GptDims { vocab_size: 7, n_embd: 4, n_head: 2, n_layer: 1, block_size: 8 }
    }

    #[test]
    fn saved_weights_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        let gpt = TinyGpt::random(dims(), 3, &Device::Cpu).unwrap();
        flush_checkpoint(&path, &serialize_reference(&gpt).unwrap()).unwrap();

        let loaded = load_reference(&path, dims(), &Device::Cpu).unwrap();
        let a: Vec<f32> = gpt.blocks[0].fc2.weight().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.blocks[0].fc2.weight().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn vocab_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        let gpt = TinyGpt::random(dims(), 3, &Device::Cpu).unwrap();
        flush_checkpoint(&path, &serialize_reference(&gpt).unwrap()).unwrap();

        let other = GptDims { vocab_size: 9, ..dims() };
        let err = load_reference(&path, other, &Device::Cpu).err().unwrap();
        assert!(err.to_string().contains("vocab_size"), "{err}");
    }

    #[test]
    fn truncated_and_foreign_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        let gpt = TinyGpt::random(dims(), 3, &Device::Cpu).unwrap();
        let buf = serialize_reference(&gpt).unwrap();

        flush_checkpoint(&path, &buf[..buf.len() - 8]).unwrap();
        assert!(matches!(load_reference(&path, dims(), &Device::Cpu), Err(SqkError::Checkpoint { .. })));

        flush_checkpoint(&path, b"NOTAGPT!and some more bytes").unwrap();
        let err = load_reference(&path, dims(), &Device::Cpu).err().unwrap();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn smaller_configured_dims_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        let saved = GptDims { n_embd: 8, n_layer: 2, ..dims() };
        let gpt = TinyGpt::random(saved, 3, &Device::Cpu).unwrap();
        flush_checkpoint(&path, &serialize_reference(&gpt).unwrap()).unwrap();

        let err = load_reference(&path, dims(), &Device::Cpu).err().unwrap();
        assert!(matches!(err, SqkError::Checkpoint { .. }));
        assert!(err.to_string().contains("bytes after the weights"), "{err}");
    }

    #[test]
    fn trailing_optimizer_moments_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        let gpt = TinyGpt::random(dims(), 3, &Device::Cpu).unwrap();
        let mut buf = serialize_reference(&gpt).unwrap();
        let weights = buf.len() - HEADER_BYTES as usize;
        buf.extend(std::iter::repeat(0u8).take(2 * weights));
        flush_checkpoint(&path, &buf).unwrap();
        assert!(load_reference(&path, dims(), &Device::Cpu).is_ok());

        buf.extend_from_slice(&[0u8; 4]);
        flush_checkpoint(&path, &buf).unwrap();
        assert!(load_reference(&path, dims(), &Device::Cpu).is_err());
    }
}
