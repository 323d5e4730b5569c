//! Pushes a small tensor through every representation and back.
//!
//!   cargo run --bin coherent_roundtrip -- [N C H W]

use std::env;

use anyhow::{Context as _, Result, bail};
use coherent::{Access, CoherentTensor, Context, F32, TensorOptions, TensorStorage};
use coherent_instrumentation::{AppConfig, init_tracing};
use tracing::info;

fn main() -> Result<()> {
    let config = AppConfig::get_or_init_from_env()?;
    init_tracing(config)?;

    let sizes: Vec<usize> = env::args()
        .skip(1)
        .map(|arg| arg.parse().with_context(|| format!("invalid dimension '{arg}'")))
        .collect::<Result<_>>()?;
    let sizes = if sizes.is_empty() { vec![1, 6, 2, 2] } else { sizes };

    let context = Context::system_default()?;
    let mut tensor = CoherentTensor::new(&sizes, TensorOptions::default(), TensorStorage::Pooled(&context))?;
    let expected: Vec<f32> = (0..tensor.numel()).map(|i| i as f32).collect();
    {
        let mut future = tensor.host_future_mut::<F32>(Access::WRITE)?;
        future.wait()?.copy_from_slice(&expected)?;
    }

    let extents = tensor.device_image_handle()?.extents();
    info!(?sizes, ?extents, dirty = ?tensor.dirty_flags(), "packed into image");

    // Pretend a kernel rewrote the image in place, so the host must read back through it.
    tensor.device_image_handle_mut(Access::READ_WRITE)?;
    let mut future = tensor.host_future::<F32>()?;
    let actual = future.wait()?.to_vec()?;
    if actual != expected {
        bail!("round trip mismatch: expected {expected:?}, got {actual:?}");
    }
    info!(backend = context.backend().name(), elements = actual.len(), "round trip ok");
    Ok(())
}
