//! Coherent tensor views over three physical representations: a device
//! buffer, a device image and a host staging buffer.
//!
//! A [`CoherentTensor`] tracks which representations are stale and converts
//! between them lazily when a caller asks for one. Host access goes through
//! [`HostFuture`]s whose mapped [`Payload`]s are tied to the future's borrow.

pub mod access;
pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod options;
pub mod persistent;
pub mod pool;
pub mod tensor;

pub use access::Access;
pub use backend::{
    Backend, BufferId, ImageExtents, ImageFormat, ImageId, MemoryKind, PackLayout, SubmissionId, TransferCommand, host::{HostBackend, TransferStats}
};
pub use command::CommandBuffer;
pub use config::{RuntimeConfig, WritebackPolicy};
pub use context::{Context, ContextRef};
pub use error::CoherentError;
pub use handle::Handle;
pub use options::{MemoryLayout, TensorOptions, image_extents, verify};
pub use persistent::{PersistentPool, persistent};
pub use pool::{BufferResource, ImageResource, PoolStats, Reclamation, ResourcePool};
pub use tensor::{
    CoherentTensor, DeviceBuffer, DeviceImage, DirtyFlags, Representation, TensorStorage, dtypes::{Dtype, F16, F32, TensorElement}, future::{HostFuture, Payload}
};

#[cfg(target_os = "macos")]
pub use backend::metal::MetalBackend;

pub type Result<T, E = CoherentError> = std::result::Result<T, E>;
