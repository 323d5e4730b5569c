//! Device abstraction: memory allocation and ordered transfer submission.
//!
//! The tensor layer never touches a device API directly. Everything it needs
//! (allocations, copies, image packing, completion waits and host mapping)
//! goes through [`Backend`], so the same synchronisation logic runs on the
//! in-process [`host::HostBackend`] and on Metal.

use std::{fmt, ptr::NonNull};

pub use crate::options::{ImageExtents, ImageFormat, PackLayout};
use crate::Result;

pub mod host;
#[cfg(target_os = "macos")]
pub mod metal;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

opaque_id!(
    /// A linear device allocation.
    BufferId
);
opaque_id!(
    /// An opaque RGBA image allocation.
    ImageId
);
opaque_id!(
    /// A batch of transfer commands handed to the device queue.
    SubmissionId
);

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Fastest for the device; not mappable on discrete memory architectures.
    DeviceLocal,
    /// Mappable by the host.
    HostVisible,
}

/// A single device-side transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCommand {
    CopyBuffer { src: BufferId, dst: BufferId, bytes: usize },
    FillBuffer { dst: BufferId, bytes: usize, value: u8 },
    PackBufferToImage { src: BufferId, dst: ImageId, layout: PackLayout },
    UnpackImageToBuffer { src: ImageId, dst: BufferId, layout: PackLayout },
}

impl TransferCommand {
    pub fn label(&self) -> &'static str {
        match self {
            TransferCommand::CopyBuffer { .. } => "copy_buffer",
            TransferCommand::FillBuffer { .. } => "fill_buffer",
            TransferCommand::PackBufferToImage { .. } => "pack_buffer_to_image",
            TransferCommand::UnpackImageToBuffer { .. } => "unpack_image_to_buffer",
        }
    }
}

/// Host view of a mapped buffer. Valid until the matching `unmap_buffer`.
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

/// A device plus its in-order transfer queue.
///
/// Submissions on one backend execute in submission order. `wait` blocks until
/// the given submission and everything before it has finished, and reports a
/// failure of that submission as [`CoherentError::ConversionFailure`](crate::CoherentError).
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether host and device share one physical memory.
    fn unified_memory(&self) -> bool;

    fn create_buffer(&self, bytes: usize, kind: MemoryKind) -> Result<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId);

    fn create_image(&self, extents: ImageExtents, format: ImageFormat) -> Result<ImageId>;
    fn destroy_image(&self, image: ImageId);

    fn submit(&self, commands: Vec<TransferCommand>) -> Result<SubmissionId>;
    fn wait(&self, submission: SubmissionId) -> Result<()>;

    /// Map a host-visible buffer. Destroying a mapped buffer is deferred until it is unmapped.
    fn map_buffer(&self, buffer: BufferId) -> Result<MappedRegion>;
    fn unmap_buffer(&self, buffer: BufferId);
}
