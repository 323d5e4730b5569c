//! Metal backend.
//!
//! Buffers are `MTLBuffer`s: device-local ones use private storage, host
//! visible ones shared storage. Images are private buffers holding packed
//! RGBA texels in the same order as the host backend, written and read by
//! two small compute kernels per element width.

use std::{
    ffi::c_void, ptr::NonNull, sync::{Mutex, MutexGuard}
};

use objc2::{rc::Retained, runtime::ProtocolObject};
use objc2_foundation::NSString;
use objc2_metal::{
    MTLBlitCommandEncoder as _, MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder as _, MTLCommandQueue, MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice, MTLDevice, MTLLibrary as _, MTLResourceOptions, MTLSize
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use super::{Backend, BufferId, ImageExtents, ImageFormat, ImageId, MappedRegion, MemoryKind, PackLayout, SubmissionId, TransferCommand};
use crate::{CoherentError, Result};

const PACK_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

struct PackParams {
    uint batch;
    uint channels;
    uint height;
    uint width;
    uint slices;
    uint total;
};

template <typename T>
inline void pack_texels(device const T* src, device T* dst, constant PackParams& p, uint gid) {
    if (gid >= p.total) return;
    uint lane = gid % 4;
    uint texel = gid / 4;
    uint x = texel % p.width;
    uint y = (texel / p.width) % p.height;
    uint z = texel / (p.width * p.height);
    uint n = z / p.slices;
    uint c = (z % p.slices) * 4 + lane;
    dst[gid] = c < p.channels ? src[((n * p.channels + c) * p.height + y) * p.width + x] : T(0);
}

template <typename T>
inline void unpack_texels(device const T* src, device T* dst, constant PackParams& p, uint gid) {
    if (gid >= p.total) return;
    uint x = gid % p.width;
    uint y = (gid / p.width) % p.height;
    uint c = (gid / (p.width * p.height)) % p.channels;
    uint n = gid / (p.width * p.height * p.channels);
    uint z = n * p.slices + c / 4;
    dst[gid] = src[((z * p.height + y) * p.width + x) * 4 + c % 4];
}

kernel void pack_f32(device const float* src [[buffer(0)]], device float* dst [[buffer(1)]],
                     constant PackParams& p [[buffer(2)]], uint gid [[thread_position_in_grid]]) {
    pack_texels(src, dst, p, gid);
}

kernel void pack_f16(device const half* src [[buffer(0)]], device half* dst [[buffer(1)]],
                     constant PackParams& p [[buffer(2)]], uint gid [[thread_position_in_grid]]) {
    pack_texels(src, dst, p, gid);
}

kernel void unpack_f32(device const float* src [[buffer(0)]], device float* dst [[buffer(1)]],
                       constant PackParams& p [[buffer(2)]], uint gid [[thread_position_in_grid]]) {
    unpack_texels(src, dst, p, gid);
}

kernel void unpack_f16(device const half* src [[buffer(0)]], device half* dst [[buffer(1)]],
                       constant PackParams& p [[buffer(2)]], uint gid [[thread_position_in_grid]]) {
    unpack_texels(src, dst, p, gid);
}
"#;

const THREADS_PER_GROUP: usize = 256;

#[repr(C)]
#[derive(Clone, Copy)]
struct PackParams {
    batch: u32,
    channels: u32,
    height: u32,
    width: u32,
    slices: u32,
    total: u32,
}

impl PackParams {
    fn new(layout: &PackLayout, total: usize) -> Self {
        Self {
            batch: layout.batch as u32,
            channels: layout.channels as u32,
            height: layout.height as u32,
            width: layout.width as u32,
            slices: layout.channel_slices() as u32,
            total: total as u32,
        }
    }
}

type Pipeline = Retained<ProtocolObject<dyn MTLComputePipelineState>>;

struct Pipelines {
    pack_f32: Pipeline,
    pack_f16: Pipeline,
    unpack_f32: Pipeline,
    unpack_f16: Pipeline,
}

impl Pipelines {
    fn compile(device: &ProtocolObject<dyn MTLDevice>) -> Result<Self> {
        let source = NSString::from_str(PACK_SOURCE);
        let library = device
            .newLibraryWithSource_options_error(&source, None)
            .map_err(|err| CoherentError::BackendUnavailable(format!("pack library failed to compile: {err}")))?;
        let pipeline = |name: &str| -> Result<Pipeline> {
            let function = library
                .newFunctionWithName(&NSString::from_str(name))
                .ok_or_else(|| CoherentError::BackendUnavailable(format!("missing kernel {name}")))?;
            device
                .newComputePipelineStateWithFunction_error(&function)
                .map_err(|err| CoherentError::BackendUnavailable(format!("pipeline {name}: {err}")))
        };
        Ok(Self {
            pack_f32: pipeline("pack_f32")?,
            pack_f16: pipeline("pack_f16")?,
            unpack_f32: pipeline("unpack_f32")?,
            unpack_f16: pipeline("unpack_f16")?,
        })
    }

    fn select(&self, pack: bool, element_bytes: usize) -> &Pipeline {
        match (pack, element_bytes) {
            (true, 2) => &self.pack_f16,
            (true, _) => &self.pack_f32,
            (false, 2) => &self.unpack_f16,
            (false, _) => &self.unpack_f32,
        }
    }
}

type RawBuffer = Retained<ProtocolObject<dyn MTLBuffer>>;

struct MetalBuffer {
    raw: RawBuffer,
    kind: MemoryKind,
    mapped: usize,
    destroy_on_unmap: bool,
}

struct MetalImage {
    raw: RawBuffer,
    extents: ImageExtents,
    format: ImageFormat,
}

#[derive(Default)]
struct MetalState {
    next_id: u64,
    last_submitted: u64,
    buffers: FxHashMap<u64, MetalBuffer>,
    images: FxHashMap<u64, MetalImage>,
    inflight: FxHashMap<u64, Retained<ProtocolObject<dyn MTLCommandBuffer>>>,
    failures: FxHashMap<u64, String>,
}

impl MetalState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, id: BufferId) -> Result<&RawBuffer> {
        self.buffers
            .get(&id.0)
            .map(|buffer| &buffer.raw)
            .ok_or_else(|| CoherentError::InvalidState(format!("{id:?} does not exist")))
    }

    fn image(&self, id: ImageId, layout: &PackLayout) -> Result<&RawBuffer> {
        let image = self
            .images
            .get(&id.0)
            .ok_or_else(|| CoherentError::InvalidState(format!("{id:?} does not exist")))?;
        if image.extents != layout.extents() || image.format.channel_bytes() != layout.element_bytes {
            return Err(CoherentError::conversion(
                "encode",
                format!("layout {layout:?} does not match image {:?} {:?}", image.extents, image.format),
            ));
        }
        Ok(&image.raw)
    }
}

pub struct MetalBackend {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    pipelines: Pipelines,
    unified: bool,
    state: Mutex<MetalState>,
}

// Metal devices, queues, buffers and pipeline states are thread safe; all mutable bookkeeping sits behind `state`.
unsafe impl Send for MetalBackend {}
unsafe impl Sync for MetalBackend {}

impl MetalBackend {
    pub fn system_default() -> Result<Self> {
        let device =
            MTLCreateSystemDefaultDevice().ok_or_else(|| CoherentError::BackendUnavailable("no Metal device found".to_string()))?;
        let queue = device
            .newCommandQueue()
            .ok_or_else(|| CoherentError::BackendUnavailable("failed to create command queue".to_string()))?;
        let pipelines = Pipelines::compile(&device)?;
        let unified = device.hasUnifiedMemory();
        info!(device = %device.name(), unified, "metal backend ready");
        Ok(Self {
            device,
            queue,
            pipelines,
            unified,
            state: Mutex::new(MetalState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MetalState> {
        self.state.lock().expect("metal backend state mutex poisoned")
    }

    fn new_buffer(&self, bytes: usize, options: MTLResourceOptions) -> Result<RawBuffer> {
        self.device
            .newBufferWithLength_options(bytes, options)
            .ok_or(CoherentError::BufferCreationFailed(bytes))
    }

    fn encode(
        &self,
        state: &MetalState,
        command_buffer: &ProtocolObject<dyn MTLCommandBuffer>,
        command: &TransferCommand,
    ) -> Result<()> {
        match *command {
            TransferCommand::CopyBuffer { src, dst, bytes } => {
                let (src, dst) = (state.buffer(src)?, state.buffer(dst)?);
                if bytes > src.length() || bytes > dst.length() {
                    return Err(CoherentError::conversion("encode", format!("copy of {bytes} bytes overruns a buffer")));
                }
                let encoder = command_buffer
                    .blitCommandEncoder()
                    .ok_or_else(|| CoherentError::conversion("encode", "blit encoder not available"))?;
                unsafe { encoder.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(src, 0, dst, 0, bytes) };
                encoder.endEncoding();
            }
            TransferCommand::FillBuffer { dst, bytes, value } => {
                let dst = state.buffer(dst)?;
                let encoder = command_buffer
                    .blitCommandEncoder()
                    .ok_or_else(|| CoherentError::conversion("encode", "blit encoder not available"))?;
                encoder.fillBuffer_range_value(dst, (0..bytes.min(dst.length())).into(), value);
                encoder.endEncoding();
            }
            TransferCommand::PackBufferToImage { src, dst, layout } => {
                let (src, dst) = (state.buffer(src)?, state.image(dst, &layout)?);
                self.dispatch(command_buffer, true, src, dst, &layout, layout.image_elements())?;
            }
            TransferCommand::UnpackImageToBuffer { src, dst, layout } => {
                let (src, dst) = (state.image(src, &layout)?, state.buffer(dst)?);
                self.dispatch(command_buffer, false, src, dst, &layout, layout.elements())?;
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        command_buffer: &ProtocolObject<dyn MTLCommandBuffer>,
        pack: bool,
        src: &ProtocolObject<dyn MTLBuffer>,
        dst: &ProtocolObject<dyn MTLBuffer>,
        layout: &PackLayout,
        total: usize,
    ) -> Result<()> {
        if total == 0 {
            return Ok(());
        }
        let encoder = command_buffer
            .computeCommandEncoder()
            .ok_or_else(|| CoherentError::conversion("encode", "compute encoder not available"))?;
        let params = PackParams::new(layout, total);
        encoder.setComputePipelineState(self.pipelines.select(pack, layout.element_bytes));
        unsafe {
            encoder.setBuffer_offset_atIndex(Some(src), 0, 0);
            encoder.setBuffer_offset_atIndex(Some(dst), 0, 1);
            encoder.setBytes_length_atIndex(
                NonNull::from(&params).cast::<c_void>(),
                std::mem::size_of::<PackParams>(),
                2,
            );
        }
        encoder.dispatchThreadgroups_threadsPerThreadgroup(
            MTLSize {
                width: total.div_ceil(THREADS_PER_GROUP),
                height: 1,
                depth: 1,
            },
            MTLSize {
                width: THREADS_PER_GROUP,
                height: 1,
                depth: 1,
            },
        );
        encoder.endEncoding();
        Ok(())
    }
}

impl Backend for MetalBackend {
    fn name(&self) -> &'static str {
        "metal"
    }

    fn unified_memory(&self) -> bool {
        self.unified
    }

    fn create_buffer(&self, bytes: usize, kind: MemoryKind) -> Result<BufferId> {
        let options = match kind {
            MemoryKind::DeviceLocal => MTLResourceOptions::StorageModePrivate,
            MemoryKind::HostVisible => MTLResourceOptions::StorageModeShared,
        };
        let raw = self.new_buffer(bytes, options)?;
        let mut state = self.lock();
        let id = state.allocate_id();
        state.buffers.insert(
            id,
            MetalBuffer {
                raw,
                kind,
                mapped: 0,
                destroy_on_unmap: false,
            },
        );
        trace!(buffer = id, bytes, ?kind, "metal buffer created");
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.lock();
        let Some(entry) = state.buffers.get_mut(&buffer.0) else {
            return;
        };
        if entry.mapped > 0 {
            entry.destroy_on_unmap = true;
            return;
        }
        state.buffers.remove(&buffer.0);
    }

    fn create_image(&self, extents: ImageExtents, format: ImageFormat) -> Result<ImageId> {
        let bytes = extents.byte_size(format)?;
        let raw = self
            .new_buffer(bytes, MTLResourceOptions::StorageModePrivate)
            .map_err(|_| CoherentError::ImageCreationFailed {
                width: extents.width,
                height: extents.height,
                depth: extents.depth,
            })?;
        let mut state = self.lock();
        let id = state.allocate_id();
        state.images.insert(id, MetalImage { raw, extents, format });
        Ok(ImageId(id))
    }

    fn destroy_image(&self, image: ImageId) {
        self.lock().images.remove(&image.0);
    }

    fn submit(&self, commands: Vec<TransferCommand>) -> Result<SubmissionId> {
        let mut state = self.lock();
        let command_buffer = self
            .queue
            .commandBuffer()
            .ok_or_else(|| CoherentError::conversion("submit", "failed to create command buffer"))?;
        for command in &commands {
            self.encode(&state, &command_buffer, command)?;
        }
        command_buffer.commit();

        let id = state.allocate_id();
        state.last_submitted = id;
        state.inflight.insert(id, command_buffer);
        debug!(submission = id, commands = commands.len(), "metal submission committed");
        Ok(SubmissionId(id))
    }

    fn wait(&self, submission: SubmissionId) -> Result<()> {
        let command_buffer = {
            let mut state = self.lock();
            if submission.0 > state.last_submitted {
                return Err(CoherentError::InvalidState(format!("{submission:?} was never submitted")));
            }
            state.inflight.remove(&submission.0)
        };
        if let Some(command_buffer) = command_buffer {
            #[allow(unused_unsafe)]
            unsafe {
                command_buffer.waitUntilCompleted()
            };
            if command_buffer.status() == MTLCommandBufferStatus::Error {
                let reason = command_buffer
                    .error()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "command buffer failed".to_string());
                warn!(submission = submission.0, %reason, "metal submission failed");
                self.lock().failures.insert(submission.0, reason);
            }
        }
        match self.lock().failures.get(&submission.0) {
            Some(reason) => Err(CoherentError::conversion("wait", reason.clone())),
            None => Ok(()),
        }
    }

    fn map_buffer(&self, buffer: BufferId) -> Result<MappedRegion> {
        let mut state = self.lock();
        let entry = state
            .buffers
            .get_mut(&buffer.0)
            .filter(|entry| !entry.destroy_on_unmap)
            .ok_or_else(|| CoherentError::InvalidState(format!("{buffer:?} does not exist")))?;
        if entry.kind == MemoryKind::DeviceLocal {
            return Err(CoherentError::NotHostVisible);
        }
        entry.mapped += 1;
        Ok(MappedRegion {
            ptr: entry.raw.contents().cast::<u8>(),
            len: entry.raw.length(),
        })
    }

    fn unmap_buffer(&self, buffer: BufferId) {
        let mut state = self.lock();
        let Some(entry) = state.buffers.get_mut(&buffer.0) else {
            return;
        };
        entry.mapped = entry.mapped.saturating_sub(1);
        if entry.mapped == 0 && entry.destroy_on_unmap {
            state.buffers.remove(&buffer.0);
        }
    }
}
