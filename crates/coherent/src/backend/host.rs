//! In-process reference backend.
//!
//! Device memory is ordinary heap memory, but the queue is modelled
//! faithfully: `submit` only enqueues, and commands execute in order when
//! someone waits on them. Device-local buffers refuse to map unless the
//! backend is configured as unified memory, so host access on a discrete
//! configuration must go through staging exactly as it would on hardware.

use std::{
    collections::VecDeque, ptr::NonNull, sync::{Mutex, MutexGuard}
};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use super::{Backend, BufferId, ImageExtents, ImageFormat, ImageId, MappedRegion, MemoryKind, PackLayout, SubmissionId, TransferCommand};
use crate::{CoherentError, Result};

/// Counters describing the work a [`HostBackend`] has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub submissions: u64,
    pub failed_submissions: u64,
    pub copies: u64,
    pub fills: u64,
    pub packs: u64,
    pub unpacks: u64,
    pub bytes_transferred: u64,
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub images_created: u64,
    pub images_destroyed: u64,
    pub maps: u64,
}

impl TransferStats {
    /// Every executed transfer command.
    pub fn transfers(&self) -> u64 {
        self.copies + self.fills + self.packs + self.unpacks
    }
}

struct HostAllocation {
    // u64 words keep the storage aligned for every element type.
    words: Box<[u64]>,
    len: usize,
}

impl HostAllocation {
    fn zeroed(len: usize) -> Result<Self> {
        let count = len.div_ceil(8);
        let mut words = Vec::new();
        words.try_reserve_exact(count).map_err(|_| CoherentError::OutOfMemory {
            requested: len,
            available: 0,
        })?;
        words.resize(count, 0u64);
        Ok(Self {
            words: words.into_boxed_slice(),
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialised bytes and u8 has no alignment requirement.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

struct HostBuffer {
    memory: HostAllocation,
    kind: MemoryKind,
    mapped: usize,
    destroy_on_unmap: bool,
}

struct HostImage {
    memory: HostAllocation,
    extents: ImageExtents,
    format: ImageFormat,
}

struct PendingSubmission {
    id: u64,
    commands: Vec<TransferCommand>,
    inject_failure: bool,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    buffers: FxHashMap<u64, HostBuffer>,
    images: FxHashMap<u64, HostImage>,
    queue: VecDeque<PendingSubmission>,
    last_submitted: u64,
    failures: FxHashMap<u64, String>,
    fail_next: usize,
    stats: TransferStats,
}

impl HostState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, id: BufferId) -> std::result::Result<&HostBuffer, String> {
        self.buffers.get(&id.0).ok_or_else(|| format!("buffer {} does not exist", id.0))
    }

    fn buffer_mut(&mut self, id: BufferId) -> std::result::Result<&mut HostBuffer, String> {
        self.buffers.get_mut(&id.0).ok_or_else(|| format!("buffer {} does not exist", id.0))
    }

    fn execute(&mut self, command: &TransferCommand) -> std::result::Result<(), String> {
        match *command {
            TransferCommand::CopyBuffer { src, dst, bytes } => {
                let source = self.buffer(src)?;
                if bytes > source.memory.len {
                    return Err(format!("copy of {bytes} bytes overruns source buffer {}", src.0));
                }
                let data = source.memory.bytes()[..bytes].to_vec();
                let target = self.buffer_mut(dst)?;
                if bytes > target.memory.len {
                    return Err(format!("copy of {bytes} bytes overruns destination buffer {}", dst.0));
                }
                target.memory.bytes_mut()[..bytes].copy_from_slice(&data);
                self.stats.copies += 1;
                self.stats.bytes_transferred += bytes as u64;
            }
            TransferCommand::FillBuffer { dst, bytes, value } => {
                let target = self.buffer_mut(dst)?;
                let len = bytes.min(target.memory.len);
                target.memory.bytes_mut()[..len].fill(value);
                self.stats.fills += 1;
                self.stats.bytes_transferred += len as u64;
            }
            TransferCommand::PackBufferToImage { src, dst, layout } => {
                let data = self.buffer(src)?.memory.bytes().to_vec();
                let image = self.images.get_mut(&dst.0).ok_or_else(|| format!("image {} does not exist", dst.0))?;
                check_image_layout(image, &layout)?;
                pack(&data, image.memory.bytes_mut(), &layout);
                self.stats.packs += 1;
                self.stats.bytes_transferred += (layout.elements() * layout.element_bytes) as u64;
            }
            TransferCommand::UnpackImageToBuffer { src, dst, layout } => {
                let image = self.images.get(&src.0).ok_or_else(|| format!("image {} does not exist", src.0))?;
                check_image_layout(image, &layout)?;
                let data = image.memory.bytes().to_vec();
                let target = self.buffer_mut(dst)?;
                unpack(&data, target.memory.bytes_mut(), &layout);
                self.stats.unpacks += 1;
                self.stats.bytes_transferred += (layout.elements() * layout.element_bytes) as u64;
            }
        }
        Ok(())
    }

    fn run_until(&mut self, id: u64) {
        while self.queue.front().is_some_and(|pending| pending.id <= id) {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            let outcome = if pending.inject_failure {
                Err("injected device fault".to_string())
            } else {
                pending.commands.iter().try_for_each(|command| self.execute(command))
            };
            if let Err(reason) = outcome {
                warn!(submission = pending.id, %reason, "host submission failed");
                self.stats.failed_submissions += 1;
                self.failures.insert(pending.id, reason);
            } else {
                trace!(submission = pending.id, commands = pending.commands.len(), "host submission completed");
            }
        }
    }
}

fn check_image_layout(image: &HostImage, layout: &PackLayout) -> std::result::Result<(), String> {
    if image.extents != layout.extents() || image.format.channel_bytes() != layout.element_bytes {
        return Err(format!(
            "layout {:?} does not match image {:?} {:?}",
            layout, image.extents, image.format
        ));
    }
    Ok(())
}

fn for_each_element(layout: &PackLayout, mut f: impl FnMut(usize, usize)) {
    for n in 0..layout.batch {
        for c in 0..layout.channels {
            for y in 0..layout.height {
                for x in 0..layout.width {
                    f(layout.buffer_index(n, c, y, x), layout.image_index(n, c, y, x));
                }
            }
        }
    }
}

fn pack(buffer: &[u8], image: &mut [u8], layout: &PackLayout) {
    let width = layout.element_bytes;
    image.fill(0);
    for_each_element(layout, |b, i| {
        image[i * width..(i + 1) * width].copy_from_slice(&buffer[b * width..(b + 1) * width]);
    });
}

fn unpack(image: &[u8], buffer: &mut [u8], layout: &PackLayout) {
    let width = layout.element_bytes;
    for_each_element(layout, |b, i| {
        buffer[b * width..(b + 1) * width].copy_from_slice(&image[i * width..(i + 1) * width]);
    });
}

pub struct HostBackend {
    unified: bool,
    state: Mutex<HostState>,
}

impl HostBackend {
    /// Discrete memory: device-local buffers are not host visible.
    pub fn discrete() -> Self {
        Self::with_unified_memory(false)
    }

    /// Unified memory: every buffer can be mapped.
    pub fn unified() -> Self {
        Self::with_unified_memory(true)
    }

    pub fn with_unified_memory(unified: bool) -> Self {
        Self {
            unified,
            state: Mutex::new(HostState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("host backend state mutex poisoned")
    }

    pub fn stats(&self) -> TransferStats {
        self.lock().stats
    }

    /// Make the next `count` submissions fail when they execute.
    pub fn fail_next_submissions(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Submissions enqueued but not yet executed.
    pub fn pending_submissions(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.lock().images.len()
    }

    /// Raw bytes of an image, for inspecting the packed layout.
    pub fn image_bytes(&self, image: ImageId) -> Option<Vec<u8>> {
        self.lock().images.get(&image.0).map(|image| image.memory.bytes().to_vec())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::discrete()
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn unified_memory(&self) -> bool {
        self.unified
    }

    fn create_buffer(&self, bytes: usize, kind: MemoryKind) -> Result<BufferId> {
        let memory = HostAllocation::zeroed(bytes)?;
        let mut state = self.lock();
        let id = state.allocate_id();
        state.buffers.insert(
            id,
            HostBuffer {
                memory,
                kind,
                mapped: 0,
                destroy_on_unmap: false,
            },
        );
        state.stats.buffers_created += 1;
        trace!(buffer = id, bytes, ?kind, "host buffer created");
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
        state.stats.buffers_destroyed += 1;
    }

    fn create_image(&self, extents: ImageExtents, format: ImageFormat) -> Result<ImageId> {
        if extents.texels() == 0 {
            return Err(CoherentError::ImageCreationFailed {
                width: extents.width,
                height: extents.height,
                depth: extents.depth,
            });
        }
        let memory = HostAllocation::zeroed(extents.byte_size(format)?)?;
        let mut state = self.lock();
        let id = state.allocate_id();
        state.images.insert(
            id,
            HostImage {
                memory,
                extents,
                format,
            },
        );
        state.stats.images_created += 1;
        Ok(ImageId(id))
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.lock();
        if state.images.remove(&image.0).is_some() {
            state.stats.images_destroyed += 1;
        }
    }

    fn submit(&self, commands: Vec<TransferCommand>) -> Result<SubmissionId> {
        let mut state = self.lock();
        let id = state.allocate_id();
        let inject_failure = state.fail_next > 0;
        if inject_failure {
            state.fail_next -= 1;
        }
        debug!(submission = id, commands = commands.len(), inject_failure, "host submission queued");
        state.queue.push_back(PendingSubmission {
            id,
            commands,
            inject_failure,
        });
        state.last_submitted = id;
        state.stats.submissions += 1;
        Ok(SubmissionId(id))
    }

    fn wait(&self, submission: SubmissionId) -> Result<()> {
        let mut state = self.lock();
        if submission.0 > state.last_submitted {
            return Err(CoherentError::InvalidState(format!("{submission:?} was never submitted")));
        }
        state.run_until(submission.0);
        match state.failures.get(&submission.0) {
            Some(reason) => Err(CoherentError::conversion("wait", reason.clone())),
            None => Ok(()),
        }
    }

    fn map_buffer(&self, buffer: BufferId) -> Result<MappedRegion> {
        let unified = self.unified;
        let mut state = self.lock();
        let entry = state
            .buffers
            .get_mut(&buffer.0)
            .filter(|entry| !entry.destroy_on_unmap)
            .ok_or_else(|| CoherentError::InvalidState(format!("{buffer:?} does not exist")))?;
        if entry.kind == MemoryKind::DeviceLocal && !unified {
            return Err(CoherentError::NotHostVisible);
        }
        entry.mapped += 1;
        let len = entry.memory.len;
        let ptr = NonNull::new(entry.memory.words.as_mut_ptr().cast::<u8>()).ok_or(CoherentError::BufferCreationFailed(len))?;
        state.stats.maps += 1;
        Ok(MappedRegion { ptr, len })
    }

    fn unmap_buffer(&self, buffer: BufferId) {
        let mut state = self.lock();
        let Some(entry) = state.buffers.get_mut(&buffer.0) else {
            return;
        };
        entry.mapped = entry.mapped.saturating_sub(1);
        if entry.mapped == 0 && entry.destroy_on_unmap {
            state.buffers.remove(&buffer.0);
            state.stats.buffers_destroyed += 1;
        }
    }
}

#[cfg(test)]
#[path = "host.test.rs"]
mod tests;
