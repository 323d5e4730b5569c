//! Dirty-flag bookkeeping and representation refresh.

use std::time::Instant;

use coherent_instrumentation::{Conversion, MetricEvent, record_metric};
use tracing::{debug, debug_span, error, trace};

use super::{CoherentTensor, Representation};
use crate::{
    CoherentError, Result, access::Access, backend::TransferCommand, command::CommandBuffer, config::WritebackPolicy, context::Context
};

impl CoherentTensor {
    /// Prepare `target` for `access`.
    ///
    /// Reading refreshes `target` if it is stale. Writing leaves `target` as
    /// the only clean representation. A read-write request refreshes first.
    pub(crate) fn synchronize(&self, target: Representation, access: Access) -> Result<()> {
        if access.is_empty() {
            return Err(CoherentError::InvalidState("access request grants nothing".to_string()));
        }
        let context = self.context.upgrade()?;
        self.ensure_allocated(target)?;

        if access.reads() && self.dirty.get().get(target) {
            self.refresh(&context, target)?;
        }
        if access.writes() {
            let mut flags = self.dirty.get();
            flags.mark_written(target);
            self.dirty.set(flags);
        }
        debug_assert!(self.dirty.get().count() <= 2, "every representation is stale");
        trace!(?target, %access, dirty = ?self.dirty.get(), "synchronized");
        Ok(())
    }

    fn refresh(&self, context: &Context, target: Representation) -> Result<()> {
        let flags = self.dirty.get();
        match target {
            Representation::Buffer => {
                if self.is_allocated(Representation::Image) && !flags.image {
                    self.convert(context, Conversion::ImageToBuffer)
                } else if self.is_allocated(Representation::Staging) && !flags.staging {
                    self.convert(context, Conversion::StagingToBuffer)
                } else {
                    Err(CoherentError::InvalidState(
                        "no clean representation to refresh the buffer from".to_string(),
                    ))
                }
            }
            Representation::Image => {
                self.refresh_source_buffer(context)?;
                self.convert(context, Conversion::BufferToImage)
            }
            Representation::Staging => {
                self.refresh_source_buffer(context)?;
                self.convert(context, Conversion::BufferToStaging)
            }
        }
    }

    /// Image and staging are always rebuilt from the buffer; bring it up to date first.
    fn refresh_source_buffer(&self, context: &Context) -> Result<()> {
        self.ensure_allocated(Representation::Buffer)?;
        if self.dirty.get().buffer {
            self.refresh(context, Representation::Buffer)?;
        }
        Ok(())
    }

    /// Run one conversion to completion and mark its destination clean.
    ///
    /// On failure the destination keeps its dirty flag, so a later access retries.
    pub(super) fn convert(&self, context: &Context, conversion: Conversion) -> Result<()> {
        let span = debug_span!("convert", %conversion, bytes = self.nbytes());
        let _enter = span.enter();
        let started = Instant::now();

        let (command, target) = match conversion {
            Conversion::StagingToBuffer => (
                TransferCommand::CopyBuffer {
                    src: self.buffer_id(Representation::Staging)?,
                    dst: self.buffer_id(Representation::Buffer)?,
                    bytes: self.nbytes(),
                },
                Representation::Buffer,
            ),
            Conversion::BufferToStaging => (
                TransferCommand::CopyBuffer {
                    src: self.buffer_id(Representation::Buffer)?,
                    dst: self.buffer_id(Representation::Staging)?,
                    bytes: self.nbytes(),
                },
                Representation::Staging,
            ),
            Conversion::BufferToImage => (
                TransferCommand::PackBufferToImage {
                    src: self.buffer_id(Representation::Buffer)?,
                    dst: self.image_id()?,
                    layout: self.layout,
                },
                Representation::Image,
            ),
            Conversion::ImageToBuffer => (
                TransferCommand::UnpackImageToBuffer {
                    src: self.image_id()?,
                    dst: self.buffer_id(Representation::Buffer)?,
                    layout: self.layout,
                },
                Representation::Buffer,
            ),
        };

        // Device writes registered on the tensor must land before we read from it.
        self.wait_pending(context.backend())?;

        let mut commands = CommandBuffer::new(context.backend().clone(), conversion.as_str());
        commands.record(command)?;
        commands.wait()?;

        let mut flags = self.dirty.get();
        flags.set(target, false);
        self.dirty.set(flags);

        let duration_us = started.elapsed().as_micros() as u64;
        record_metric!(MetricEvent::RepresentationRefreshed {
            conversion,
            bytes: self.nbytes() as u64,
            duration_us,
        });
        debug!(duration_us, "representation refreshed");
        Ok(())
    }

    /// Upload host writes held in staging to the device buffer.
    pub(super) fn writeback_staging(&self, eager: bool) -> Result<bool> {
        if !self.uses_staging {
            return Ok(false);
        }
        let flags = self.dirty.get();
        if !flags.buffer || flags.staging || !self.is_allocated(Representation::Staging) {
            return Ok(false);
        }
        let context = self.context.upgrade()?;
        self.ensure_allocated(Representation::Buffer)?;
        self.convert(&context, Conversion::StagingToBuffer)?;
        record_metric!(MetricEvent::HostWriteback {
            bytes: self.nbytes() as u64,
            eager,
        });
        Ok(true)
    }

    /// Called when a host write episode ends.
    pub(crate) fn end_host_write(&self) {
        match self.writeback {
            WritebackPolicy::Deferred => trace!("host write ended; upload deferred to next device read"),
            WritebackPolicy::Eager => {
                if let Err(err) = self.writeback_staging(true) {
                    error!(%err, "eager host writeback failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DirtyFlags;

    #[test]
    fn marking_a_write_leaves_only_the_target_clean() {
        for target in Representation::ALL {
            let mut flags = DirtyFlags::default();
            flags.mark_written(target);
            assert!(!flags.get(target));
            assert_eq!(flags.count(), 2);
        }
    }
}
