//! Recording and submission of transfer work.

use std::sync::Arc;

use tracing::trace;

use crate::{
    CoherentError, Result, backend::{Backend, SubmissionId, TransferCommand}
};

/// Collects [`TransferCommand`]s and submits them to a backend as one batch.
///
/// Commit is idempotent; recording after commit is an error.
pub struct CommandBuffer {
    backend: Arc<dyn Backend>,
    label: &'static str,
    commands: Vec<TransferCommand>,
    submission: Option<SubmissionId>,
}

impl CommandBuffer {
    pub fn new(backend: Arc<dyn Backend>, label: &'static str) -> Self {
        Self {
            backend,
            label,
            commands: Vec::new(),
            submission: None,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_committed(&self) -> bool {
        self.submission.is_some()
    }

    pub fn record(&mut self, command: TransferCommand) -> Result<()> {
        if self.is_committed() {
            return Err(CoherentError::InvalidState(
                "Attempted to record on a committed command buffer".to_string(),
            ));
        }
        trace!(label = self.label, command = command.label(), "recorded transfer");
        self.commands.push(command);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<SubmissionId> {
        if let Some(submission) = self.submission {
            return Ok(submission);
        }
        let commands = std::mem::take(&mut self.commands);
        let submission = self
            .backend
            .submit(commands)
            .map_err(|err| CoherentError::conversion(self.label, err.to_string()))?;
        self.submission = Some(submission);
        Ok(submission)
    }

    /// Commit if needed and block until the batch has executed.
    pub fn wait(&mut self) -> Result<()> {
        let submission = self.commit()?;
        self.backend.wait(submission).map_err(|err| match err {
            CoherentError::ConversionFailure { reason, .. } => CoherentError::conversion(self.label, reason),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryKind, host::HostBackend};

    #[test]
    fn commit_is_idempotent_and_seals_the_buffer() {
        let backend = Arc::new(HostBackend::discrete());
        let buffer = backend.create_buffer(8, MemoryKind::HostVisible).unwrap();
        let mut cmd = CommandBuffer::new(backend.clone(), "fill");
        cmd.record(TransferCommand::FillBuffer {
            dst: buffer,
            bytes: 8,
            value: 3,
        })
        .unwrap();

        let first = cmd.commit().unwrap();
        assert_eq!(cmd.commit().unwrap(), first);
        assert!(matches!(
            cmd.record(TransferCommand::FillBuffer {
                dst: buffer,
                bytes: 8,
                value: 4
            }),
            Err(CoherentError::InvalidState(_))
        ));
        cmd.wait().unwrap();
        assert_eq!(backend.stats().submissions, 1);
        assert_eq!(backend.stats().fills, 1);
    }

    #[test]
    fn failures_are_labelled_with_the_conversion() {
        let backend = Arc::new(HostBackend::discrete());
        backend.fail_next_submissions(1);
        let mut cmd = CommandBuffer::new(backend, "buffer->image");
        match cmd.wait() {
            Err(CoherentError::ConversionFailure { conversion, .. }) => assert_eq!(conversion, "buffer->image"),
            other => panic!("expected conversion failure, got {other:?}"),
        }
    }
}
