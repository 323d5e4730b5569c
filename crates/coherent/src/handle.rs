//! Owned resources with a release callback.

use std::{fmt, ops::Deref};

type ReleaseFn<R> = Box<dyn FnOnce(R) + Send>;

/// A resource plus the closure that gives it back to its owner.
///
/// The closure runs exactly once: at [`Handle::release`] or when the handle is
/// dropped, whichever comes first. Handles move but never clone.
pub struct Handle<R> {
    resource: Option<R>,
    release: Option<ReleaseFn<R>>,
}

impl<R> Handle<R> {
    pub fn new(resource: R, release: impl FnOnce(R) + Send + 'static) -> Self {
        Self {
            resource: Some(resource),
            release: Some(Box::new(release)),
        }
    }

    /// A handle that owns nothing on the device side; dropping it is a no-op.
    pub fn unmanaged(resource: R) -> Self {
        Self {
            resource: Some(resource),
            release: None,
        }
    }

    pub fn get(&self) -> &R {
        // Only `release` and `Drop` take the resource, and both consume the handle.
        self.resource.as_ref().expect("handle resource present until release")
    }

    /// Run the release callback now.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let (Some(resource), Some(release)) = (self.resource.take(), self.release.take()) {
            release(resource);
        }
    }
}

impl<R> Deref for Handle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.get()
    }
}

impl<R> Drop for Handle<R> {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl<R: fmt::Debug> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("resource", &self.resource)
            .field("managed", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, atomic::{AtomicUsize, Ordering}
    };

    use super::Handle;

    fn counting(counter: &Arc<AtomicUsize>) -> Handle<u32> {
        let counter = counter.clone();
        Handle::new(7, move |value| {
            assert_eq!(value, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn release_runs_once_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let handle = counting(&counter);
            let moved = handle;
            assert_eq!(*moved, 7);
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_release_is_not_repeated_at_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        counting(&counter).release();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmanaged_handles_do_nothing() {
        let handle = Handle::unmanaged(String::from("borrowed"));
        assert_eq!(handle.len(), 8);
    }
}
