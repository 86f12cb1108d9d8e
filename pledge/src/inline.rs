use std::sync::Arc;

use pledge_api::errors::QueueError;
use pledge_api::{Job, PromiseRunner};

use crate::promise_span;

/// Runner executing every submitted promise synchronously on the caller's
/// thread. Canceled promises are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineRunner;

impl InlineRunner {
    pub fn new() -> Self {
        Self
    }
}

impl PromiseRunner for InlineRunner {
    fn submit(&self, job: Arc<dyn Job>) -> Result<(), QueueError> {
        let id = job.id();
        if job.is_canceled() {
            tracing::debug!(promise = %id, "Skipping canceled promise");
            return Ok(());
        }

        let span = promise_span!(id, runner = "inline");
        let _guard = span.enter();
        job.run()
            .map_err(|source| QueueError::Inline { promise: id, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledge_api::{Promise, PromiseState};
    use std::io;

    #[test]
    fn runs_on_submit() {
        let promise: Promise<i32, io::Error> = Promise::new(|resolve, _| {
            resolve.resolve(3);
            Ok(())
        });

        InlineRunner::new().add_promise(&promise).unwrap();
        assert_eq!(promise.state(), PromiseState::Fulfilled);
    }

    #[test]
    fn skips_canceled() {
        let promise: Promise<i32, io::Error> = Promise::new(|resolve, _| {
            resolve.resolve(3);
            Ok(())
        });
        promise.cancel();

        InlineRunner.add_promise(&promise).unwrap();
        assert_eq!(promise.state(), PromiseState::Pending);
    }

    #[test]
    fn unhandled_rejection_is_reported() {
        let promise: Promise<i32, io::Error> = Promise::new(|_, _| Err(io::Error::other("x")));

        let error = InlineRunner.add_promise(&promise).unwrap_err();
        assert_eq!(error.promise_id(), Some(promise.id()));
        assert!(matches!(error, QueueError::Inline { .. }));
    }
}
