//! # Combinators
//!
//! Helpers that build promises out of plain functions, iterators and other
//! promises.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::debug;

use crate::errors::AllError;
use crate::promise::{Promise, PromiseId, WeakPromise};

/// Turn a fallible function into a promise factory.
///
/// Each call of the returned closure builds a pending promise that resolves
/// with `f(arg)` or rejects with its error once executed.
pub fn wrap<A, T, E, F>(f: F) -> impl Fn(A) -> Promise<T, E> + Send + Sync + 'static
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
    F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    move |arg| {
        let f = Arc::clone(&f);
        Promise::new(move |resolve, _reject| {
            resolve.resolve(f(arg)?);
            Ok(())
        })
    }
}

/// Streaming promise resolving once per item of `iter`, mapped through `f`.
///
/// The first item `f` fails on rejects the promise and stops iteration.
pub fn from_iter<I, T, E, F>(iter: I, f: F) -> Promise<T, E>
where
    I: IntoIterator + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
    F: FnMut(I::Item) -> Result<T, E> + Send + 'static,
{
    let mut f = f;
    Promise::new(move |resolve, _reject| {
        for item in iter {
            resolve.resolve(f(item)?);
        }
        Ok(())
    })
}

struct Completion<T, E> {
    index: usize,
    id: PromiseId,
    value: Option<T>,
    error: Option<Arc<E>>,
}

// How often a waiting aggregate checks for canceled or dropped children
const ABANDON_POLL: Duration = Duration::from_millis(10);

/// Aggregate promise over `promises`.
///
/// Executing the aggregate blocks until every child has completed, then
/// resolves with each child's last result in input order. The first child
/// seen rejected rejects the aggregate. A child that is dropped, or canceled
/// before it completed, will never report; the aggregate then rejects with
/// [`AllError::Abandoned`].
///
/// Children that already completed count as completed immediately.
pub fn all<T, E>(promises: &[Promise<T, E>]) -> Promise<Vec<Option<T>>, AllError<E>>
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    let (tx, rx) = flume::unbounded::<Completion<T, E>>();
    let mut children: Vec<WeakPromise<T, E>> = Vec::with_capacity(promises.len());

    for (index, child) in promises.iter().enumerate() {
        let notify = tx.clone();
        let handle = child.downgrade();
        let id = child.id();
        child.complete(move |result, _| {
            let error = handle.upgrade().and_then(|child| child.error());
            let _ = notify.send(Completion {
                index,
                id,
                value: result.and_then(|resolved| resolved.last().cloned()),
                error,
            });
        });

        // A child completing after the registration above may report twice;
        // the starter keeps the first report per index.
        if child.completed_at().is_some() {
            let _ = tx.send(Completion {
                index,
                id,
                value: child.last_result(),
                error: child.error(),
            });
        }
        children.push(child.downgrade());
    }
    drop(tx);

    let total = promises.len();
    Promise::new(move |resolve, _reject| {
        let mut values: Vec<Option<T>> = vec![None; total];
        let mut seen = vec![false; total];
        let mut remaining = total;
        while remaining > 0 {
            let completion = match rx.recv_timeout(ABANDON_POLL) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => {
                    // Reports sent before the check are still in the channel
                    if abandoned(&children, &seen) && rx.is_empty() {
                        return Err(AllError::Abandoned { remaining });
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AllError::Abandoned { remaining });
                }
            };
            if std::mem::replace(&mut seen[completion.index], true) {
                continue;
            }
            remaining -= 1;
            if let Some(source) = completion.error {
                debug!(promise = %completion.id, "Child promise rejected");
                return Err(AllError::Rejected {
                    id: completion.id,
                    source,
                });
            }
            values[completion.index] = completion.value;
        }
        resolve.resolve(values);
        Ok(())
    })
}

// Whether a child that has not reported can no longer complete
fn abandoned<T, E>(children: &[WeakPromise<T, E>], seen: &[bool]) -> bool
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    children
        .iter()
        .zip(seen)
        .filter(|(_, seen)| !**seen)
        .any(|(child, _)| match child.upgrade() {
            Some(child) => child.is_canceled() && child.completed_at().is_none(),
            None => true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseState;
    use std::io;

    #[test]
    fn wrap_resolves_with_function_result() {
        let parse = wrap(|text: &'static str| {
            text.parse::<i32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        });

        let ok = parse("12");
        ok.exec().unwrap();
        assert_eq!(ok.last_result(), Some(12));

        let bad = parse("twelve");
        bad.catch(|_| {});
        bad.exec().unwrap();
        assert_eq!(bad.state(), PromiseState::Rejected);
    }

    #[test]
    fn all_of_nothing_resolves_empty() {
        let aggregate = all::<i32, io::Error>(&[]);
        aggregate.exec().unwrap();
        assert_eq!(aggregate.last_result(), Some(Vec::new()));
    }
}
