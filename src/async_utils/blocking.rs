//! Running blocking, CPU-heavy code without stalling the async executor.

use futures::{StreamExt as _, stream};

use super::BoxedStream;
use crate::prelude::*;

/// Wrapper around [`tokio::task::spawn_blocking`] that re-raises panics from
/// the background thread in the calling task.
///
/// This matters for the worker pool: a panic while rendering a page must
/// surface in the job's own task, where the pool can see it and mark the job as
/// failed, rather than vanishing on a blocking thread.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task did not complete: {err}"),
    }
}

/// Turn a blocking iterator into a lazy async stream.
///
/// Each call to `next` runs on the blocking thread pool, and the iterator is
/// only advanced when the stream is polled. Nothing is read ahead, so a caller
/// that finishes with one item before polling again never holds two items at
/// once.
pub fn blocking_iter_stream<I, T>(iter: I) -> BoxedStream<Result<T>>
where
    I: Iterator<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    stream::unfold(Some(iter), |state| async move {
        let mut iter = state?;
        let (next, iter) = spawn_blocking_propagating_panics(move || {
            let next = iter.next();
            (next, iter)
        })
        .await;
        next.map(|item| (item, Some(iter)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Counts how many items have been pulled from the underlying iterator.
    struct CountingIter {
        pulled: Arc<AtomicUsize>,
        remaining: usize,
    }

    impl Iterator for CountingIter {
        type Item = Result<usize>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(Ok(self.pulled.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn stream_does_not_read_ahead() -> Result<()> {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut stream = blocking_iter_stream(CountingIter {
            pulled: pulled.clone(),
            remaining: 3,
        });
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert_eq!(stream.next().await.transpose()?, Some(0));
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
        assert_eq!(stream.next().await.transpose()?, Some(1));
        assert_eq!(stream.next().await.transpose()?, Some(2));
        assert!(stream.next().await.is_none());
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn panics_are_propagated_to_the_caller() {
        let handle = tokio::spawn(async {
            spawn_blocking_propagating_panics(|| -> usize { panic!("page renderer exploded") })
                .await
        });
        let err = handle.await.unwrap_err();
        assert!(err.is_panic());
    }
}
