//! Result of one raw sensor read.

use std::future::Future;

use futures_util::future::BoxFuture;

/// What a [`SampleSource`][crate::poller::SampleSource] hands back for one
/// read: a value available now, a value that needs I/O to complete, or the
/// end of the feed.
pub enum Reading<T> {
    Ready(T),
    Deferred(BoxFuture<'static, Reading<T>>),
    EndOfStream,
}

impl<T> Reading<T> {
    /// Wrap an asynchronous read.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Reading<T>> + Send + 'static,
    {
        Reading::Deferred(Box::pin(future))
    }

    /// Drive the read to completion; `None` means end of stream.
    pub async fn resolve(self) -> Option<T> {
        let mut reading = self;
        loop {
            match reading {
                Reading::Ready(value) => return Some(value),
                Reading::EndOfStream => return None,
                Reading::Deferred(future) => reading = future.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_deferred_reads_resolve() {
        let reading = Reading::deferred(async { Reading::deferred(async { Reading::Ready(3) }) });
        assert_eq!(reading.resolve().await, Some(3));
    }

    #[tokio::test]
    async fn end_of_stream_resolves_to_none() {
        let reading: Reading<u8> = Reading::deferred(async { Reading::EndOfStream });
        assert_eq!(reading.resolve().await, None);
    }
}
