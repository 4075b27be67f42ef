//! A byte-stream wrapper that paces writes through a [`TokenBucket`] (§4.12).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::AsyncWrite;

use crate::bucket::TokenBucket;
use crate::error::BucketError;
use crate::waiter::{GrantReason, GrantResult};

type PendingGrant = Pin<Box<dyn Future<Output = Result<GrantResult, BucketError>> + Send>>;

pin_project! {
    /// Wraps an `AsyncWrite`, requesting one token per byte from a shared
    /// [`TokenBucket`] before passing each chunk through to the inner
    /// writer. Never reaches into the bucket beyond `request_grant`.
    pub struct PacedWriter<W> {
        #[pin]
        inner: W,
        bucket: Arc<TokenBucket>,
        pending: Option<PendingGrant>,
    }
}

impl<W> PacedWriter<W> {
    pub fn new(inner: W, bucket: Arc<TokenBucket>) -> Self {
        PacedWriter {
            inner,
            bucket,
            pending: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn reason_to_io_error(reason: GrantReason) -> io::Error {
    match reason {
        GrantReason::Full => io::Error::new(io::ErrorKind::Other, "token bucket queue is full"),
        GrantReason::Stopping => {
            io::Error::new(io::ErrorKind::BrokenPipe, "token bucket is shutting down")
        }
        GrantReason::Grant => unreachable!("a successful grant is not an error"),
    }
}

impl<W: AsyncWrite> AsyncWrite for PacedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        if this.pending.is_none() {
            let remaining = buf.len() as f64;
            let bucket = Arc::clone(this.bucket);
            let fut = async move {
                bucket
                    .request_grant(crate::quantity::Quantity::Range {
                        min_inclusive: 1.0,
                        max_inclusive: remaining,
                    })
                    .await
            };
            *this.pending = Some(Box::pin(fut));
        }

        let outcome = ready!(this.pending.as_mut().unwrap().as_mut().poll(cx));
        *this.pending = None;
        let outcome = outcome.map_err(io::Error::other)?;

        if !outcome.done {
            return Poll::Ready(Err(reason_to_io_error(outcome.reason)));
        }

        let n = outcome.grant as usize;
        this.inner.poll_write(cx, &buf[..n])
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketConfigBuilder;
    use crate::time::{MockTimeSource, Moment};
    use tokio::io::AsyncWriteExt;

    fn bucket(
        flow_rate: f64,
        max_burst: f64,
        initial: f64,
        max_queue_size: f64,
    ) -> (Arc<TokenBucket>, Arc<MockTimeSource>) {
        let clock = Arc::new(MockTimeSource::new(Moment::EPOCH));
        let cfg = BucketConfigBuilder::new(flow_rate, max_burst)
            .initial_burst_size(initial)
            .max_queue_size(max_queue_size)
            .time_source(clock.clone())
            .build()
            .unwrap();
        (Arc::new(TokenBucket::new(cfg)), clock)
    }

    #[tokio::test]
    async fn writes_up_to_available_burst() {
        let (bucket, _clock) = bucket(1.0, 100.0, 100.0, f64::INFINITY);
        let mut writer = PacedWriter::new(Vec::new(), bucket);
        writer.write_all(b"hello").await.unwrap();
        assert_eq!(writer.into_inner(), b"hello");
    }

    #[tokio::test]
    async fn full_queue_surfaces_as_io_error() {
        // initial_burst_size == max_burst so the first request_grant is
        // satisfied synchronously (no waiter, no worker involved), and
        // max_queue_size(0.0) means the second write has no room to queue
        // behind it either — it must observe `Full` synchronously too, so
        // this test never depends on the (never-advanced) mock clock.
        let (bucket, _clock) = bucket(1.0, 10.0, 10.0, 0.0);
        bucket
            .request_grant(crate::quantity::Quantity::Exact(10.0))
            .await
            .unwrap();

        let mut writer = PacedWriter::new(Vec::new(), bucket);
        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
