//! Byte accounting at the connection level.
//!
//! [`CountedStream`] decorates the dialed connection so every successful
//! read/write atomically adds the transferred byte count to a pair of
//! run-wide counters. Failed operations leave the counters untouched. The
//! wrapper sits directly on the TCP stream, under any TLS layer, so the
//! counters reflect wire bytes. It also arms the transport-level read/write
//! deadlines, which live at the same layer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Shared (read, written) counters for all connections of one run.
///
/// Monotonically non-decreasing under normal operation; additions use
/// two's-complement wrapping on overflow.
#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    read: Arc<AtomicI64>,
    written: Arc<AtomicI64>,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_total(&self) -> i64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written_total(&self) -> i64 {
        self.written.load(Ordering::Relaxed)
    }

    fn add_read(&self, n: i64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    fn add_written(&self, n: i64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }
}

/// A connection whose I/O feeds [`ByteCounters`] and honors optional
/// per-operation read/write deadlines.
#[derive(Debug)]
pub struct CountedStream<S> {
    inner: S,
    counters: ByteCounters,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> CountedStream<S> {
    pub fn new(
        inner: S,
        counters: ByteCounters,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            counters,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.read_deadline = None;
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.counters.add_read(n as i64);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                if let Some(timeout) = this.read_timeout {
                    let deadline = this
                        .read_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.read_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.write_deadline = None;
                if n > 0 {
                    this.counters.add_written(n as i64);
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                if let Some(timeout) = this.write_timeout {
                    let deadline = this
                        .write_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.write_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
