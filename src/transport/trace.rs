//! Connection tracing.

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Where a request was when it failed or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dns,
    Connect,
    Proxy,
    Tls,
    Write,
    Read,
}

impl Stage {
    /// Still establishing the connection to the target.
    pub fn is_connecting(self) -> bool {
        matches!(self, Stage::Dns | Stage::Connect | Stage::Tls)
    }
}

/// Write and first-byte marks for the request currently on a connection.
#[derive(Debug, Default)]
pub struct Trace {
    written: Option<Instant>,
    first_byte: Option<Instant>,
}

impl Trace {
    /// Clear the marks before a new request goes out.
    pub fn reset(&mut self) {
        self.written = None;
        self.first_byte = None;
    }

    fn wrote(&mut self) {
        if self.first_byte.is_none() {
            self.written = Some(Instant::now());
        }
    }

    fn read(&mut self) {
        if self.first_byte.is_none() && self.written.is_some() {
            self.first_byte = Some(Instant::now());
        }
    }

    pub fn marks(&self) -> (Option<Instant>, Option<Instant>) {
        (self.written, self.first_byte)
    }
}

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Stream wrapper that stamps the shared [`Trace`] on every write and on
/// the first read after it.
pub struct TracedIo {
    inner: BoxedIo,
    trace: Arc<Mutex<Trace>>,
}

impl TracedIo {
    pub fn new(inner: BoxedIo, trace: Arc<Mutex<Trace>>) -> Self {
        Self { inner, trace }
    }
}

impl AsyncRead for TracedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.trace.lock().read();
        }
        poll
    }
}

impl AsyncWrite for TracedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.trace.lock().wrote();
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
