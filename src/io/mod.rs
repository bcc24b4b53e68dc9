//! Stream plumbing between child processes and user handlers.
//!
//! The types here are what user callbacks actually receive: a
//! [`StageReader`] over a child's stdout/stderr (or over one leg of a
//! [`tee::Tee`] fan-out), a [`StageStdin`] for feeding a child's stdin, and
//! the line-oriented [`LineReader`] / [`HeadTailGatherer`] used for capture
//! and diagnostics.

pub mod gather;
pub mod line_reader;
pub mod tee;

pub use gather::HeadTailGatherer;
pub use line_reader::LineReader;
pub use tee::{Tee, TeeReader};

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// A readable stream of one stage's output, handed to output and error
/// consumers. Reads either directly from the child's pipe or from one leg
/// of a tee when several consumers share the stream.
pub struct StageReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl StageReader {
    pub(crate) fn new(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self { inner }
    }
}

impl AsyncRead for StageReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

/// A writable stream to one stage's stdin, handed to input producers.
///
/// Dropping it closes the library's end of the pipe, which is how the child
/// observes end of input.
pub struct StageStdin {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl StageStdin {
    pub(crate) fn new(inner: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { inner }
    }

    /// Write a string as UTF-8 bytes.
    pub async fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_all(s.as_bytes()).await
    }

    /// Write a string followed by a newline.
    pub async fn write_line(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_all(s.as_bytes()).await?;
        self.inner.write_all(b"\n").await
    }

    /// Flush and close the stream, signalling end of input to the child.
    pub async fn close(mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Text-oriented view of a stage's stdin, handed to `produce_with`
/// producers. Strings are written as UTF-8.
pub struct StageWriter {
    inner: StageStdin,
}

impl StageWriter {
    pub(crate) fn new(inner: StageStdin) -> Self {
        Self { inner }
    }

    /// Write a string.
    pub async fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_str(s).await
    }

    /// Write a string followed by a newline.
    pub async fn write_line(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_line(s).await
    }

    /// Flush and close the stream, signalling end of input to the child.
    pub async fn close(self) -> io::Result<()> {
        self.inner.close().await
    }
}

impl AsyncWrite for StageStdin {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
