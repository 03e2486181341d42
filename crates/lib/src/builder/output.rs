//! Per-artifact output sinks.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::AsyncWrite;

/// Hands each artifact build its own output writer.
pub trait OutputSink: Send + Sync {
  fn writer(&self, artifact: &str) -> Box<dyn AsyncWrite + Send + Unpin>;
}

/// Drops all build output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardOutput;

impl OutputSink for DiscardOutput {
  fn writer(&self, _artifact: &str) -> Box<dyn AsyncWrite + Send + Unpin> {
    Box::new(tokio::io::sink())
  }
}

/// Writes build output to stderr, each line prefixed with `[artifact]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrOutput;

impl OutputSink for StderrOutput {
  fn writer(&self, artifact: &str) -> Box<dyn AsyncWrite + Send + Unpin> {
    Box::new(PrefixedWriter::new(tokio::io::stderr(), artifact))
  }
}

/// Prefixes every line written through it.
///
/// A write is framed into `pending` and handed to the inner writer as one
/// buffer; the next write waits until that buffer has drained.
pub(crate) struct PrefixedWriter<W> {
  inner: W,
  prefix: Vec<u8>,
  at_line_start: bool,
  pending: Vec<u8>,
  written: usize,
}

impl<W: AsyncWrite + Unpin> PrefixedWriter<W> {
  pub(crate) fn new(inner: W, artifact: &str) -> Self {
    Self {
      inner,
      prefix: format!("[{artifact}] ").into_bytes(),
      at_line_start: true,
      pending: Vec::new(),
      written: 0,
    }
  }

  fn frame(&mut self, buf: &[u8]) {
    for line in buf.split_inclusive(|b| *b == b'\n') {
      if self.at_line_start {
        self.pending.extend_from_slice(&self.prefix);
      }
      self.pending.extend_from_slice(line);
      self.at_line_start = line.ends_with(b"\n");
    }
  }

  fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    while self.written < self.pending.len() {
      let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
      if n == 0 {
        return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
      }
      self.written += n;
    }
    self.pending.clear();
    self.written = 0;
    Poll::Ready(Ok(()))
  }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for PrefixedWriter<W> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    let this = self.get_mut();
    ready!(this.poll_drain(cx))?;
    this.frame(buf);

    // Start writing now; anything left over drains on the next write or flush
    if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
      return Poll::Ready(Err(e));
    }
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    ready!(this.poll_drain(cx))?;
    Pin::new(&mut this.inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    ready!(this.poll_drain(cx))?;
    Pin::new(&mut this.inner).poll_shutdown(cx)
  }
}
