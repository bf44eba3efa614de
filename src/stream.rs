//! The byte-level stream contract (`spec.md` §6.1) and its in-memory and
//! tokio-backed implementations.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// An async byte-level reader/writer. Suspension only ever happens inside
/// `send`/`recv`/`recv_until`/`recv_line` (`spec.md` §5): packet combinators
/// never suspend on their own.
///
/// `?Send` because the framework runs single-threaded cooperative contexts
/// (`Context` uses `Rc<RefCell<_>>`) and never shares a stream across
/// concurrent tasks.
#[async_trait(?Send)]
pub trait Stream {
    /// Writes `data` to the stream in full.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Reads bytes from the stream.
    ///
    /// `size == None` means "read until EOF". Otherwise, when `exactly` is
    /// true (the default per the spec), a short read is an error; when
    /// false, up to `size` bytes are returned, possibly fewer.
    async fn recv(&mut self, size: Option<usize>, exactly: bool) -> Result<Vec<u8>>;

    /// Reads up to and including the first occurrence of `delimiter`.
    async fn recv_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>>;

    /// Reads up to and including a newline; a missing terminator is a read
    /// error.
    async fn recv_line(&mut self) -> Result<Vec<u8>> {
        self.recv_until(b"\n").await
    }

    /// Closes the stream. Idempotent.
    fn close(&mut self);

    /// Waits for the close initiated by [`Stream::close`] to complete.
    async fn wait_closed(&mut self);
}

/// Convenience helper: reads exactly `size` bytes, the most common case.
pub(crate) async fn recv_exact(stream: &mut dyn Stream, size: usize) -> Result<Vec<u8>> {
    stream.recv(Some(size), true).await
}

/// A scoped acquisition of a stream, guaranteeing `close`/`wait_closed` runs
/// on every exit path, mirroring the original `IStream.__aenter__`/
/// `__aexit__` context-manager contract.
pub struct StreamGuard<S: Stream> {
    stream: Option<S>,
}

impl<S: Stream> StreamGuard<S> {
    /// Acquires the guard over `stream`.
    pub fn new(stream: S) -> Self {
        StreamGuard {
            stream: Some(stream),
        }
    }

    /// Borrows the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.as_mut().expect("StreamGuard used after close")
    }

    /// Closes the stream and waits for it, consuming the guard.
    pub async fn close(mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            stream.wait_closed().await;
        }
    }
}

impl<S: Stream> Drop for StreamGuard<S> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.close();
        }
    }
}

/// An in-memory stream over an owned byte buffer, used for scratch encoding
/// (two-pass postponed fields, `Transformed`, `SizePrefixed`) as well as the
/// `encode_to_bytes`/`decode_from_bytes` convenience operations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStream {
    data: Vec<u8>,
    pos: usize,
}

impl InMemoryStream {
    /// Creates an empty stream, ready to be written to.
    pub fn new() -> Self {
        InMemoryStream {
            data: Vec::new(),
            pos: 0,
        }
    }

    /// Creates a stream pre-loaded with `initial`, ready to be read from.
    pub fn with_data(initial: impl Into<Vec<u8>>) -> Self {
        InMemoryStream {
            data: initial.into(),
            pos: 0,
        }
    }

    /// Whether the read cursor has reached the end of the buffer.
    pub fn at_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Seeks the read cursor back to the start.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Returns all bytes written so far (or the unread remainder, depending
    /// on use: callers typically call this right after encoding).
    pub fn get_data(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// Bytes not yet consumed by `recv`.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

#[async_trait(?Send)]
impl Stream for InMemoryStream {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn recv(&mut self, size: Option<usize>, exactly: bool) -> Result<Vec<u8>> {
        let available = self.data.len() - self.pos;

        let want = match size {
            None => available,
            Some(n) => {
                if exactly && n > available {
                    return Err(Error::StreamRead(format!(
                        "short read: wanted {} bytes, only {} available",
                        n, available
                    )));
                }
                n.min(available)
            }
        };

        let out = self.data[self.pos..self.pos + want].to_vec();
        self.pos += want;
        Ok(out)
    }

    async fn recv_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>> {
        if delimiter.is_empty() {
            return Ok(Vec::new());
        }

        let haystack = &self.data[self.pos..];
        let found = haystack
            .windows(delimiter.len())
            .position(|window| window == delimiter);

        match found {
            Some(idx) => {
                let end = self.pos + idx + delimiter.len();
                let out = self.data[self.pos..end].to_vec();
                self.pos = end;
                Ok(out)
            }
            None => Err(Error::StreamRead(format!(
                "delimiter {:?} not found before end of stream",
                delimiter
            ))),
        }
    }

    fn close(&mut self) {}

    async fn wait_closed(&mut self) {}
}

/// Adapts any `tokio::io::AsyncRead + AsyncWrite` (e.g. a `TcpStream`
/// supplied by the host runtime) to the [`Stream`] contract. The framework
/// never opens such a stream itself; the caller owns its lifecycle.
pub struct IoStream<S> {
    inner: S,
}

impl<S> IoStream<S> {
    /// Wraps an existing reader/writer.
    pub fn new(inner: S) -> Self {
        IoStream { inner }
    }

    /// Unwraps back to the underlying reader/writer.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait(?Send)]
impl<S: AsyncRead + AsyncWrite + Unpin> Stream for IoStream<S> {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(data)
            .await
            .map_err(|e| Error::StreamWrite(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| Error::StreamWrite(e.to_string()))
    }

    async fn recv(&mut self, size: Option<usize>, exactly: bool) -> Result<Vec<u8>> {
        match size {
            None => {
                let mut buf = Vec::new();
                self.inner
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| Error::StreamRead(e.to_string()))?;
                Ok(buf)
            }
            Some(n) if exactly => {
                let mut buf = vec![0u8; n];
                self.inner
                    .read_exact(&mut buf)
                    .await
                    .map_err(|e| Error::StreamRead(e.to_string()))?;
                Ok(buf)
            }
            Some(n) => {
                let mut buf = vec![0u8; n];
                let read = self
                    .inner
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::StreamRead(e.to_string()))?;
                buf.truncate(read);
                Ok(buf)
            }
        }
    }

    async fn recv_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            self.inner
                .read_exact(&mut byte)
                .await
                .map_err(|e| Error::StreamRead(e.to_string()))?;
            out.push(byte[0]);

            if out.len() >= delimiter.len() && out[out.len() - delimiter.len()..] == *delimiter {
                return Ok(out);
            }
        }
    }

    fn close(&mut self) {}

    async fn wait_closed(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn in_memory_roundtrip() {
        let mut stream = InMemoryStream::new();
        stream.send(b"hello").await.unwrap();
        stream.send(b" world").await.unwrap();

        let mut reader = InMemoryStream::with_data(stream.get_data());
        assert_eq!(reader.recv(Some(5), true).await.unwrap(), b"hello");
        assert!(!reader.at_eof());
        assert_eq!(reader.recv(None, true).await.unwrap(), b" world");
        assert!(reader.at_eof());
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let mut reader = InMemoryStream::with_data(b"ab".to_vec());
        assert!(reader.recv(Some(5), true).await.is_err());
    }

    #[tokio::test]
    async fn recv_until_finds_delimiter() {
        let mut reader = InMemoryStream::with_data(b"abc\0def".to_vec());
        assert_eq!(reader.recv_until(b"\0").await.unwrap(), b"abc\0");
        assert_eq!(reader.remaining(), b"def");
    }

    #[tokio::test]
    async fn recv_line_missing_terminator_errors() {
        let mut reader = InMemoryStream::with_data(b"no newline here".to_vec());
        assert!(reader.recv_line().await.is_err());
    }
}
