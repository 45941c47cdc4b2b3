//! Stream transports for TCP and TLS sessions
//!
//! A session stream is split once: the read half stays behind a
//! [`BufReader`] so bytes buffered during the handshake reach the reader
//! worker, and the write half goes to the writer worker.

use std::io;

use async_trait::async_trait;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::tls::MaybeTlsStream;
use crate::worker::Transfer;

pub type SessionReadHalf = BufReader<ReadHalf<MaybeTlsStream>>;
pub type SessionWriteHalf = WriteHalf<MaybeTlsStream>;

pub fn split(stream: MaybeTlsStream) -> (SessionReadHalf, SessionWriteHalf) {
    let (read, write) = tokio::io::split(stream);
    (BufReader::new(read), write)
}

/// Reader transport; end of stream counts as a failure.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Transfer for StreamReader<R> {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of stream",
            ));
        }
        Ok(n)
    }
}

/// Writer transport; every call sends the whole buffer.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transfer for StreamWriter<W> {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.write_all(buf).await?;
        Ok(buf.len())
    }
}
