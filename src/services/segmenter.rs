//! Splits one upload stream into chunk-sized windows.
//!
//! The wrapped backend's put receives the reader itself and sees end of
//! input at every window boundary. Between windows the orchestrator calls
//! [`SegmentingReader::start_chunk`] to open the next one.

use crate::models::{
    hash::{HashType, Hasher},
    metadata::MAX_METADATA_SIZE,
};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};

pub struct SegmentingReader<R> {
    inner: BufReader<R>,
    chunk_size: u64,
    /// Bytes left in the current window.
    chunk_limit: u64,
    size_total: Option<u64>,
    size_left: Option<u64>,
    read_count: u64,
    chunk_no: usize,
    done: bool,
    expect_single: bool,
    small_head: Vec<u8>,
    hasher: Option<Hasher>,
}

impl<R: AsyncRead + Unpin> SegmentingReader<R> {
    /// `size_total` of `None` means the input length is unknown.
    pub fn new(inner: R, chunk_size: u64, size_total: Option<u64>, hasher: Option<Hasher>) -> Self {
        Self {
            inner: BufReader::new(inner),
            chunk_size,
            chunk_limit: chunk_size,
            size_total,
            size_left: size_total,
            read_count: 0,
            chunk_no: 0,
            done: false,
            expect_single: size_total.is_some_and(|size| size <= chunk_size),
            small_head: Vec::new(),
            hasher,
        }
    }

    /// Open the window for chunk `chunk_no`.
    pub fn start_chunk(&mut self, chunk_no: usize) {
        self.chunk_no = chunk_no;
        self.chunk_limit = self.chunk_size;
    }

    /// Expected size of the current window, `None` if the input length is
    /// unknown.
    pub fn window_size(&self) -> Option<u64> {
        self.size_left.map(|left| left.min(self.chunk_size))
    }

    /// Peek at the input: true when nothing is left to read.
    pub async fn at_eof(&mut self) -> io::Result<bool> {
        Ok(self.inner.fill_buf().await?.is_empty())
    }

    /// Read and discard `size` bytes of the current window, keeping
    /// accounting and hashes right when the sink stored the data without
    /// reading it.
    pub async fn dummy_read(&mut self, size: u64) -> io::Result<()> {
        if self.hasher.is_none() && self.read_count + size > MAX_METADATA_SIZE as u64 {
            self.account(size);
            return Ok(());
        }
        let copied = tokio::io::copy(&mut (&mut *self).take(size), &mut tokio::io::sink()).await?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("input ended after {copied} of {size} bytes"),
            ));
        }
        Ok(())
    }

    fn account(&mut self, count: u64) {
        self.read_count += count;
        self.chunk_limit = self.chunk_limit.saturating_sub(count);
        if let Some(left) = self.size_left.as_mut() {
            *left = left.saturating_sub(count);
        }
    }

    fn observe(&mut self, data: &[u8]) {
        self.account(data.len() as u64);
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }
        if self.chunk_no == 0 && !data.is_empty() && self.read_count <= MAX_METADATA_SIZE as u64 {
            self.small_head.extend_from_slice(data);
        }
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn size_total(&self) -> Option<u64> {
        self.size_total
    }

    pub fn size_left(&self) -> Option<u64> {
        self.size_left
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_limit(&self) -> u64 {
        self.chunk_limit
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self) {
        self.done = true;
    }

    pub fn expect_single(&self) -> bool {
        self.expect_single
    }

    /// Input bytes seen so far if the whole input fit in the metadata size
    /// limit, otherwise a prefix of it.
    pub fn small_head(&self) -> &[u8] {
        &self.small_head
    }

    /// Finish the running digest, if one was requested.
    pub fn take_hash(&mut self) -> Option<(HashType, String)> {
        self.hasher.take().map(|hasher| (hasher.kind(), hasher.finish()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SegmentingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.chunk_limit == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let max = (buf.remaining() as u64).min(this.chunk_limit) as usize;

        let n = {
            let mut window = ReadBuf::new(buf.initialize_unfilled_to(max));
            match Pin::new(&mut this.inner).poll_read(cx, &mut window) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => {
                    this.done = true;
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(Ok(())) => {}
            }
            let filled = window.filled();
            this.observe(filled);
            filled.len()
        };
        if n == 0 {
            this.done = true;
        }
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}
