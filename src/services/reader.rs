//! Reads a composite file as one contiguous byte stream.
//!
//! Chunks are opened lazily, one at a time, with a sub-range derived from the
//! requested window, so memory and open handles stay bounded regardless of
//! file size.

use crate::{
    backend::{Backend, BoxReader, ByteRange},
    errors::ChunkerResult,
    models::object::BaseObject,
};
use bytes::Bytes;
use futures::stream;
use std::{io, sync::Arc};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Cursor over the chunks of one composite file.
pub(crate) struct LinearReader {
    base: Arc<dyn Backend>,
    chunks: Vec<BaseObject>,
    /// Next chunk to open.
    index: usize,
    /// Offset into the next chunk to open.
    offset: u64,
    /// Bytes still to deliver.
    left: u64,
    /// Open chunk and the bytes it still owes.
    current: Option<(BoxReader, u64)>,
}

impl LinearReader {
    /// Open `chunks` for reading the window `range` of a file of `size`
    /// bytes. The first chunk is opened before returning so that open errors
    /// surface here.
    pub(crate) async fn open(
        base: Arc<dyn Backend>,
        chunks: Vec<BaseObject>,
        range: ByteRange,
        size: u64,
    ) -> ChunkerResult<BoxReader> {
        let (start, end) = range.clamp(size);
        let mut reader = Self {
            base,
            chunks,
            index: 0,
            offset: start,
            left: end - start,
            current: None,
        };
        while reader.index < reader.chunks.len() && reader.offset >= reader.chunks[reader.index].size {
            reader.offset -= reader.chunks[reader.index].size;
            reader.index += 1;
        }
        if reader.left > 0 {
            reader.next_chunk().await?;
        }

        let chunks = stream::try_unfold(reader, |mut reader| async move {
            Ok::<_, io::Error>(reader.read_some().await?.map(|data| (data, reader)))
        });
        Ok(Box::new(StreamReader::new(Box::pin(chunks))))
    }

    async fn next_chunk(&mut self) -> ChunkerResult<bool> {
        let Some(chunk) = self.chunks.get(self.index) else {
            return Ok(false);
        };
        let count = (chunk.size - self.offset).min(self.left);
        let reader = self
            .base
            .open(chunk, ByteRange::new(self.offset, Some(count)))
            .await?;
        self.current = Some((reader, count));
        self.index += 1;
        self.offset = 0;
        Ok(true)
    }

    async fn read_some(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.left == 0 {
                self.current = None;
                return Ok(None);
            }
            if self.current.is_none() && !self.next_chunk().await? {
                return Ok(None);
            }
            let Some((reader, owed)) = self.current.as_mut() else {
                return Ok(None);
            };
            if *owed == 0 {
                self.current = None;
                continue;
            }

            let mut buf = vec![0u8; (*owed).min(READ_BUFFER_SIZE as u64) as usize];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("chunk {} ended {owed} bytes early", self.index - 1),
                ));
            }
            buf.truncate(n);
            *owed -= n as u64;
            self.left -= n as u64;
            if *owed == 0 {
                self.current = None;
            }
            return Ok(Some(Bytes::from(buf)));
        }
    }
}
