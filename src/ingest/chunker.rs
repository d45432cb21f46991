//! Fixed-size chunker
//!
//! Reads a byte source of known length one chunk at a time, so at most one
//! chunk of the source is buffered per call.

use std::io::ErrorKind;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{StoreError, StoreResult};

/// One chunk of a source, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Number of chunks for `total_size` bytes: `ceil(total_size / chunk_size)`
pub fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size as u64;
    if chunk_size == 0 {
        return 0;
    }
    (total_size + chunk_size - 1) / chunk_size
}

/// Sizes of each chunk for `total_size` bytes
pub fn chunk_sizes(total_size: u64, chunk_size: usize) -> Vec<u64> {
    let count = chunk_count(total_size, chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size as u64;
            (total_size - start).min(chunk_size as u64)
        })
        .collect()
}

/// Splits a reader into fixed-size chunks
pub struct Chunker<R> {
    reader: R,
    total_size: u64,
    chunk_size: usize,
    next_index: u64,
    consumed: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Create a chunker over `total_size` bytes of `reader`.
    ///
    /// An empty source is rejected here, before any chunk is produced.
    pub fn new(reader: R, total_size: u64, chunk_size: usize) -> StoreResult<Self> {
        if total_size == 0 {
            return Err(StoreError::Validation("File is empty".to_string()));
        }
        if chunk_size == 0 {
            return Err(StoreError::Validation("Chunk size must be greater than zero".to_string()));
        }

        Ok(Self {
            reader,
            total_size,
            chunk_size,
            next_index: 0,
            consumed: 0,
            finished: false,
        })
    }

    /// Total chunks this chunker will produce
    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    /// Read the next chunk, or `None` once the declared size is consumed
    pub async fn next_chunk(&mut self) -> StoreResult<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }

        let remaining = self.total_size - self.consumed;
        if remaining == 0 {
            self.ensure_exhausted().await?;
            self.finished = true;
            return Ok(None);
        }

        let len = remaining.min(self.chunk_size as u64) as usize;
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => StoreError::Validation(format!(
                "Source ended before the declared {} bytes",
                self.total_size
            )),
            _ => StoreError::SourceFetch(format!("Failed to read source: {}", e)),
        })?;

        let chunk = Chunk {
            index: self.next_index,
            data,
        };
        self.next_index += 1;
        self.consumed += len as u64;

        Ok(Some(chunk))
    }

    async fn ensure_exhausted(&mut self) -> StoreResult<()> {
        let mut trailing = [0u8; 1];
        let read = self
            .reader
            .read(&mut trailing)
            .await
            .map_err(|e| StoreError::SourceFetch(format!("Failed to read source: {}", e)))?;

        if read > 0 {
            return Err(StoreError::Validation(format!(
                "Source is longer than the declared {} bytes",
                self.total_size
            )));
        }
        Ok(())
    }

    /// Consume the chunker as an ordered stream of chunks
    pub fn into_stream(self) -> impl Stream<Item = StoreResult<Chunk>>
    where
        R: Send,
    {
        futures::stream::try_unfold(self, |mut chunker| async move {
            Ok(chunker.next_chunk().await?.map(|chunk| (chunk, chunker)))
        })
    }
}
