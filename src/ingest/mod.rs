//! Ingestion Module
//!
//! Turns an inbound book file into content-addressed chunks:
//! - Staging of the raw upload in a private temp file
//! - Fixed-size chunking with bounded memory
//! - SHA-256 per chunk and for the whole file
//! - Atomic catalog commit of the file and its ordered chunks
//!
//! Flow:
//! 1. Trigger streams the upload into the staging area
//! 2. Chunker reads the staged file one chunk at a time
//! 3. Each chunk is hashed and written to the blob store
//! 4. File and chunk records are committed in one transaction

pub mod chunker;
pub mod pipeline;
pub mod staging;
pub mod types;

pub use chunker::{chunk_count, chunk_sizes, Chunk, Chunker};
pub use pipeline::{IngestPipeline, IngestSettings, ReceivedUpload};
pub use staging::{StagingArea, StagingFile};
pub use types::*;
