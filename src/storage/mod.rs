//! Storage Module
//!
//! Content-addressed chunk storage:
//! - SHA-256 digests for chunks and whole files
//! - Sharded filesystem blob store with atomic writes
//! - Catalog contract for file and chunk metadata
//! - Blob reclamation and orphan sweeps

pub mod blob_store;
pub mod catalog;
pub mod hash;
pub mod reclaim;

pub use blob_store::{BlobInfo, BlobLocation, BlobStorage, LocalBlobStorage, PutOutcome};
pub use catalog::{
    Catalog, ChunkRecord, DeletedFile, FileFormat, FileMetadataUpdate, FileRecord, NewChunk,
    NewFile,
};
pub use hash::{compute_hash, verify_hash, FileHasher};
pub use reclaim::{DeletionReport, Reclaimer, SweepReport};
