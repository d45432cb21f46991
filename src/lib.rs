//! Folio Server Library
//!
//! Content-addressed chunked file storage for a self-hosted book library.
//! The server binary is in main.rs; this crate exposes the storage engine
//! for the binary, integration tests and benchmarks.
//!
//! # Modules
//!
//! - `storage`: hashing, sharded blob store, catalog contract, reclamation
//! - `ingest`: staging, chunking and the ingestion state machine
//! - `retrieval`: ordered chunk reads and file reassembly
//! - `db`: SQLite catalog
//! - `routes`: HTTP upload and download endpoints

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod retrieval;
pub mod routes;
pub mod state;
pub mod storage;
