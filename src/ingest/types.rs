//! Ingestion types

use serde::{Deserialize, Serialize};

/// What the ingestion trigger knows about an inbound file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    /// Original file name; its extension decides the format
    pub file_name: String,

    /// Identifier of the uploading actor
    pub uploaded_by: String,

    /// Size announced by the client; defaults to the staged byte count
    #[serde(default)]
    pub declared_size: Option<u64>,

    /// Optional library book to link the file to
    #[serde(default)]
    pub book_id: Option<String>,
}

/// Ingestion attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    /// Bytes are arriving from the trigger
    Received,
    /// Bytes sit in a private staging file
    Staged,
    /// Chunks are being hashed and written to the blob store
    Processing,
    /// File and chunk metadata are being committed
    Persisting,
    /// Metadata committed and staging file removed
    Committed,
    /// Attempt abandoned; nothing was committed
    Failed,
}

impl IngestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: IngestState) -> bool {
        use IngestState::*;
        match (self, next) {
            (state, Failed) => !state.is_terminal(),
            (Received, Staged) | (Staged, Processing) | (Processing, Persisting) | (Persisting, Committed) => true,
            _ => false,
        }
    }
}
