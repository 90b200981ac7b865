//! Status events surfaced to host applications.

use serde::{Deserialize, Serialize};

/// Lifecycle status of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// The member connected.
    Connected,
    /// The member finished reporting its changes.
    SentChanges,
    /// The member disconnected.
    Disconnected,
    /// Connecting failed.
    ConnectError,
    /// Reporting changes failed.
    GetChangesError,
    /// Acknowledging sync completion failed.
    SyncDoneError,
    /// Disconnecting failed.
    DisconnectError,
}

/// Status of one change record as it moves through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    /// Change received with content.
    Received,
    /// Change info received, content pending.
    ReceivedInfo,
    /// Change committed to a member.
    Sent,
    /// Committing to a member failed.
    WriteError,
    /// Fetching content from a member failed.
    RecvError,
}

/// Status of one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingStatus {
    /// Conflict resolution chose a master (or none was needed).
    Solved,
    /// All entries of the mapping carry the master's value.
    Synced,
    /// Propagating the master failed for at least one entry.
    WriteError,
}

/// Engine-level status events.
///
/// Exactly one of [`EngineStatus::Success`] or [`EngineStatus::Error`]
/// terminates every sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    /// All members connected.
    EndConnect,
    /// All members reported their changes.
    EndRead,
    /// All mappings propagated their master values.
    EndWrite,
    /// All members disconnected.
    EndDisconnect,
    /// No unresolved conflicts remain.
    EndConflicts,
    /// The previous run did not shut down cleanly; slow sync was requested.
    PrevUnclean,
    /// The sync cycle completed without error.
    Success,
    /// The sync cycle ended with an error.
    Error,
}

impl EngineStatus {
    /// Returns true if this status terminates a sync cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineStatus::Success | EngineStatus::Error)
    }
}
