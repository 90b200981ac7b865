//! Host-facing observability callbacks.
//!
//! The sink is injected at engine construction; the engine holds no
//! ambient global state. Every method defaults to a no-op and is invoked
//! on the engine's thread, so implementations must not block.

use crate::error::EngineError;
use crate::mapping::{EntryId, MappingId};
use conflux_protocol::{Change, ChangeStatus, EngineStatus, MappingStatus, MemberId, MemberStatus};

/// Snapshot of an unresolved conflict, handed to
/// [`EventSink::conflict`].
///
/// Resolution happens through the engine handle:
/// [`Engine::solve`](crate::Engine::solve) picks a winner,
/// [`Engine::duplicate`](crate::Engine::duplicate) splits history.
#[derive(Debug, Clone)]
pub struct ConflictSnapshot {
    /// The conflicted mapping.
    pub mapping: MappingId,
    /// The disagreeing entries, in member registration order.
    pub entries: Vec<ConflictEntry>,
}

/// One entry within a conflict snapshot.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    /// The entry id, usable with [`Engine::solve`](crate::Engine::solve).
    pub entry: EntryId,
    /// The owning member.
    pub member: MemberId,
    /// The member's version of the record.
    pub change: Change,
}

/// Status callbacks exposed by the engine.
pub trait EventSink: Send {
    /// A member's lifecycle status changed.
    fn member_status(&self, member: MemberId, status: MemberStatus, error: Option<&EngineError>) {
        let _ = (member, status, error);
    }

    /// A change record's status changed.
    fn change_status(&self, member: MemberId, uid: &str, status: ChangeStatus) {
        let _ = (member, uid, status);
    }

    /// A mapping's status changed.
    fn mapping_status(&self, mapping: MappingId, status: MappingStatus) {
        let _ = (mapping, status);
    }

    /// An engine-level status event occurred.
    fn engine_status(&self, status: EngineStatus) {
        let _ = status;
    }

    /// A mapping needs conflict resolution.
    fn conflict(&self, conflict: &ConflictSnapshot) {
        let _ = conflict;
    }

    /// A member forwarded a plugin-defined message.
    fn member_message(&self, member: MemberId, name: &str, data: &[u8]) {
        let _ = (member, name, data);
    }
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}
