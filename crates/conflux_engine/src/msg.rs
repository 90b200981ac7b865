//! Closed message enums for the engine and client actors.
//!
//! Each actor pair speaks one enum, matched exhaustively at dispatch; there
//! is no "unknown message" path.

use crate::flag::Edge;
use crate::mapping::{EntryId, MappingId};
use crate::queue::CallId;
use crate::EngineError;
use conflux_protocol::{Change, MemberId};

/// Command sent from the engine to a client actor.
#[derive(Debug, Clone)]
pub(crate) enum ClientOp {
    /// Connect the member.
    Connect,
    /// Ask the member to report its changed records.
    GetChanges {
        /// Report content along with change info.
        with_data: bool,
        /// Report every record, not just changed ones.
        slow_sync: bool,
    },
    /// Fetch the content for one previously reported change.
    GetData {
        /// The change to fill in.
        change: Change,
    },
    /// Commit a change to the member.
    Commit {
        /// The change to write.
        change: Change,
    },
    /// Tell the member the sync cycle completed.
    SyncDone,
    /// Disconnect the member.
    Disconnect,
}

/// Messages consumed by a client actor.
#[derive(Debug)]
pub(crate) enum ClientMsg {
    /// A timed method call from the engine.
    Command {
        /// Call id echoed in the reply.
        call: CallId,
        /// The operation to perform.
        op: ClientOp,
    },
    /// Stop the actor.
    Shutdown,
}

/// Successful reply payload from a client.
#[derive(Debug, Clone)]
pub(crate) enum ReplyBody {
    /// The operation completed with nothing to return.
    Done,
    /// The operation returned record content.
    Data(Change),
}

/// Messages consumed by the engine actor.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    /// Host-facing control requests.
    Control(Control),
    /// A flag transitioned; run the matching decider.
    FlagChanged(Wake, Edge),
    /// A member reported one changed record.
    NewChange {
        /// Reporting member.
        member: MemberId,
        /// The record's state.
        change: Change,
    },
    /// A member asked for a sync cycle.
    RequestSync {
        /// Requesting member.
        member: MemberId,
    },
    /// A member forwarded a plugin-defined message.
    MemberMessage {
        /// Originating member.
        member: MemberId,
        /// Message name.
        name: String,
        /// Opaque payload.
        data: Vec<u8>,
    },
    /// Outcome of a method call (real or synthesized timeout).
    Reply {
        /// Replying member.
        member: MemberId,
        /// The call being answered.
        call: CallId,
        /// The outcome.
        result: Result<ReplyBody, EngineError>,
    },
}

/// Control requests from the engine handle.
#[derive(Debug)]
pub(crate) enum Control {
    /// Start a sync cycle.
    Synchronize {
        /// Fetch record content along with change info.
        with_data: bool,
    },
    /// Raise the stop flag.
    Stop,
    /// Resolve a conflicted mapping by picking a winner.
    Solve {
        /// The conflicted mapping.
        mapping: MappingId,
        /// The winning entry.
        winner: EntryId,
    },
    /// Resolve a conflicted mapping by splitting history.
    Duplicate {
        /// The conflicted mapping.
        mapping: MappingId,
    },
    /// Shut the engine actor down.
    Shutdown,
}

/// Wake token identifying which decider a flag transition concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// A per-client lifecycle flag.
    Client(MemberId),
    /// A per-entry flag.
    Entry(EntryId),
    /// A per-mapping flag or combinator.
    Mapping(MappingId),
    /// An engine-level flag or combinator.
    Engine(EngineFlagKind),
}

/// The engine-level flags that carry wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineFlagKind {
    /// The engine is running a cycle.
    Running,
    /// The stop flag.
    Stop,
    /// Every client connected.
    AllConnected,
    /// Every client reported its changes.
    AllSentChanges,
    /// Every entry is mapped.
    AllEntriesMapped,
    /// Every mapping is synced.
    AllSynced,
    /// Every client finished.
    AllFinished,
}
