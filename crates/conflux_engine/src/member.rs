//! The member capability interface and group registration.

use crate::error::EngineResult;
use crate::msg::EngineMsg;
use crate::queue::QueueSender;
use conflux_protocol::{Change, MemberId};

/// Receives changes a member reports during
/// [`Member::get_changes`].
pub trait ChangeSink {
    /// Reports one changed record.
    fn report(&mut self, change: Change);
}

/// One external data source, driven by its client actor.
///
/// Every method runs on the client's thread; a returned error is wrapped
/// into the phase-specific [`EngineError`](crate::EngineError) variant and
/// surfaced through the status callbacks.
pub trait Member: Send {
    /// Hands the member its async push surface. Called once, before any
    /// other method.
    fn attach(&mut self, handle: MemberHandle) {
        let _ = handle;
    }

    /// Connects the data source.
    fn connect(&mut self) -> EngineResult<()>;

    /// Reports changed records into `sink`, then returns.
    ///
    /// With `with_data` the reported changes carry content; otherwise only
    /// change info, and content is fetched later per record. With
    /// `slow_sync` every record is reported, changed or not.
    fn get_changes(
        &mut self,
        with_data: bool,
        slow_sync: bool,
        sink: &mut dyn ChangeSink,
    ) -> EngineResult<()>;

    /// Returns the given change with its content filled in.
    fn get_change_data(&mut self, change: &Change) -> EngineResult<Change>;

    /// Writes a change to the data source.
    fn commit_change(&mut self, change: &Change) -> EngineResult<()>;

    /// Acknowledges the end of a sync cycle.
    fn sync_done(&mut self) -> EngineResult<()>;

    /// Disconnects the data source.
    fn disconnect(&mut self) -> EngineResult<()>;
}

/// Async push surface handed to a member via [`Member::attach`].
///
/// Safe to use from any thread; every call becomes a message on the
/// engine's queue.
#[derive(Clone)]
pub struct MemberHandle {
    member: MemberId,
    tx: QueueSender<EngineMsg>,
}

impl MemberHandle {
    pub(crate) fn new(member: MemberId, tx: QueueSender<EngineMsg>) -> Self {
        Self { member, tx }
    }

    /// The member this handle belongs to.
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Asks the engine for a sync cycle (with data).
    pub fn request_sync(&self) {
        self.tx.send(EngineMsg::RequestSync {
            member: self.member,
        });
    }

    /// Reports a changed record outside of a `get_changes` pass.
    pub fn report_change(&self, change: Change) {
        self.tx.send(EngineMsg::NewChange {
            member: self.member,
            change,
        });
    }

    /// Forwards a plugin-defined message to the host.
    pub fn report_message(&self, name: impl Into<String>, data: Vec<u8>) {
        self.tx.send(EngineMsg::MemberMessage {
            member: self.member,
            name: name.into(),
            data,
        });
    }
}

/// One registered member and its display name.
pub struct MemberSlot {
    /// Display name, used in logs.
    pub name: String,
    /// The member implementation.
    pub member: Box<dyn Member>,
}

/// An ordered collection of members to synchronize.
///
/// Registration order is significant: it decides member ids and the
/// conflict-detection scan order.
#[derive(Default)]
pub struct Group {
    slots: Vec<MemberSlot>,
}

impl Group {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Registers a member and returns its id.
    pub fn add_member(&mut self, name: impl Into<String>, member: Box<dyn Member>) -> MemberId {
        let id = MemberId(self.slots.len() as u32);
        self.slots.push(MemberSlot {
            name: name.into(),
            member,
        });
        id
    }

    /// Number of registered members.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no members are registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn into_slots(self) -> Vec<MemberSlot> {
        self.slots
    }
}
