//! Members, sinks, and record sets for engine tests.
//!
//! The members here are deliberately small: a [`MemoryMember`] backed by a
//! shared record map, a [`FailingMember`] that errors in one chosen phase,
//! and an [`UnresponsiveMember`] that sleeps through its connect call to
//! provoke timeouts.

use conflux_engine::{
    ChangeSink, ConflictSnapshot, EngineError, EngineResult, EventSink, MappingId, Member,
    MemberHandle,
};
use conflux_protocol::{
    Change, ChangeKind, ChangeStatus, EngineStatus, MappingStatus, MemberId, MemberStatus,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A record map shared between a test and the member it backs.
///
/// Clones refer to the same map, so a test can seed records before a sync
/// and inspect the converged state afterwards while the engine owns the
/// member itself.
#[derive(Debug, Clone, Default)]
pub struct SharedRecords {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl SharedRecords {
    /// Creates an empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a record.
    pub fn insert(&self, uid: impl Into<String>, payload: Vec<u8>) {
        self.inner.lock().insert(uid.into(), payload);
    }

    /// Removes a record; returns true if it existed.
    pub fn remove(&self, uid: &str) -> bool {
        self.inner.lock().remove(uid).is_some()
    }

    /// Returns a record's payload.
    pub fn get(&self, uid: &str) -> Option<Vec<u8>> {
        self.inner.lock().get(uid).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the set holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// All uids, sorted.
    pub fn uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.inner.lock().keys().cloned().collect();
        uids.sort();
        uids
    }

    /// A copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.inner.lock().clone()
    }
}

/// Shared slot holding the [`MemberHandle`] a member received at attach.
///
/// Lets a test drive the member's push surface (`request_sync`,
/// `report_change`) from outside the engine.
#[derive(Clone, Default)]
pub struct HandleSlot {
    inner: Arc<Mutex<Option<MemberHandle>>>,
}

impl HandleSlot {
    /// Returns the attached handle, if the engine attached one yet.
    pub fn get(&self) -> Option<MemberHandle> {
        self.inner.lock().clone()
    }
}

/// An in-memory member backed by a [`SharedRecords`] map.
///
/// Fast sync reports the difference against the snapshot taken at the last
/// `sync_done`; slow sync reports every record, unchanged ones included.
pub struct MemoryMember {
    records: SharedRecords,
    baseline: HashMap<String, Vec<u8>>,
    handle: HandleSlot,
}

impl MemoryMember {
    /// Creates a member with an empty record set; returns the shared map.
    pub fn new() -> (Self, SharedRecords) {
        let records = SharedRecords::new();
        (Self::with_records(records.clone()), records)
    }

    /// Creates a member over an existing record set.
    pub fn with_records(records: SharedRecords) -> Self {
        Self {
            records,
            baseline: HashMap::new(),
            handle: HandleSlot::default(),
        }
    }

    /// Returns the slot that will hold the member's push handle.
    pub fn handle_slot(&self) -> HandleSlot {
        self.handle.clone()
    }

    fn report(uid: &str, kind: ChangeKind, payload: &[u8], with_data: bool) -> Change {
        if with_data {
            Change::new(uid, kind, payload.to_vec())
        } else {
            Change::info(uid, kind)
        }
    }
}

impl Member for MemoryMember {
    fn attach(&mut self, handle: MemberHandle) {
        *self.handle.inner.lock() = Some(handle);
    }

    fn connect(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn get_changes(
        &mut self,
        with_data: bool,
        slow_sync: bool,
        sink: &mut dyn ChangeSink,
    ) -> EngineResult<()> {
        let now = self.records.snapshot();
        let mut uids: Vec<&String> = now.keys().collect();
        uids.sort();
        for uid in uids {
            let payload = &now[uid];
            match self.baseline.get(uid) {
                None => sink.report(Self::report(uid, ChangeKind::Added, payload, with_data)),
                Some(old) if old != payload => {
                    sink.report(Self::report(uid, ChangeKind::Modified, payload, with_data));
                }
                Some(_) if slow_sync => {
                    sink.report(Self::report(uid, ChangeKind::Unmodified, payload, with_data));
                }
                Some(_) => {}
            }
        }
        let mut gone: Vec<&String> = self
            .baseline
            .keys()
            .filter(|uid| !now.contains_key(*uid))
            .collect();
        gone.sort();
        for uid in gone {
            sink.report(Change::deleted(uid.as_str()));
        }
        Ok(())
    }

    fn get_change_data(&mut self, change: &Change) -> EngineResult<Change> {
        match self.records.get(&change.uid) {
            Some(payload) => {
                let mut full = change.clone();
                full.payload = Some(payload);
                Ok(full)
            }
            None => Err(EngineError::generic(format!(
                "no such record: {}",
                change.uid
            ))),
        }
    }

    fn commit_change(&mut self, change: &Change) -> EngineResult<()> {
        if change.is_deletion() {
            self.records.remove(&change.uid);
            return Ok(());
        }
        let payload = change
            .payload
            .clone()
            .ok_or_else(|| EngineError::generic(format!("commit without payload: {}", change.uid)))?;
        self.records.insert(change.uid.clone(), payload);
        Ok(())
    }

    fn sync_done(&mut self) -> EngineResult<()> {
        self.baseline = self.records.snapshot();
        Ok(())
    }

    fn disconnect(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// The phase in which a [`FailingMember`] errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPhase {
    /// Fail the connect call.
    Connect,
    /// Fail while reporting changes.
    GetChanges,
    /// Report info-only changes, then fail content delivery.
    GetData,
    /// Fail every commit.
    Commit,
    /// Fail the sync-done acknowledgment.
    SyncDone,
    /// Fail the disconnect call.
    Disconnect,
}

/// A member that behaves like [`MemoryMember`] except for one phase, in
/// which every call errors.
pub struct FailingMember {
    phase: FailPhase,
    records: SharedRecords,
}

impl FailingMember {
    /// Creates a member failing in the given phase; returns the shared map.
    pub fn new(phase: FailPhase) -> (Self, SharedRecords) {
        let records = SharedRecords::new();
        (
            Self {
                phase,
                records: records.clone(),
            },
            records,
        )
    }

    fn fail(&self) -> EngineError {
        EngineError::generic(format!("injected {:?} failure", self.phase))
    }
}

impl Member for FailingMember {
    fn connect(&mut self) -> EngineResult<()> {
        if self.phase == FailPhase::Connect {
            return Err(self.fail());
        }
        Ok(())
    }

    fn get_changes(
        &mut self,
        with_data: bool,
        _slow_sync: bool,
        sink: &mut dyn ChangeSink,
    ) -> EngineResult<()> {
        if self.phase == FailPhase::GetChanges {
            return Err(self.fail());
        }
        // For the GetData phase, withhold content so the engine has to ask
        // for it per record.
        let with_data = with_data && self.phase != FailPhase::GetData;
        let now = self.records.snapshot();
        let mut uids: Vec<&String> = now.keys().collect();
        uids.sort();
        for uid in uids {
            let change = if with_data {
                Change::new(uid.as_str(), ChangeKind::Added, now[uid].clone())
            } else {
                Change::info(uid.as_str(), ChangeKind::Added)
            };
            sink.report(change);
        }
        Ok(())
    }

    fn get_change_data(&mut self, change: &Change) -> EngineResult<Change> {
        if self.phase == FailPhase::GetData {
            return Err(self.fail());
        }
        let mut full = change.clone();
        full.payload = self.records.get(&change.uid);
        Ok(full)
    }

    fn commit_change(&mut self, change: &Change) -> EngineResult<()> {
        if self.phase == FailPhase::Commit {
            return Err(self.fail());
        }
        if change.is_deletion() {
            self.records.remove(&change.uid);
        } else if let Some(payload) = change.payload.clone() {
            self.records.insert(change.uid.clone(), payload);
        }
        Ok(())
    }

    fn sync_done(&mut self) -> EngineResult<()> {
        if self.phase == FailPhase::SyncDone {
            return Err(self.fail());
        }
        Ok(())
    }

    fn disconnect(&mut self) -> EngineResult<()> {
        if self.phase == FailPhase::Disconnect {
            return Err(self.fail());
        }
        Ok(())
    }
}

/// A member whose connect call sleeps past any reasonable timeout.
pub struct UnresponsiveMember {
    delay: Duration,
}

impl UnresponsiveMember {
    /// Creates a member that sleeps `delay` before connecting.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Member for UnresponsiveMember {
    fn connect(&mut self) -> EngineResult<()> {
        std::thread::sleep(self.delay);
        Ok(())
    }

    fn get_changes(
        &mut self,
        _with_data: bool,
        _slow_sync: bool,
        _sink: &mut dyn ChangeSink,
    ) -> EngineResult<()> {
        Ok(())
    }

    fn get_change_data(&mut self, change: &Change) -> EngineResult<Change> {
        Ok(change.clone())
    }

    fn commit_change(&mut self, _change: &Change) -> EngineResult<()> {
        Ok(())
    }

    fn sync_done(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn disconnect(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// One event captured by a [`RecordingSink`].
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// A member status callback.
    Member {
        /// The member.
        member: MemberId,
        /// The reported status.
        status: MemberStatus,
        /// The error, for error statuses.
        error: Option<EngineError>,
    },
    /// A change status callback.
    Change {
        /// The reporting member.
        member: MemberId,
        /// The record uid.
        uid: String,
        /// The reported status.
        status: ChangeStatus,
    },
    /// A mapping status callback.
    Mapping {
        /// The mapping.
        mapping: MappingId,
        /// The reported status.
        status: MappingStatus,
    },
    /// An engine status callback.
    Engine(EngineStatus),
    /// A plugin-defined member message.
    Message {
        /// The originating member.
        member: MemberId,
        /// Message name.
        name: String,
        /// Opaque payload.
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct SinkLog {
    events: Vec<SinkEvent>,
    conflicts: Vec<ConflictSnapshot>,
}

#[derive(Default)]
struct SinkInner {
    log: Mutex<SinkLog>,
    cond: Condvar,
}

/// An [`EventSink`] that records every callback, with wait helpers for
/// asynchronous assertions.
///
/// Clones share the same log; register one clone with the engine and keep
/// the other in the test.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<SinkInner>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: SinkEvent) {
        self.inner.log.lock().events.push(event);
        self.inner.cond.notify_all();
    }

    /// All captured events, in callback order.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.inner.log.lock().events.clone()
    }

    /// Engine statuses, in callback order.
    pub fn engine_statuses(&self) -> Vec<EngineStatus> {
        self.inner
            .log
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Engine(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Statuses reported for one member, in callback order.
    pub fn member_statuses(&self, member: MemberId) -> Vec<MemberStatus> {
        self.inner
            .log
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Member { member: m, status, .. } if *m == member => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Statuses reported for one record uid, in callback order.
    pub fn change_statuses(&self, uid: &str) -> Vec<(MemberId, ChangeStatus)> {
        self.inner
            .log
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Change { member, uid: u, status } if u == uid => {
                    Some((*member, *status))
                }
                _ => None,
            })
            .collect()
    }

    /// Mapping statuses, in callback order.
    pub fn mapping_statuses(&self) -> Vec<(MappingId, MappingStatus)> {
        self.inner
            .log
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Mapping { mapping, status } => Some((*mapping, *status)),
                _ => None,
            })
            .collect()
    }

    /// Plugin messages, in callback order.
    pub fn messages(&self) -> Vec<(MemberId, String, Vec<u8>)> {
        self.inner
            .log
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Message { member, name, data } => {
                    Some((*member, name.clone(), data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Captured conflict snapshots.
    pub fn conflicts(&self) -> Vec<ConflictSnapshot> {
        self.inner.log.lock().conflicts.clone()
    }

    /// Blocks until at least one conflict was reported.
    pub fn wait_for_conflict(&self, timeout: Duration) -> Option<ConflictSnapshot> {
        let mut log = self.inner.log.lock();
        while log.conflicts.is_empty() {
            if self.inner.cond.wait_for(&mut log, timeout).timed_out() {
                return None;
            }
        }
        log.conflicts.first().cloned()
    }

    /// Blocks until the given engine status was reported.
    pub fn wait_for_engine_status(&self, status: EngineStatus, timeout: Duration) -> bool {
        let seen = |log: &SinkLog| {
            log.events
                .iter()
                .any(|e| matches!(e, SinkEvent::Engine(s) if *s == status))
        };
        let mut log = self.inner.log.lock();
        while !seen(&log) {
            if self.inner.cond.wait_for(&mut log, timeout).timed_out() {
                return false;
            }
        }
        true
    }
}

impl EventSink for RecordingSink {
    fn member_status(&self, member: MemberId, status: MemberStatus, error: Option<&EngineError>) {
        self.push(SinkEvent::Member {
            member,
            status,
            error: error.cloned(),
        });
    }

    fn change_status(&self, member: MemberId, uid: &str, status: ChangeStatus) {
        self.push(SinkEvent::Change {
            member,
            uid: uid.to_string(),
            status,
        });
    }

    fn mapping_status(&self, mapping: MappingId, status: MappingStatus) {
        self.push(SinkEvent::Mapping { mapping, status });
    }

    fn engine_status(&self, status: EngineStatus) {
        self.push(SinkEvent::Engine(status));
    }

    fn conflict(&self, conflict: &ConflictSnapshot) {
        let mut log = self.inner.log.lock();
        log.conflicts.push(conflict.clone());
        drop(log);
        self.inner.cond.notify_all();
    }

    fn member_message(&self, member: MemberId, name: &str, data: &[u8]) {
        self.push(SinkEvent::Message {
            member,
            name: name.to_string(),
            data: data.to_vec(),
        });
    }
}
