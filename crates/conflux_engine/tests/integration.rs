//! End-to-end tests driving a real engine with in-memory members.

use conflux_engine::{
    ChangeSink, Engine, EngineConfig, EngineError, EngineResult, ErrorPolicy, Group,
    MappingLink, MappingStore, Member, MemoryMappingStore, StoreSnapshot,
};
use conflux_protocol::{Change, ChangeKind, ChangeStatus, EngineStatus, MemberId, MemberStatus};
use conflux_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A member that records the `slow_sync` flag of every read pass.
#[derive(Default)]
struct SlowSyncProbe {
    log: Arc<Mutex<Vec<bool>>>,
}

impl SlowSyncProbe {
    fn new() -> (Self, Arc<Mutex<Vec<bool>>>) {
        let probe = Self::default();
        let log = Arc::clone(&probe.log);
        (probe, log)
    }
}

impl Member for SlowSyncProbe {
    fn connect(&mut self) -> EngineResult<()> {
        Ok(())
    }
    fn get_changes(
        &mut self,
        _with_data: bool,
        slow_sync: bool,
        _sink: &mut dyn ChangeSink,
    ) -> EngineResult<()> {
        self.log.lock().push(slow_sync);
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

/// A member whose read pass takes a while, reporting nothing.
struct SlowReader {
    delay: Duration,
}

impl Member for SlowReader {
    fn connect(&mut self) -> EngineResult<()> {
        Ok(())
    }
    fn get_changes(
        &mut self,
        _with_data: bool,
        _slow_sync: bool,
        _sink: &mut dyn ChangeSink,
    ) -> EngineResult<()> {
        std::thread::sleep(self.delay);
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

/// A link store the test can keep inspecting after the engine takes it.
#[derive(Clone, Default)]
struct SharedStore {
    inner: Arc<Mutex<MemoryMappingStore>>,
}

impl MappingStore for SharedStore {
    fn load(&mut self) -> EngineResult<StoreSnapshot> {
        self.inner.lock().load()
    }
    fn save(&mut self, link: &MappingLink) -> EngineResult<()> {
        self.inner.lock().save(link)
    }
    fn delete(&mut self, uid: &str, member: MemberId) -> EngineResult<()> {
        self.inner.lock().delete(uid, member)
    }
    fn mark_clean(&mut self, clean: bool) -> EngineResult<()> {
        self.inner.lock().mark_clean(clean)
    }
}

fn wait_for_success_count(sink: &RecordingSink, count: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let successes = sink
            .engine_statuses()
            .iter()
            .filter(|s| **s == EngineStatus::Success)
            .count();
        if successes >= count {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for cycle end");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn two_members_converge() {
    init_tracing();
    let (a, ra) = MemoryMember::new();
    let (b, rb) = MemoryMember::new();
    ra.insert("x", vec![1]);
    ra.insert("y", vec![2]);
    rb.insert("y", vec![2]);

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();
    engine.synchronize_and_block().unwrap();

    assert_eq!(ra.snapshot(), rb.snapshot());
    assert_eq!(ra.get("x"), Some(vec![1]));
    assert_eq!(ra.get("y"), Some(vec![2]));
    assert_eq!(
        sink.engine_statuses(),
        vec![
            EngineStatus::EndConnect,
            EngineStatus::EndRead,
            EngineStatus::EndWrite,
            EngineStatus::EndDisconnect,
            EngineStatus::Success,
        ]
    );
    assert_eq!(
        sink.member_statuses(MemberId(1)),
        vec![
            MemberStatus::Connected,
            MemberStatus::SentChanges,
            MemberStatus::Disconnected,
        ]
    );
    engine.finalize().unwrap();
}

#[test]
fn three_members_converge_to_the_union() {
    let (a, ra) = MemoryMember::new();
    let (b, rb) = MemoryMember::new();
    let (c, rc) = MemoryMember::new();
    ra.insert("only-a", vec![1]);
    rb.insert("only-b", vec![2]);
    rc.insert("only-c", vec![3]);

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));
    group.add_member("c", Box::new(c));

    let engine = Engine::new(group, EngineConfig::new()).unwrap();
    engine.synchronize_and_block().unwrap();

    for records in [&ra, &rb, &rc] {
        assert_eq!(records.uids(), vec!["only-a", "only-b", "only-c"]);
    }
    engine.finalize().unwrap();
}

#[test]
fn conflict_is_reported_and_solved_by_winner() {
    let (a, ra) = MemoryMember::new();
    let (b, rb) = MemoryMember::new();
    ra.insert("u1", vec![1]);
    rb.insert("u1", vec![2]);

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    std::thread::scope(|s| {
        let cycle = s.spawn(|| engine.synchronize_and_block());
        let conflict = sink
            .wait_for_conflict(Duration::from_secs(5))
            .expect("conflict reported");
        assert_eq!(conflict.entries.len(), 2);
        let winner = conflict
            .entries
            .iter()
            .find(|e| e.member == MemberId(0))
            .expect("member 0 in conflict");
        assert_eq!(winner.change.payload, Some(vec![1]));
        engine.solve(conflict.mapping, winner.entry);
        cycle.join().unwrap().unwrap();
    });

    assert_eq!(ra.get("u1"), Some(vec![1]));
    assert_eq!(rb.get("u1"), Some(vec![1]));
    assert!(sink
        .engine_statuses()
        .contains(&EngineStatus::EndConflicts));
    engine.finalize().unwrap();
}

#[test]
fn conflict_duplicate_keeps_both_versions() {
    let (a, ra) = MemoryMember::new();
    let (b, rb) = MemoryMember::new();
    ra.insert("u1", vec![1]);
    rb.insert("u1", vec![2]);

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    std::thread::scope(|s| {
        let cycle = s.spawn(|| engine.synchronize_and_block());
        let conflict = sink
            .wait_for_conflict(Duration::from_secs(5))
            .expect("conflict reported");
        engine.duplicate(conflict.mapping);
        cycle.join().unwrap().unwrap();
    });

    for records in [&ra, &rb] {
        assert_eq!(records.get("u1"), Some(vec![1]));
        assert_eq!(records.get("u1~1"), Some(vec![2]));
    }
    engine.finalize().unwrap();
}

#[test]
fn deletion_propagates() {
    let (a, ra) = MemoryMember::new();
    let (b, rb) = MemoryMember::new();
    ra.insert("x", vec![1]);

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let engine = Engine::new(group, EngineConfig::new()).unwrap();
    engine.synchronize_and_block().unwrap();
    assert_eq!(rb.get("x"), Some(vec![1]));

    ra.remove("x");
    engine.synchronize_and_block().unwrap();
    assert!(ra.is_empty());
    assert!(rb.is_empty());
    engine.finalize().unwrap();
}

#[test]
fn unresponsive_member_times_out() {
    let (b, _rb) = MemoryMember::new();
    let mut group = Group::new();
    group.add_member("stuck", Box::new(UnresponsiveMember::new(Duration::from_millis(300))));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let config = EngineConfig::new().with_call_timeout(Duration::from_millis(50));
    let engine = Engine::builder(group)
        .with_config(config)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    let err = engine.synchronize_and_block().unwrap_err();
    assert!(matches!(err, EngineError::Timeout { member } if member == MemberId(0)));
    assert_eq!(
        sink.engine_statuses().last(),
        Some(&EngineStatus::Error)
    );
    engine.finalize().unwrap();
}

#[test]
fn late_reply_after_timeout_yields_exactly_one_outcome() {
    init_tracing();
    let (b, _rb) = MemoryMember::new();
    let mut group = Group::new();
    group.add_member("late", Box::new(UnresponsiveMember::new(Duration::from_millis(150))));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let config = EngineConfig::new().with_call_timeout(Duration::from_millis(40));
    let engine = Engine::builder(group)
        .with_config(config)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    let err = engine.synchronize_and_block().unwrap_err();
    assert!(matches!(err, EngineError::Timeout { member } if member == MemberId(0)));

    // The member answers its connect call anyway; the engine must settle
    // on the timeout alone, never a second outcome for the same call.
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(
        sink.member_statuses(MemberId(0)),
        vec![MemberStatus::ConnectError]
    );
    engine.finalize().unwrap();
}

#[test]
fn connect_failure_stops_the_cycle() {
    let (failing, _) = FailingMember::new(FailPhase::Connect);
    let (b, rb) = MemoryMember::new();
    rb.insert("b1", vec![9]);

    let mut group = Group::new();
    group.add_member("bad", Box::new(failing));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    let err = engine.synchronize_and_block().unwrap_err();
    assert_eq!(err.member(), Some(MemberId(0)));
    assert!(sink
        .member_statuses(MemberId(0))
        .contains(&MemberStatus::ConnectError));
    // The healthy member still got a clean disconnect.
    assert!(sink
        .member_statuses(MemberId(1))
        .contains(&MemberStatus::Disconnected));
    engine.finalize().unwrap();
}

#[test]
fn continue_policy_syncs_the_remaining_members() {
    let (failing, _) = FailingMember::new(FailPhase::Connect);
    let (a, ra) = MemoryMember::new();
    let (b, rb) = MemoryMember::new();
    ra.insert("x", vec![1]);

    let mut group = Group::new();
    group.add_member("bad", Box::new(failing));
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let config = EngineConfig::new().with_error_policy(ErrorPolicy::Continue);
    let engine = Engine::new(group, config).unwrap();

    // The cycle still ends with the first error, but the healthy members
    // exchanged their records.
    engine.synchronize_and_block().unwrap_err();
    assert_eq!(rb.get("x"), Some(vec![1]));
    engine.finalize().unwrap();
}

#[test]
fn an_error_requests_slow_sync_for_the_next_cycle() {
    let (probe, log) = SlowSyncProbe::new();
    let (failing, _) = FailingMember::new(FailPhase::SyncDone);

    let mut group = Group::new();
    group.add_member("probe", Box::new(probe));
    group.add_member("bad", Box::new(failing));

    let engine = Engine::new(group, EngineConfig::new()).unwrap();
    engine.synchronize_and_block().unwrap_err();
    engine.synchronize_and_block().unwrap_err();

    assert_eq!(*log.lock(), vec![false, true]);
    engine.finalize().unwrap();
}

#[test]
fn forced_slow_sync_applies_every_cycle() {
    let (probe, log) = SlowSyncProbe::new();
    let (b, _rb) = MemoryMember::new();

    let mut group = Group::new();
    group.add_member("probe", Box::new(probe));
    group.add_member("b", Box::new(b));

    let config = EngineConfig::new().with_force_slow_sync(true);
    let engine = Engine::new(group, config).unwrap();
    engine.synchronize_and_block().unwrap();
    engine.synchronize_and_block().unwrap();

    assert_eq!(*log.lock(), vec![true, true]);
    engine.finalize().unwrap();
}

#[test]
fn stop_aborts_the_cycle_without_writing() {
    let (b, rb) = MemoryMember::new();
    rb.insert("y", vec![5]);

    let mut group = Group::new();
    group.add_member("slow", Box::new(SlowReader {
        delay: Duration::from_millis(300),
    }));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    engine.synchronize();
    std::thread::sleep(Duration::from_millis(100));
    engine.stop();
    assert!(sink.wait_for_engine_status(EngineStatus::Success, Duration::from_secs(5)));

    // The record was read but never propagated.
    assert!(!sink
        .change_statuses("y")
        .iter()
        .any(|(_, status)| *status == ChangeStatus::Sent));
    assert!(sink.mapping_statuses().is_empty());
    engine.finalize().unwrap();
}

#[test]
fn member_push_triggers_a_new_cycle() {
    let (a, ra) = MemoryMember::new();
    let slot = a.handle_slot();
    let (b, rb) = MemoryMember::new();

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();
    engine.synchronize_and_block().unwrap();

    let handle = slot.get().expect("handle attached");
    ra.insert("p1", vec![7]);
    handle.report_change(Change::new("p1", ChangeKind::Added, vec![7]));
    handle.request_sync();

    wait_for_success_count(&sink, 2, Duration::from_secs(5));
    assert_eq!(rb.get("p1"), Some(vec![7]));
    engine.finalize().unwrap();
}

#[test]
fn member_messages_reach_the_sink() {
    let (a, _ra) = MemoryMember::new();
    let slot = a.handle_slot();
    let (b, _rb) = MemoryMember::new();

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();
    engine.synchronize_and_block().unwrap();

    let handle = slot.get().expect("handle attached");
    handle.report_message("battery-low", vec![12]);
    engine.finalize().unwrap();

    assert_eq!(
        sink.messages(),
        vec![(MemberId(0), "battery-low".to_string(), vec![12])]
    );
}

#[test]
fn groups_below_two_members_are_rejected() {
    let err = Engine::new(Group::new(), EngineConfig::new()).unwrap_err();
    assert!(matches!(err, EngineError::Misconfiguration(_)));

    let (a, _ra) = MemoryMember::new();
    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    let err = Engine::new(group, EngineConfig::new()).unwrap_err();
    assert!(matches!(err, EngineError::Misconfiguration(_)));

    let (a, _ra) = MemoryMember::new();
    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    let config = EngineConfig::new().with_allow_solo_member(true);
    let engine = Engine::new(group, config).unwrap();
    engine.synchronize_and_block().unwrap();
    engine.finalize().unwrap();
}

#[test]
fn mapping_links_are_persisted_and_the_store_marked_clean() {
    let (a, ra) = MemoryMember::new();
    let (b, _rb) = MemoryMember::new();
    ra.insert("x", vec![1]);

    let mut group = Group::new();
    group.add_member("a", Box::new(a));
    group.add_member("b", Box::new(b));

    let store = SharedStore::default();
    let engine = Engine::builder(group)
        .with_store(Box::new(store.clone()))
        .build()
        .unwrap();
    engine.synchronize_and_block().unwrap();
    engine.finalize().unwrap();

    let snapshot = store.inner.lock().load().unwrap();
    assert_eq!(snapshot.links.len(), 2, "one link per member for the record");
    assert!(snapshot.clean, "clean shutdown is recorded");
    let mappings: Vec<u64> = snapshot.links.iter().map(|l| l.mapping).collect();
    assert_eq!(mappings[0], mappings[1], "both links share the group id");
}

#[test]
fn unclean_store_requests_slow_sync() {
    let (probe, log) = SlowSyncProbe::new();
    let (b, _rb) = MemoryMember::new();

    let store = SharedStore::default();
    store.inner.lock().mark_clean(false).unwrap();

    let mut group = Group::new();
    group.add_member("probe", Box::new(probe));
    group.add_member("b", Box::new(b));

    let sink = RecordingSink::new();
    let engine = Engine::builder(group)
        .with_store(Box::new(store.clone()))
        .with_sink(Box::new(sink.clone()))
        .build()
        .unwrap();
    assert_eq!(sink.engine_statuses(), vec![EngineStatus::PrevUnclean]);

    engine.synchronize_and_block().unwrap();
    assert_eq!(*log.lock(), vec![true]);

    // A successful cycle clears the request again.
    engine.synchronize_and_block().unwrap();
    assert_eq!(*log.lock(), vec![true, false]);
    engine.finalize().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn members_with_disjoint_records_always_converge(
        map_a in record_map_strategy(6),
        map_b in record_map_strategy(6),
    ) {
        let (a, ra) = MemoryMember::new();
        let (b, rb) = MemoryMember::new();
        for (uid, payload) in &map_a {
            ra.insert(format!("a-{uid}"), payload.clone());
        }
        for (uid, payload) in &map_b {
            rb.insert(format!("b-{uid}"), payload.clone());
        }

        let mut group = Group::new();
        group.add_member("a", Box::new(a));
        group.add_member("b", Box::new(b));

        let engine = Engine::new(group, EngineConfig::new()).unwrap();
        engine.synchronize_and_block().unwrap();

        let expected: HashMap<String, Vec<u8>> = map_a
            .iter()
            .map(|(uid, payload)| (format!("a-{uid}"), payload.clone()))
            .chain(
                map_b
                    .iter()
                    .map(|(uid, payload)| (format!("b-{uid}"), payload.clone())),
            )
            .collect();
        prop_assert_eq!(ra.snapshot(), expected.clone());
        prop_assert_eq!(rb.snapshot(), expected);
        engine.finalize().unwrap();
    }
}
