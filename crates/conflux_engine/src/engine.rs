//! The engine actor and its public handle.
//!
//! The engine owns every client, the mapping table, and all flags; they
//! are mutated only on the engine's thread. Flag transitions become
//! `FlagChanged` messages on the engine's own queue, so decider dispatch
//! is always a fresh message, never a recursive call.

use crate::client::ClientActor;
use crate::compare::{ChangeFormat, EqualityFormat};
use crate::config::{EngineConfig, ErrorPolicy};
use crate::decider::{
    decide_client, decide_entry, decide_mapping, ClientAction, ClientFlags, EngineFlags,
    EntryAction, MappingAction,
};
use crate::error::{EngineError, EngineResult};
use crate::flag::{Edge, FlagArena};
use crate::mapping::{
    CheckOutcome, EntryId, MappingId, MappingTable, StoreOp, TableFlags,
};
use crate::member::Group;
use crate::msg::{ClientMsg, ClientOp, Control, EngineFlagKind, EngineMsg, ReplyBody, Wake};
use crate::observer::{ConflictEntry, ConflictSnapshot, EventSink, NullSink};
use crate::queue::{CallId, EventLoop, Polled, QueueSender};
use crate::store::{MappingStore, MemoryMappingStore};
use conflux_protocol::{ChangeStatus, EngineStatus, MappingStatus, MemberId, MemberStatus};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A completion signaled once per cycle, consumable by many waiters.
struct CycleGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    epoch: u64,
    last: Option<EngineResult<()>>,
}

impl CycleGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                epoch: 0,
                last: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    fn signal(&self, outcome: EngineResult<()>) {
        let mut s = self.state.lock();
        s.epoch += 1;
        s.last = Some(outcome);
        self.cond.notify_all();
    }

    fn wait_after(&self, epoch: u64) -> EngineResult<()> {
        let mut s = self.state.lock();
        while s.epoch <= epoch {
            self.cond.wait(&mut s);
        }
        s.last.clone().unwrap_or(Ok(()))
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    group: Group,
    config: EngineConfig,
    format: Box<dyn ChangeFormat>,
    store: Box<dyn MappingStore>,
    sink: Box<dyn EventSink>,
}

impl EngineBuilder {
    fn new(group: Group) -> Self {
        Self {
            group,
            config: EngineConfig::default(),
            format: Box::new(EqualityFormat),
            store: Box::new(MemoryMappingStore::new()),
            sink: Box::new(NullSink),
        }
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the format/compare service.
    pub fn with_format(mut self, format: Box<dyn ChangeFormat>) -> Self {
        self.format = format;
        self
    }

    /// Sets the mapping-link store.
    pub fn with_store(mut self, store: Box<dyn MappingStore>) -> Self {
        self.store = store;
        self
    }

    /// Sets the status sink.
    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validates the group, spawns the client and engine actors, and
    /// returns the handle.
    pub fn build(self) -> EngineResult<Engine> {
        let EngineBuilder {
            group,
            config,
            format,
            mut store,
            sink,
        } = self;

        if group.is_empty() {
            return Err(EngineError::Misconfiguration(
                "a group needs at least one member".into(),
            ));
        }
        if group.len() < 2 && !config.allow_solo_member {
            return Err(EngineError::Misconfiguration(
                "synchronization needs at least two members".into(),
            ));
        }

        let lp: EventLoop<EngineMsg> = EventLoop::new();
        let self_tx = lp.sender();

        let mut flags: FlagArena<Wake> = FlagArena::new();
        let eng = EngineFlags {
            running: flags.alloc(false, Some(Wake::Engine(EngineFlagKind::Running))),
            want_data: flags.alloc(false, None),
            stop: flags.alloc(false, Some(Wake::Engine(EngineFlagKind::Stop))),
            all_connected: flags.alloc_all(false, Some(Wake::Engine(EngineFlagKind::AllConnected))),
            all_sent_changes: flags
                .alloc_all(false, Some(Wake::Engine(EngineFlagKind::AllSentChanges))),
            all_entries_mapped: flags
                .alloc_all(true, Some(Wake::Engine(EngineFlagKind::AllEntriesMapped))),
            all_synced: flags.alloc_all(true, Some(Wake::Engine(EngineFlagKind::AllSynced))),
            all_finished: flags.alloc_all(false, Some(Wake::Engine(EngineFlagKind::AllFinished))),
        };

        let mut clients = Vec::new();
        let mut members = Vec::new();
        for (idx, slot) in group.into_slots().into_iter().enumerate() {
            let member_id = MemberId(idx as u32);
            members.push(member_id);
            let fl = ClientFlags {
                connected: flags.alloc(false, Some(Wake::Client(member_id))),
                sent_changes: flags.alloc(false, Some(Wake::Client(member_id))),
                done: flags.alloc(false, Some(Wake::Client(member_id))),
                finished: flags.alloc(false, Some(Wake::Client(member_id))),
            };
            flags.attach(fl.connected, eng.all_connected);
            flags.attach(fl.sent_changes, eng.all_sent_changes);
            flags.attach(fl.finished, eng.all_finished);
            let spawned =
                ClientActor::spawn(member_id, slot.name.clone(), slot.member, self_tx.clone());
            let (tx, thread) = match spawned {
                Ok(pair) => pair,
                Err(e) => {
                    join_clients(&mut clients);
                    return Err(EngineError::generic(format!(
                        "failed to spawn client thread: {e}"
                    )));
                }
            };
            clients.push(ClientState {
                name: slot.name,
                tx,
                thread: Some(thread),
                fl,
            });
        }
        // Attachment of all-false children must not have produced events.
        let _ = flags.drain_events();

        let mut table = MappingTable::new(
            members,
            TableFlags {
                all_entries_mapped: eng.all_entries_mapped,
                all_synced: eng.all_synced,
            },
        );

        let snapshot = store.load()?;
        table.seed_links(&snapshot.links);
        let mut slow_sync = config.force_slow_sync;
        if !snapshot.clean {
            sink.engine_status(EngineStatus::PrevUnclean);
            slow_sync = true;
        }

        let sync_gate = Arc::new(CycleGate::new());
        let info_gate = Arc::new(CycleGate::new());

        let actor = EngineActor {
            config,
            format,
            store,
            sink,
            lp,
            self_tx: self_tx.clone(),
            flags,
            eng,
            clients,
            table,
            calls: HashMap::new(),
            first_error: None,
            slow_sync,
            unresolved: HashSet::new(),
            cycle_active: false,
            pending_resync: false,
            info_signaled: false,
            marks: CycleMarks::default(),
            sync_gate: Arc::clone(&sync_gate),
            info_gate: Arc::clone(&info_gate),
        };
        let thread = thread::Builder::new()
            .name("conflux-engine".into())
            .spawn(move || actor.run())
            .map_err(|e| EngineError::generic(format!("failed to spawn engine thread: {e}")))?;

        Ok(Engine {
            tx: self_tx,
            thread: Some(thread),
            sync_gate,
            info_gate,
        })
    }
}

/// Handle to a running sync engine.
///
/// Dropping the handle shuts the engine down; [`Engine::finalize`] does
/// the same explicitly.
pub struct Engine {
    tx: QueueSender<EngineMsg>,
    thread: Option<JoinHandle<()>>,
    sync_gate: Arc<CycleGate>,
    info_gate: Arc<CycleGate>,
}

impl Engine {
    /// Starts building an engine for the group.
    pub fn builder(group: Group) -> EngineBuilder {
        EngineBuilder::new(group)
    }

    /// Builds an engine with default services.
    pub fn new(group: Group, config: EngineConfig) -> EngineResult<Engine> {
        EngineBuilder::new(group).with_config(config).build()
    }

    /// Requests a sync cycle and returns immediately.
    pub fn synchronize(&self) {
        self.tx
            .send(EngineMsg::Control(Control::Synchronize { with_data: true }));
    }

    /// Requests a sync cycle and blocks until it terminates.
    pub fn synchronize_and_block(&self) -> EngineResult<()> {
        let epoch = self.sync_gate.epoch();
        self.synchronize();
        self.sync_gate.wait_after(epoch)
    }

    /// Blocks until the current/next cycle terminates.
    pub fn wait_sync_end(&self) -> EngineResult<()> {
        self.sync_gate.wait_after(self.sync_gate.epoch())
    }

    /// Blocks until the info phase of the current/next cycle completes
    /// (every member reported its changes).
    pub fn wait_info_end(&self) -> EngineResult<()> {
        self.info_gate.wait_after(self.info_gate.epoch())
    }

    /// Raises the stop flag; connected clients disconnect instead of
    /// doing further work. In-flight calls complete or time out normally.
    pub fn stop(&self) {
        self.tx.send(EngineMsg::Control(Control::Stop));
    }

    /// Resolves a reported conflict by naming the winning entry.
    pub fn solve(&self, mapping: MappingId, winner: EntryId) {
        self.tx
            .send(EngineMsg::Control(Control::Solve { mapping, winner }));
    }

    /// Resolves a reported conflict by splitting history: divergent
    /// entries become new records everywhere.
    pub fn duplicate(&self, mapping: MappingId) {
        self.tx
            .send(EngineMsg::Control(Control::Duplicate { mapping }));
    }

    /// Shuts the engine down and joins its actors.
    pub fn finalize(mut self) -> EngineResult<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.tx.send(EngineMsg::Control(Control::Shutdown));
            let _ = thread.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

struct ClientState {
    name: String,
    tx: QueueSender<ClientMsg>,
    thread: Option<JoinHandle<()>>,
    fl: ClientFlags,
}

fn join_clients(clients: &mut [ClientState]) {
    for client in clients.iter() {
        client.tx.send(ClientMsg::Shutdown);
    }
    for client in clients.iter_mut() {
        if let Some(thread) = client.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Connect,
    GetChanges,
    GetData,
    Commit,
    SyncDone,
    Disconnect,
}

struct CallCtx {
    kind: OpKind,
    entry: Option<EntryId>,
}

/// Per-cycle once-only status marks.
#[derive(Debug, Default)]
struct CycleMarks {
    end_connect: bool,
    end_read: bool,
    end_write: bool,
}

struct EngineActor {
    config: EngineConfig,
    format: Box<dyn ChangeFormat>,
    store: Box<dyn MappingStore>,
    sink: Box<dyn EventSink>,
    lp: EventLoop<EngineMsg>,
    self_tx: QueueSender<EngineMsg>,
    flags: FlagArena<Wake>,
    eng: EngineFlags,
    clients: Vec<ClientState>,
    table: MappingTable,
    calls: HashMap<CallId, CallCtx>,
    first_error: Option<EngineError>,
    slow_sync: bool,
    unresolved: HashSet<MappingId>,
    cycle_active: bool,
    pending_resync: bool,
    info_signaled: bool,
    marks: CycleMarks,
    sync_gate: Arc<CycleGate>,
    info_gate: Arc<CycleGate>,
}

impl EngineActor {
    fn run(mut self) {
        loop {
            match self.lp.next() {
                Polled::Message(msg) => {
                    let keep_going = self.handle(msg);
                    self.pump();
                    if !keep_going {
                        break;
                    }
                }
                Polled::Closed => break,
            }
        }
        self.shutdown_clients();
        info!("engine actor stopped");
    }

    fn shutdown_clients(&mut self) {
        for client in &self.clients {
            debug!(name = %client.name, "stopping client");
        }
        join_clients(&mut self.clients);
    }

    /// Turns flag transitions into signals on our own queue.
    fn pump(&mut self) {
        for (wake, edge) in self.flags.drain_events() {
            self.self_tx.send(EngineMsg::FlagChanged(wake, edge));
        }
    }

    fn handle(&mut self, msg: EngineMsg) -> bool {
        match msg {
            EngineMsg::Control(Control::Synchronize { with_data }) => {
                self.start_cycle(with_data);
            }
            EngineMsg::Control(Control::Stop) => {
                if self.cycle_active {
                    self.flags.set(self.eng.stop);
                }
            }
            EngineMsg::Control(Control::Solve { mapping, winner }) => {
                self.on_solve(mapping, winner);
            }
            EngineMsg::Control(Control::Duplicate { mapping }) => {
                self.on_duplicate(mapping);
            }
            EngineMsg::Control(Control::Shutdown) => {
                let _ = self.store.mark_clean(!self.cycle_active);
                return false;
            }
            EngineMsg::FlagChanged(wake, edge) => self.on_flag(wake, edge),
            EngineMsg::NewChange { member, change } => {
                let uid = change.uid.clone();
                let status = if change.has_data() {
                    ChangeStatus::Received
                } else {
                    ChangeStatus::ReceivedInfo
                };
                self.table.store_change(&mut self.flags, member, change);
                self.sink.change_status(member, &uid, status);
            }
            EngineMsg::RequestSync { member } => {
                debug!(%member, "member requested sync");
                if self.cycle_active {
                    self.pending_resync = true;
                } else {
                    self.start_cycle(true);
                }
            }
            EngineMsg::MemberMessage { member, name, data } => {
                self.sink.member_message(member, &name, &data);
            }
            EngineMsg::Reply {
                member,
                call,
                result,
            } => self.on_reply(member, call, result),
        }
        true
    }

    fn start_cycle(&mut self, with_data: bool) {
        if self.cycle_active {
            debug!("synchronize requested while a cycle is active");
            return;
        }
        info!(slow_sync = self.slow_sync, "starting sync cycle");
        self.cycle_active = true;
        self.first_error = None;
        self.info_signaled = false;
        self.marks = CycleMarks::default();
        if self.config.force_slow_sync {
            self.slow_sync = true;
        }
        if let Err(e) = self.store.mark_clean(false) {
            warn!(error = %e, "failed to mark store dirty");
        }
        if with_data {
            self.flags.set(self.eng.want_data);
        } else {
            self.flags.unset(self.eng.want_data);
        }
        self.flags.set(self.eng.running);
    }

    fn on_flag(&mut self, wake: Wake, edge: Edge) {
        match wake {
            Wake::Client(member) => self.run_client(member),
            Wake::Entry(entry) => self.run_entry(entry),
            Wake::Mapping(mapping) => self.run_mapping(mapping),
            Wake::Engine(kind) => self.on_engine_flag(kind, edge),
        }
    }

    fn on_engine_flag(&mut self, kind: EngineFlagKind, edge: Edge) {
        if edge == Edge::Falling {
            return;
        }
        match kind {
            EngineFlagKind::Running | EngineFlagKind::Stop => self.run_all(),
            EngineFlagKind::AllConnected => {
                if !self.marks.end_connect {
                    self.marks.end_connect = true;
                    self.sink.engine_status(EngineStatus::EndConnect);
                }
                self.run_all();
            }
            EngineFlagKind::AllSentChanges => {
                if !self.marks.end_read {
                    self.marks.end_read = true;
                    self.sink.engine_status(EngineStatus::EndRead);
                }
                if !self.info_signaled {
                    self.info_signaled = true;
                    self.info_gate.signal(Ok(()));
                }
                self.run_all();
            }
            EngineFlagKind::AllEntriesMapped => self.run_all(),
            EngineFlagKind::AllSynced => {
                if !self.marks.end_write && self.marks.end_read {
                    self.marks.end_write = true;
                    self.sink.engine_status(EngineStatus::EndWrite);
                }
                self.run_all();
            }
            EngineFlagKind::AllFinished => self.end_cycle(),
        }
    }

    fn run_all(&mut self) {
        for idx in 0..self.clients.len() {
            self.run_client(MemberId(idx as u32));
        }
        for entry in self.table.entry_ids() {
            self.run_entry(entry);
        }
        for mapping in self.table.mapping_ids() {
            self.run_mapping(mapping);
        }
    }

    fn run_client(&mut self, member: MemberId) {
        let cl = self.clients[member.0 as usize].fl;
        match decide_client(&self.flags, &self.eng, &cl) {
            Some(ClientAction::Connect) => {
                self.flags.set_changing(cl.connected);
                self.send_command(member, ClientOp::Connect, OpKind::Connect, None);
            }
            Some(ClientAction::GetChanges) => {
                self.flags.set_changing(cl.sent_changes);
                let with_data = self.flags.is_set(self.eng.want_data);
                let op = ClientOp::GetChanges {
                    with_data,
                    slow_sync: self.slow_sync,
                };
                self.send_command(member, op, OpKind::GetChanges, None);
            }
            Some(ClientAction::SyncDone) => {
                self.flags.set_changing(cl.done);
                self.send_command(member, ClientOp::SyncDone, OpKind::SyncDone, None);
            }
            Some(ClientAction::Disconnect) => {
                self.flags.set_changing(cl.connected);
                self.send_command(member, ClientOp::Disconnect, OpKind::Disconnect, None);
            }
            None => {}
        }
    }

    fn run_entry(&mut self, entry: EntryId) {
        if !self.table.contains_entry(entry) {
            return;
        }
        let action = decide_entry(&self.flags, &self.eng, self.table.entry(entry));
        match action {
            Some(EntryAction::GetData) => {
                let (member, change, fl_has_data) = {
                    let e = self.table.entry(entry);
                    (e.member, e.change.clone(), e.fl_has_data)
                };
                self.flags.set_changing(fl_has_data);
                self.send_command(member, ClientOp::GetData { change }, OpKind::GetData, Some(entry));
            }
            Some(EntryAction::Map) => {
                let (mapping, ops) =
                    self.table
                        .map_entry(&mut self.flags, self.format.as_ref(), entry);
                debug!(%entry, %mapping, "entry mapped");
                self.apply_store_ops(ops);
            }
            Some(EntryAction::Commit) => {
                let (member, change, fl_dirty) = {
                    let e = self.table.entry(entry);
                    (e.member, e.change.clone(), e.fl_dirty)
                };
                self.flags.set_changing(fl_dirty);
                self.send_command(member, ClientOp::Commit { change }, OpKind::Commit, Some(entry));
            }
            None => {}
        }
    }

    fn run_mapping(&mut self, mapping: MappingId) {
        if !self.table.contains_mapping(mapping) {
            return;
        }
        let action = decide_mapping(&self.flags, &self.eng, self.table.mapping(mapping));
        match action {
            Some(MappingAction::CheckConflict) => {
                match self
                    .table
                    .check_conflict(&mut self.flags, self.format.as_ref(), mapping)
                {
                    CheckOutcome::Solved { master } => {
                        debug!(%mapping, %master, "mapping solved without conflict");
                        self.sink.mapping_status(mapping, MappingStatus::Solved);
                        self.multiply(mapping);
                    }
                    CheckOutcome::Conflict => {
                        warn!(%mapping, "conflict detected");
                        self.unresolved.insert(mapping);
                        let entries = self
                            .table
                            .conflict_entries(mapping)
                            .into_iter()
                            .map(|(entry, member, change)| ConflictEntry {
                                entry,
                                member,
                                change,
                            })
                            .collect();
                        let snapshot = ConflictSnapshot { mapping, entries };
                        self.sink.conflict(&snapshot);
                    }
                }
            }
            Some(MappingAction::Reset) => {
                self.sink.mapping_status(mapping, MappingStatus::Synced);
                self.table.reset_mapping(&mut self.flags, mapping);
            }
            Some(MappingAction::Delete) => {
                debug!(%mapping, "deleting mapping");
                let ops = self.table.delete_mapping(&mut self.flags, mapping);
                self.apply_store_ops(ops);
            }
            None => {}
        }
    }

    fn multiply(&mut self, mapping: MappingId) {
        let (_dirtied, ops) =
            self.table
                .multiply_master(&mut self.flags, self.format.as_ref(), mapping);
        self.apply_store_ops(ops);
    }

    fn on_solve(&mut self, mapping: MappingId, winner: EntryId) {
        if !self.table.contains_mapping(mapping)
            || !self.table.contains_entry(winner)
            || self.table.entry(winner).mapping != Some(mapping)
        {
            warn!(%mapping, %winner, "solve ignored: stale mapping or entry");
            return;
        }
        self.table.set_master(&mut self.flags, mapping, winner);
        self.sink.mapping_status(mapping, MappingStatus::Solved);
        self.conflict_resolved(mapping);
        self.multiply(mapping);
    }

    fn on_duplicate(&mut self, mapping: MappingId) {
        if !self.table.contains_mapping(mapping) {
            warn!(%mapping, "duplicate ignored: stale mapping");
            return;
        }
        let out = self.table.duplicate(
            &mut self.flags,
            self.format.as_ref(),
            mapping,
            self.config.max_identity_elevation,
        );
        self.apply_store_ops(out.store_ops);
        self.sink.mapping_status(mapping, MappingStatus::Solved);
        self.conflict_resolved(mapping);
        self.multiply(mapping);
        for new_mapping in out.new_mappings {
            self.sink.mapping_status(new_mapping, MappingStatus::Solved);
            self.multiply(new_mapping);
        }
    }

    fn conflict_resolved(&mut self, mapping: MappingId) {
        if self.unresolved.remove(&mapping) && self.unresolved.is_empty() {
            self.sink.engine_status(EngineStatus::EndConflicts);
        }
    }

    fn send_command(
        &mut self,
        member: MemberId,
        op: ClientOp,
        kind: OpKind,
        entry: Option<EntryId>,
    ) {
        let call = CallId::next();
        debug!(%member, ?op, ?call, "sending command");
        self.calls.insert(call, CallCtx { kind, entry });
        self.lp.arm(
            call,
            self.config.call_timeout,
            EngineMsg::Reply {
                member,
                call,
                result: Err(EngineError::Timeout { member }),
            },
        );
        self.clients[member.0 as usize]
            .tx
            .send(ClientMsg::Command { call, op });
    }

    fn record_error(&mut self, error: &EngineError) {
        if self.first_error.is_none() {
            self.first_error = Some(error.clone());
        }
    }

    fn on_reply(
        &mut self,
        member: MemberId,
        call: CallId,
        result: Result<ReplyBody, EngineError>,
    ) {
        // The call context is the at-most-one-reply guard: a synthesized
        // timeout has already left the loop's pending table, so whichever
        // outcome removes the context first wins.
        let Some(ctx) = self.calls.remove(&call) else {
            debug!(%member, ?call, "reply lost the race, dropped");
            return;
        };
        let _ = self.lp.disarm(call);
        let cl = self.clients[member.0 as usize].fl;
        match ctx.kind {
            OpKind::Connect => match result {
                Ok(_) => {
                    self.flags.set(cl.connected);
                    self.sink
                        .member_status(member, MemberStatus::Connected, None);
                }
                Err(e) => {
                    warn!(%member, error = %e, "connect failed");
                    self.flags.cancel_changing(cl.connected);
                    self.sink
                        .member_status(member, MemberStatus::ConnectError, Some(&e));
                    self.record_error(&e);
                    self.flags.set(cl.finished);
                    self.apply_failure_policy(member);
                }
            },
            OpKind::GetChanges => match result {
                Ok(_) => {
                    self.flags.set(cl.sent_changes);
                    self.sink
                        .member_status(member, MemberStatus::SentChanges, None);
                }
                Err(e) => {
                    warn!(%member, error = %e, "get-changes failed");
                    self.flags.cancel_changing(cl.sent_changes);
                    self.sink
                        .member_status(member, MemberStatus::GetChangesError, Some(&e));
                    self.record_error(&e);
                    match self.config.error_policy {
                        ErrorPolicy::StopAll => self.flags.set(self.eng.stop),
                        ErrorPolicy::Continue => {
                            self.flags.detach(cl.sent_changes);
                            // This member is out of the cycle; let it wind
                            // down through the normal disconnect path.
                            self.flags.set(cl.done);
                        }
                    }
                }
            },
            OpKind::GetData => {
                let Some(entry) = ctx.entry else { return };
                if !self.table.contains_entry(entry) {
                    return;
                }
                let uid = self.table.entry(entry).change.uid.clone();
                match result {
                    Ok(ReplyBody::Data(change)) => {
                        self.table.set_entry_data(&mut self.flags, entry, change);
                        self.sink.change_status(member, &uid, ChangeStatus::Received);
                    }
                    // A data request is always answered with data; treat
                    // anything else as not delivered.
                    Ok(ReplyBody::Done) => {
                        let fl_has_data = self.table.entry(entry).fl_has_data;
                        self.flags.cancel_changing(fl_has_data);
                    }
                    Err(e) => {
                        warn!(%member, %entry, error = %e, "get-data failed");
                        let fl_has_data = self.table.entry(entry).fl_has_data;
                        self.flags.cancel_changing(fl_has_data);
                        self.sink
                            .change_status(member, &uid, ChangeStatus::RecvError);
                        self.record_error(&e);
                        match self.config.error_policy {
                            ErrorPolicy::StopAll => self.flags.set(self.eng.stop),
                            // Without the stop flag the decider would keep
                            // re-requesting the content; drop the entry
                            // instead.
                            ErrorPolicy::Continue => {
                                self.table.discard_entry(&mut self.flags, entry);
                            }
                        }
                    }
                }
            }
            OpKind::Commit => {
                let Some(entry) = ctx.entry else { return };
                if !self.table.contains_entry(entry) {
                    return;
                }
                let (uid, fl_dirty, fl_synced, mapping) = {
                    let e = self.table.entry(entry);
                    (e.change.uid.clone(), e.fl_dirty, e.fl_synced, e.mapping)
                };
                match result {
                    Ok(_) => {
                        self.flags.unset(fl_dirty);
                        self.flags.set(fl_synced);
                        self.sink.change_status(member, &uid, ChangeStatus::Sent);
                    }
                    Err(e) => {
                        warn!(%member, %entry, error = %e, "commit failed");
                        self.sink
                            .change_status(member, &uid, ChangeStatus::WriteError);
                        if let Some(mapping) = mapping {
                            self.sink
                                .mapping_status(mapping, MappingStatus::WriteError);
                        }
                        self.record_error(&e);
                        // Give the entry up for this cycle; the error is
                        // recorded and the cycle can still terminate.
                        self.flags.unset(fl_dirty);
                        self.flags.set(fl_synced);
                    }
                }
            }
            OpKind::SyncDone => match result {
                Ok(_) => self.flags.set(cl.done),
                Err(e) => {
                    warn!(%member, error = %e, "sync-done failed");
                    self.sink
                        .member_status(member, MemberStatus::SyncDoneError, Some(&e));
                    self.record_error(&e);
                    self.flags.set(cl.done);
                }
            },
            OpKind::Disconnect => {
                match result {
                    Ok(_) => {
                        self.sink
                            .member_status(member, MemberStatus::Disconnected, None);
                    }
                    Err(e) => {
                        warn!(%member, error = %e, "disconnect failed");
                        self.sink
                            .member_status(member, MemberStatus::DisconnectError, Some(&e));
                        self.record_error(&e);
                    }
                }
                self.flags.unset(cl.connected);
                self.flags.set(cl.finished);
            }
        }
    }

    /// Connect-phase failure policy: historically the whole engine stops;
    /// the alternative lets the remaining members continue.
    fn apply_failure_policy(&mut self, member: MemberId) {
        match self.config.error_policy {
            ErrorPolicy::StopAll => self.flags.set(self.eng.stop),
            ErrorPolicy::Continue => {
                let cl = self.clients[member.0 as usize].fl;
                self.flags.detach(cl.connected);
                self.flags.detach(cl.sent_changes);
            }
        }
    }

    fn end_cycle(&mut self) {
        self.sink.engine_status(EngineStatus::EndDisconnect);
        let outcome = match &self.first_error {
            Some(e) => {
                info!(error = %e, "sync cycle ended with error, slow sync requested");
                self.sink.engine_status(EngineStatus::Error);
                self.slow_sync = true;
                Err(e.clone())
            }
            None => {
                info!("sync cycle ended successfully");
                self.sink.engine_status(EngineStatus::Success);
                self.slow_sync = false;
                Ok(())
            }
        };
        if let Err(e) = self.store.mark_clean(true) {
            warn!(error = %e, "failed to mark store clean");
        }
        self.reset();
        self.cycle_active = false;
        if !self.info_signaled {
            self.info_signaled = true;
            self.info_gate.signal(outcome.clone());
        }
        self.sync_gate.signal(outcome);
        if self.pending_resync {
            self.pending_resync = false;
            self.start_cycle(true);
        }
    }

    /// Returns every top-level flag to its documented default. Safe to
    /// call any number of times.
    fn reset(&mut self) {
        self.flags.unset(self.eng.running);
        self.flags.unset(self.eng.stop);
        self.flags.unset(self.eng.want_data);
        for idx in 0..self.clients.len() {
            let cl = self.clients[idx].fl;
            self.flags.unset(cl.connected);
            self.flags.unset(cl.sent_changes);
            self.flags.unset(cl.done);
            self.flags.unset(cl.finished);
            // Members benched by the partial-failure policy rejoin.
            if !self.flags.has_parent(cl.connected) {
                self.flags.attach(cl.connected, self.eng.all_connected);
            }
            if !self.flags.has_parent(cl.sent_changes) {
                self.flags.attach(cl.sent_changes, self.eng.all_sent_changes);
            }
        }
    }

    fn apply_store_ops(&mut self, ops: Vec<StoreOp>) {
        for op in ops {
            let result = match &op {
                StoreOp::Save(link) => self.store.save(link),
                StoreOp::Delete { uid, member } => self.store.delete(uid, *member),
            };
            if let Err(e) = result {
                warn!(error = %e, "mapping store operation failed");
            }
        }
    }
}
