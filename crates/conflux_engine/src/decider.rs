//! Pure decision rules over flag state.
//!
//! A decider inspects flag predicates and returns at most one action; it
//! never mutates anything. Invoking one spuriously, or twice without an
//! intervening state change, is a waste cycle and must stay safe — the
//! engine marks the gating flag as changing before acting, which is what
//! makes the second call return `None`.

use crate::flag::{FlagArena, FlagId};
use crate::mapping::{Mapping, MappingEntry};
use crate::msg::Wake;

/// The engine-level flags deciders consult.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineFlags {
    pub(crate) running: FlagId,
    pub(crate) want_data: FlagId,
    pub(crate) stop: FlagId,
    pub(crate) all_connected: FlagId,
    pub(crate) all_sent_changes: FlagId,
    pub(crate) all_entries_mapped: FlagId,
    pub(crate) all_synced: FlagId,
    pub(crate) all_finished: FlagId,
}

/// One client's lifecycle flags.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientFlags {
    pub(crate) connected: FlagId,
    pub(crate) sent_changes: FlagId,
    pub(crate) done: FlagId,
    pub(crate) finished: FlagId,
}

/// What the client decider wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientAction {
    Connect,
    GetChanges,
    SyncDone,
    Disconnect,
}

/// What the entry decider wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryAction {
    GetData,
    Map,
    Commit,
}

/// What the mapping decider wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingAction {
    CheckConflict,
    Reset,
    Delete,
}

/// Client lifecycle decider, branches in priority order.
pub(crate) fn decide_client(
    flags: &FlagArena<Wake>,
    eng: &EngineFlags,
    cl: &ClientFlags,
) -> Option<ClientAction> {
    let running = flags.is_set(eng.running);
    let stopping = flags.is_set(eng.stop);

    if running
        && !stopping
        && flags.is_unset(cl.done)
        && flags.is_unset(cl.connected)
        && flags.is_unset(cl.finished)
    {
        return Some(ClientAction::Connect);
    }
    if running
        && !stopping
        && flags.is_set(cl.connected)
        && flags.is_unset(cl.sent_changes)
        && flags.is_unset(cl.done)
        && flags.is_set(eng.all_connected)
    {
        return Some(ClientAction::GetChanges);
    }
    if running
        && !stopping
        && flags.is_set(cl.connected)
        && flags.is_set(cl.sent_changes)
        && flags.is_unset(cl.done)
        && flags.is_set(eng.all_sent_changes)
        && flags.is_set(eng.all_synced)
        && flags.is_set(eng.all_entries_mapped)
    {
        return Some(ClientAction::SyncDone);
    }
    if running && flags.is_set(cl.done) && flags.is_set(cl.connected) {
        return Some(ClientAction::Disconnect);
    }
    if running && stopping && flags.is_set(cl.connected) {
        return Some(ClientAction::Disconnect);
    }
    None
}

/// Entry decider: fetch content, map, or commit.
pub(crate) fn decide_entry(
    flags: &FlagArena<Wake>,
    eng: &EngineFlags,
    entry: &MappingEntry,
) -> Option<EntryAction> {
    if !flags.is_set(eng.running) || flags.is_set(eng.stop) {
        return None;
    }
    let want_data = flags.is_set(eng.want_data);

    if want_data && flags.is_set(entry.fl_has_info) && flags.is_unset(entry.fl_has_data) {
        return Some(EntryAction::GetData);
    }
    if flags.is_set(eng.all_sent_changes)
        && want_data
        && flags.is_set(entry.fl_has_info)
        && flags.is_set(entry.fl_has_data)
        && flags.is_unset(entry.fl_mapped)
    {
        return Some(EntryAction::Map);
    }
    if flags.is_set(eng.all_sent_changes)
        && want_data
        && flags.is_set(entry.fl_has_info)
        && flags.is_set(entry.fl_has_data)
        && flags.is_set(entry.fl_mapped)
        && flags.is_set(entry.fl_dirty)
    {
        return Some(EntryAction::Commit);
    }
    None
}

/// Mapping decider: conflict check, cycle reset, or teardown.
pub(crate) fn decide_mapping(
    flags: &FlagArena<Wake>,
    eng: &EngineFlags,
    mapping: &Mapping,
) -> Option<MappingAction> {
    if !flags.is_set(eng.running) || flags.is_set(eng.stop) {
        return None;
    }

    if flags.is_set(eng.all_sent_changes)
        && flags.is_set(eng.all_entries_mapped)
        && flags.is_set(mapping.cmb_has_data)
        && flags.is_unset(mapping.cmb_synced)
        && flags.is_unset(mapping.fl_solved)
        && flags.is_unset(mapping.fl_checked)
    {
        return Some(MappingAction::CheckConflict);
    }
    if flags.is_set(mapping.cmb_synced)
        && flags.is_set(mapping.cmb_has_info)
        && flags.is_unset(mapping.cmb_deleted)
    {
        return Some(MappingAction::Reset);
    }
    if flags.is_set(mapping.cmb_synced) && flags.is_set(mapping.cmb_deleted) {
        return Some(MappingAction::Delete);
    }
    None
}
