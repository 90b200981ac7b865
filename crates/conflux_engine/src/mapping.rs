//! The correlation data structure: mappings, entries, and per-member views.
//!
//! A [`Mapping`] groups the entries (at most one per member) believed to
//! denote the same logical record. The table is the sole owner of both
//! mappings and entries; everything else refers to them by id. Entry and
//! mapping lifecycle flags live in the engine's [`FlagArena`] so that
//! combinator aggregation (`all_entries_mapped`, `all_synced`) falls out of
//! flag attachment.

use crate::compare::ChangeFormat;
use crate::flag::{FlagArena, FlagId};
use crate::msg::Wake;
use crate::store::MappingLink;
use conflux_protocol::{Change, ChangeKind, Cmp, MemberId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Index of one entry within the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Index of one mapping within the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingId(u64);

impl MappingId {
    /// The raw correlation group id used in persisted links.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapping-{}", self.0)
    }
}

/// A persistence side effect the caller must forward to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreOp {
    /// Save (or overwrite) a link.
    Save(MappingLink),
    /// Delete the link for `(uid, member)`.
    Delete {
        /// Record uid.
        uid: String,
        /// Owning member.
        member: MemberId,
    },
}

/// One member's version of a record within a mapping.
#[derive(Debug)]
pub(crate) struct MappingEntry {
    pub(crate) member: MemberId,
    pub(crate) change: Change,
    pub(crate) mapping: Option<MappingId>,
    pub(crate) fl_has_data: FlagId,
    pub(crate) fl_dirty: FlagId,
    pub(crate) fl_mapped: FlagId,
    pub(crate) fl_has_info: FlagId,
    pub(crate) fl_synced: FlagId,
    pub(crate) fl_deleted: FlagId,
}

/// The set of per-member entries denoting one logical record.
#[derive(Debug)]
pub(crate) struct Mapping {
    /// Entries ordered by member registration order.
    pub(crate) entries: Vec<EntryId>,
    pub(crate) master: Option<EntryId>,
    pub(crate) multiplied: bool,
    pub(crate) fl_solved: FlagId,
    pub(crate) fl_checked: FlagId,
    pub(crate) cmb_synced: FlagId,
    pub(crate) cmb_has_data: FlagId,
    pub(crate) cmb_has_info: FlagId,
    pub(crate) cmb_deleted: FlagId,
    /// Persisted correlation group id.
    pub(crate) pin: u64,
}

/// Outcome of a conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckOutcome {
    /// The entries agree; a master was chosen.
    Solved {
        /// The chosen master entry.
        master: EntryId,
    },
    /// Two entries disagree; resolution is up to the host.
    Conflict,
}

/// Outcome of a history split.
#[derive(Debug, Default)]
pub(crate) struct SplitOutcome {
    /// Mappings created by the split, each solved with a master.
    pub(crate) new_mappings: Vec<MappingId>,
    /// Entries whose identity could not be elevated; left in place.
    pub(crate) aborted: Vec<EntryId>,
    /// Persistence side effects.
    pub(crate) store_ops: Vec<StoreOp>,
}

/// Engine-level combinators the table attaches per-item flags to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TableFlags {
    /// AND over every entry's mapped flag.
    pub(crate) all_entries_mapped: FlagId,
    /// AND over every mapping's synced combinator.
    pub(crate) all_synced: FlagId,
}

/// Owns all mappings, all entries, and one uid view per member.
#[derive(Debug)]
pub(crate) struct MappingTable {
    entries: HashMap<EntryId, MappingEntry>,
    mappings: BTreeMap<MappingId, Mapping>,
    views: HashMap<MemberId, HashMap<String, EntryId>>,
    members: Vec<MemberId>,
    pins: HashMap<(MemberId, String), u64>,
    table_flags: TableFlags,
    next_entry: u64,
    next_mapping: u64,
}

impl MappingTable {
    pub(crate) fn new(members: Vec<MemberId>, table_flags: TableFlags) -> Self {
        let views = members.iter().map(|m| (*m, HashMap::new())).collect();
        Self {
            entries: HashMap::new(),
            mappings: BTreeMap::new(),
            views,
            members,
            pins: HashMap::new(),
            table_flags,
            next_entry: 0,
            next_mapping: 0,
        }
    }

    /// Seeds correlation pins from persisted links.
    pub(crate) fn seed_links(&mut self, links: &[MappingLink]) {
        for link in links {
            self.pins
                .insert((link.member, link.uid.clone()), link.mapping);
            self.next_mapping = self.next_mapping.max(link.mapping + 1);
        }
    }

    pub(crate) fn entry(&self, id: EntryId) -> &MappingEntry {
        &self.entries[&id]
    }

    pub(crate) fn mapping(&self, id: MappingId) -> &Mapping {
        &self.mappings[&id]
    }

    pub(crate) fn contains_mapping(&self, id: MappingId) -> bool {
        self.mappings.contains_key(&id)
    }

    pub(crate) fn contains_entry(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn entry_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn mapping_ids(&self) -> Vec<MappingId> {
        self.mappings.keys().copied().collect()
    }

    pub(crate) fn find_entry(&self, member: MemberId, uid: &str) -> Option<EntryId> {
        self.views.get(&member)?.get(uid).copied()
    }

    fn member_order(&self, member: MemberId) -> usize {
        self.members
            .iter()
            .position(|m| *m == member)
            .unwrap_or(usize::MAX)
    }

    fn alloc_entry(
        &mut self,
        flags: &mut FlagArena<Wake>,
        member: MemberId,
        change: Change,
    ) -> EntryId {
        let id = EntryId(self.next_entry);
        self.next_entry += 1;
        let wake = Some(Wake::Entry(id));
        let entry = MappingEntry {
            member,
            fl_has_data: flags.alloc(false, wake),
            fl_dirty: flags.alloc(false, wake),
            fl_mapped: flags.alloc(false, wake),
            fl_has_info: flags.alloc(false, wake),
            fl_synced: flags.alloc(false, wake),
            fl_deleted: flags.alloc(false, wake),
            mapping: None,
            change,
        };
        flags.attach(entry.fl_mapped, self.table_flags.all_entries_mapped);
        self.views
            .get_mut(&member)
            .expect("unknown member")
            .insert(entry.change.uid.clone(), id);
        self.entries.insert(id, entry);
        id
    }

    /// Stores a reported change: updates the member's existing entry for
    /// the uid in place, or creates a new unmapped entry.
    pub(crate) fn store_change(
        &mut self,
        flags: &mut FlagArena<Wake>,
        member: MemberId,
        change: Change,
    ) -> EntryId {
        if let Some(id) = self.find_entry(member, &change.uid) {
            let has_data = change.has_data();
            let deletion = change.is_deletion();
            let mapping = {
                let entry = self.entries.get_mut(&id).expect("view out of sync");
                entry.change = change;
                entry.mapping
            };
            let entry = &self.entries[&id];
            flags.set(entry.fl_has_info);
            if has_data {
                flags.set(entry.fl_has_data);
            } else {
                flags.unset(entry.fl_has_data);
            }
            if deletion {
                flags.set(entry.fl_deleted);
            } else {
                flags.unset(entry.fl_deleted);
            }
            flags.unset(entry.fl_synced);
            // The record moved again; its mapping needs a fresh check.
            if let Some(mid) = mapping {
                let m = self.mappings.get_mut(&mid).expect("dangling mapping id");
                m.multiplied = false;
                let (solved, checked) = (m.fl_solved, m.fl_checked);
                flags.unset(solved);
                flags.unset(checked);
            }
            id
        } else {
            let id = self.alloc_entry(flags, member, change);
            let entry = &self.entries[&id];
            flags.set(entry.fl_has_info);
            if entry.change.has_data() {
                flags.set(entry.fl_has_data);
            }
            if entry.change.is_deletion() {
                flags.set(entry.fl_deleted);
            }
            id
        }
    }

    /// Fills in content fetched for an entry.
    pub(crate) fn set_entry_data(&mut self, flags: &mut FlagArena<Wake>, id: EntryId, data: Change) {
        let fl_has_data = {
            let entry = self.entries.get_mut(&id).expect("dangling entry");
            entry.change.payload = data.payload;
            if entry.change.objtype.is_none() {
                entry.change.objtype = data.objtype;
            }
            if entry.change.format.is_none() {
                entry.change.format = data.format;
            }
            entry.fl_has_data
        };
        flags.set(fl_has_data);
    }

    fn alloc_mapping(&mut self, flags: &mut FlagArena<Wake>, pin: u64) -> MappingId {
        let id = MappingId(self.next_mapping);
        self.next_mapping += 1;
        let wake = Some(Wake::Mapping(id));
        let mapping = Mapping {
            entries: Vec::new(),
            master: None,
            multiplied: false,
            fl_solved: flags.alloc(false, wake),
            fl_checked: flags.alloc(false, None),
            cmb_synced: flags.alloc_all(true, wake),
            cmb_has_data: flags.alloc_all(false, wake),
            cmb_has_info: flags.alloc_any(false, wake),
            cmb_deleted: flags.alloc_all(false, wake),
            pin,
        };
        flags.attach(mapping.cmb_synced, self.table_flags.all_synced);
        self.mappings.insert(id, mapping);
        id
    }

    fn attach_entry(&mut self, flags: &mut FlagArena<Wake>, mapping_id: MappingId, id: EntryId) {
        let order = {
            let entry = &self.entries[&id];
            self.member_order(entry.member)
        };
        let pos = {
            let mapping = &self.mappings[&mapping_id];
            mapping
                .entries
                .iter()
                .position(|&other| self.member_order_of(other) > order)
                .unwrap_or(mapping.entries.len())
        };
        let mapping = self.mappings.get_mut(&mapping_id).expect("dangling mapping");
        mapping.entries.insert(pos, id);
        let (cs, cd, ci, cx) = (
            mapping.cmb_synced,
            mapping.cmb_has_data,
            mapping.cmb_has_info,
            mapping.cmb_deleted,
        );
        let entry = self.entries.get_mut(&id).expect("dangling entry");
        entry.mapping = Some(mapping_id);
        let (fs, fd, fi, fx, fm) = (
            entry.fl_synced,
            entry.fl_has_data,
            entry.fl_has_info,
            entry.fl_deleted,
            entry.fl_mapped,
        );
        flags.attach(fs, cs);
        flags.attach(fd, cd);
        flags.attach(fi, ci);
        flags.attach(fx, cx);
        flags.set(fm);
    }

    fn member_order_of(&self, entry: EntryId) -> usize {
        self.member_order(self.entries[&entry].member)
    }

    fn detach_entry(&mut self, flags: &mut FlagArena<Wake>, id: EntryId) {
        let Some(mapping_id) = self.entries[&id].mapping else {
            return;
        };
        if let Some(mapping) = self.mappings.get_mut(&mapping_id) {
            mapping.entries.retain(|&e| e != id);
        }
        let entry = self.entries.get_mut(&id).expect("dangling entry");
        entry.mapping = None;
        let (fs, fd, fi, fx) = (
            entry.fl_synced,
            entry.fl_has_data,
            entry.fl_has_info,
            entry.fl_deleted,
        );
        flags.detach(fs);
        flags.detach(fd);
        flags.detach(fi);
        flags.detach(fx);
    }

    fn link_for(&self, id: EntryId) -> MappingLink {
        let entry = &self.entries[&id];
        let pin = entry
            .mapping
            .map(|m| self.mappings[&m].pin)
            .unwrap_or_default();
        MappingLink {
            uid: entry.change.uid.clone(),
            member: entry.member,
            mapping: pin,
            objtype: entry.change.objtype.clone(),
            format: entry.change.format.clone(),
        }
    }

    /// Finds a compatible mapping for the entry or creates a new one, then
    /// maps the entry into it.
    pub(crate) fn map_entry(
        &mut self,
        flags: &mut FlagArena<Wake>,
        format: &dyn ChangeFormat,
        id: EntryId,
    ) -> (MappingId, Vec<StoreOp>) {
        let (member, uid, change) = {
            let e = &self.entries[&id];
            (e.member, e.change.uid.clone(), e.change.clone())
        };
        let pinned = self.pins.get(&(member, uid.clone())).copied();

        let mut target = None;
        for (mid, mapping) in &self.mappings {
            let has_member = mapping
                .entries
                .iter()
                .any(|&e| self.entries[&e].member == member);
            if has_member {
                continue;
            }
            // A persisted pin decides correlation outright.
            if let Some(pin) = pinned {
                if mapping.pin == pin {
                    target = Some(*mid);
                    break;
                }
                continue;
            }
            let compatible = mapping
                .entries
                .iter()
                .all(|&e| format.compare(&self.entries[&e].change, &change).correlates());
            if compatible {
                target = Some(*mid);
                break;
            }
        }

        let mapping_id = match target {
            Some(mid) => mid,
            None => {
                let pin = pinned.unwrap_or(self.next_mapping);
                self.alloc_mapping(flags, pin)
            }
        };
        let pin = self.mappings[&mapping_id].pin;
        self.pins.insert((member, uid), pin);
        self.attach_entry(flags, mapping_id, id);
        let ops = vec![StoreOp::Save(self.link_for(id))];
        (mapping_id, ops)
    }

    fn agree(&self, format: &dyn ChangeFormat, a: EntryId, b: EntryId) -> bool {
        let (ca, cb) = (&self.entries[&a].change, &self.entries[&b].change);
        match (ca.is_deletion(), cb.is_deletion()) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => format.compare(ca, cb) == Cmp::Same,
        }
    }

    /// Pairwise-compares the mapping's changed entries; the first
    /// disagreeing pair in member registration order is a conflict.
    /// Agreement picks a master and marks the mapping solved.
    ///
    /// Unmodified and unclassified entries never raise a conflict; a
    /// member that changed nothing has no claim against one that did.
    pub(crate) fn check_conflict(
        &mut self,
        flags: &mut FlagArena<Wake>,
        format: &dyn ChangeFormat,
        mapping_id: MappingId,
    ) -> CheckOutcome {
        let (checked, entry_list) = {
            let m = &self.mappings[&mapping_id];
            (m.fl_checked, m.entries.clone())
        };
        flags.set(checked);

        let changed: Vec<EntryId> = entry_list
            .iter()
            .copied()
            .filter(|&e| self.entries[&e].change.kind.is_change())
            .collect();
        for i in 0..changed.len() {
            for j in (i + 1)..changed.len() {
                if !self.agree(format, changed[i], changed[j]) {
                    return CheckOutcome::Conflict;
                }
            }
        }

        // Changed entries outrank unchanged ones when picking the master.
        let master = changed
            .iter()
            .copied()
            .find(|&e| self.entries[&e].change.has_data())
            .or_else(|| {
                entry_list
                    .iter()
                    .copied()
                    .find(|&e| self.entries[&e].change.has_data())
            })
            .or_else(|| entry_list.first().copied())
            .expect("conflict check on empty mapping");
        self.set_master(flags, mapping_id, master);
        CheckOutcome::Solved { master }
    }

    /// Resolves a conflict by naming a winner.
    pub(crate) fn set_master(
        &mut self,
        flags: &mut FlagArena<Wake>,
        mapping_id: MappingId,
        winner: EntryId,
    ) {
        debug_assert_eq!(self.entries[&winner].mapping, Some(mapping_id));
        let m = self.mappings.get_mut(&mapping_id).expect("dangling mapping");
        m.master = Some(winner);
        let solved = m.fl_solved;
        flags.set(solved);
    }

    /// Propagates the master's value to every member: members whose entry
    /// already agrees are marked synced; disagreeing entries are rewritten
    /// and marked dirty; members without an entry get a fresh dirty one.
    pub(crate) fn multiply_master(
        &mut self,
        flags: &mut FlagArena<Wake>,
        format: &dyn ChangeFormat,
        mapping_id: MappingId,
    ) -> (Vec<EntryId>, Vec<StoreOp>) {
        let (master, already) = {
            let m = &self.mappings[&mapping_id];
            if m.multiplied {
                return (Vec::new(), Vec::new());
            }
            (m.master.expect("multiply without master"), m.entries.clone())
        };
        let master_change = self.entries[&master].change.clone();
        let members: Vec<MemberId> = self.members.clone();

        let mut dirtied = Vec::new();
        let mut ops = Vec::new();
        for member in members {
            let existing = already
                .iter()
                .copied()
                .find(|&e| self.entries[&e].member == member);
            match existing {
                Some(e) if e == master || self.agree(format, e, master) => {
                    // A history split leaves its moved master dirty; that
                    // commit must still happen, so only clean entries are
                    // marked synced here.
                    let entry = &self.entries[&e];
                    if !flags.raw_value(entry.fl_dirty) {
                        flags.set(entry.fl_synced);
                    }
                }
                Some(e) => {
                    let entry = self.entries.get_mut(&e).expect("dangling entry");
                    let was_deleted = entry.change.is_deletion();
                    entry.change.kind = if master_change.is_deletion() {
                        ChangeKind::Deleted
                    } else if was_deleted {
                        ChangeKind::Added
                    } else {
                        ChangeKind::Modified
                    };
                    entry.change.payload = master_change.payload.clone();
                    entry.change.objtype = master_change.objtype.clone();
                    entry.change.format = master_change.format.clone();
                    let (fd, fh, fi, fs, fx) = (
                        entry.fl_dirty,
                        entry.fl_has_data,
                        entry.fl_has_info,
                        entry.fl_synced,
                        entry.fl_deleted,
                    );
                    flags.set(fd);
                    flags.set(fh);
                    flags.set(fi);
                    flags.unset(fs);
                    if master_change.is_deletion() {
                        flags.set(fx);
                    } else {
                        flags.unset(fx);
                    }
                    dirtied.push(e);
                }
                None => {
                    if master_change.is_deletion() {
                        continue;
                    }
                    let mut change = master_change.clone();
                    change.kind = ChangeKind::Added;
                    let e = self.alloc_entry(flags, member, change);
                    {
                        let entry = &self.entries[&e];
                        let (fd, fh, fi) = (entry.fl_dirty, entry.fl_has_data, entry.fl_has_info);
                        flags.set(fd);
                        flags.set(fh);
                        flags.set(fi);
                    }
                    self.attach_entry(flags, mapping_id, e);
                    let pin = self.mappings[&mapping_id].pin;
                    let uid = self.entries[&e].change.uid.clone();
                    self.pins.insert((member, uid), pin);
                    ops.push(StoreOp::Save(self.link_for(e)));
                    dirtied.push(e);
                }
            }
        }
        self.mappings.get_mut(&mapping_id).expect("dangling mapping").multiplied = true;
        (dirtied, ops)
    }

    /// Clears per-entry cycle state once the mapping is synced, keeping the
    /// correlation for the next cycle.
    pub(crate) fn reset_mapping(&mut self, flags: &mut FlagArena<Wake>, mapping_id: MappingId) {
        let (entry_list, solved, checked) = {
            let m = self.mappings.get_mut(&mapping_id).expect("dangling mapping");
            m.master = None;
            m.multiplied = false;
            (m.entries.clone(), m.fl_solved, m.fl_checked)
        };
        for id in entry_list {
            let entry = self.entries.get_mut(&id).expect("dangling entry");
            if !entry.change.is_deletion() {
                entry.change.kind = ChangeKind::Unmodified;
            }
            let (fd, fi, fs, fx) = (
                entry.fl_dirty,
                entry.fl_has_info,
                entry.fl_synced,
                entry.fl_deleted,
            );
            flags.unset(fd);
            flags.unset(fi);
            flags.unset(fx);
            flags.set(fs);
        }
        flags.unset(solved);
        flags.unset(checked);
    }

    /// Tears a mapping down, freeing every entry and its flags.
    pub(crate) fn delete_mapping(
        &mut self,
        flags: &mut FlagArena<Wake>,
        mapping_id: MappingId,
    ) -> Vec<StoreOp> {
        let entry_list = self.mappings[&mapping_id].entries.clone();
        let mut ops = Vec::new();
        for id in entry_list {
            self.detach_entry(flags, id);
            let entry = self.entries.remove(&id).expect("dangling entry");
            if let Some(view) = self.views.get_mut(&entry.member) {
                view.remove(&entry.change.uid);
            }
            self.pins.remove(&(entry.member, entry.change.uid.clone()));
            ops.push(StoreOp::Delete {
                uid: entry.change.uid,
                member: entry.member,
            });
            flags.free(entry.fl_has_data);
            flags.free(entry.fl_dirty);
            flags.free(entry.fl_mapped);
            flags.free(entry.fl_has_info);
            flags.free(entry.fl_synced);
            flags.free(entry.fl_deleted);
        }
        let mapping = self.mappings.remove(&mapping_id).expect("dangling mapping");
        flags.free(mapping.fl_solved);
        flags.free(mapping.fl_checked);
        flags.free(mapping.cmb_synced);
        flags.free(mapping.cmb_has_data);
        flags.free(mapping.cmb_has_info);
        flags.free(mapping.cmb_deleted);
        ops
    }

    /// Gives an entry up for this cycle after its member dropped out.
    ///
    /// An unmapped entry is removed outright so it cannot block the
    /// mapped-combinator; a mapped entry is marked clean so its mapping
    /// can still settle.
    pub(crate) fn discard_entry(&mut self, flags: &mut FlagArena<Wake>, id: EntryId) {
        if self.entries[&id].mapping.is_some() {
            let entry = &self.entries[&id];
            let (fd, fs) = (entry.fl_dirty, entry.fl_synced);
            flags.unset(fd);
            flags.set(fs);
            return;
        }
        let entry = self.entries.remove(&id).expect("dangling entry");
        if let Some(view) = self.views.get_mut(&entry.member) {
            view.remove(&entry.change.uid);
        }
        flags.free(entry.fl_has_data);
        flags.free(entry.fl_dirty);
        flags.free(entry.fl_mapped);
        flags.free(entry.fl_has_info);
        flags.free(entry.fl_synced);
        flags.free(entry.fl_deleted);
    }

    fn uid_in_use(&self, uid: &str) -> bool {
        self.views.values().any(|v| v.contains_key(uid))
    }

    fn rekey_entry(&mut self, id: EntryId, new_uid: &str) {
        let entry = self.entries.get_mut(&id).expect("dangling entry");
        let member = entry.member;
        let old_uid = std::mem::replace(&mut entry.change.uid, new_uid.to_string());
        let view = self.views.get_mut(&member).expect("unknown member");
        view.remove(&old_uid);
        view.insert(new_uid.to_string(), id);
        self.pins.remove(&(member, old_uid));
    }

    /// Splits a mapping whose members diverged irreconcilably.
    ///
    /// Repeatedly picks the next entry disagreeing with the master,
    /// elevates its identity until it is unique across all members, and
    /// moves it plus every entry equal to it into a brand-new solved
    /// mapping whose master is marked added and dirty. Entries whose
    /// identity cannot be elevated abort individually and stay put.
    pub(crate) fn duplicate(
        &mut self,
        flags: &mut FlagArena<Wake>,
        format: &dyn ChangeFormat,
        mapping_id: MappingId,
        max_elevation: u32,
    ) -> SplitOutcome {
        let mut out = SplitOutcome::default();

        // A split needs a reference master; default to the first entry
        // with content.
        if self.mappings[&mapping_id].master.is_none() {
            let first = self.mappings[&mapping_id]
                .entries
                .iter()
                .copied()
                .find(|&e| {
                    let c = &self.entries[&e].change;
                    c.kind.is_known() && c.has_data()
                })
                .or_else(|| self.mappings[&mapping_id].entries.first().copied());
            if let Some(first) = first {
                self.set_master(flags, mapping_id, first);
            } else {
                return out;
            }
        }
        let master = self.mappings[&mapping_id].master.expect("master just set");

        loop {
            let divergent = self.mappings[&mapping_id]
                .entries
                .iter()
                .copied()
                .find(|&e| {
                    e != master
                        && !out.aborted.contains(&e)
                        && self.entries[&e].change.kind.is_known()
                        && !self.agree(format, e, master)
                });
            let Some(picked) = divergent else {
                break;
            };

            // Elevate the divergent record's identity until it is unique
            // across every member.
            let mut candidate = self.entries[&picked].change.clone();
            let member = self.entries[&picked].member;
            let mut unique = false;
            for _ in 0..max_elevation {
                if !format.elevate_identity(&mut candidate) {
                    break;
                }
                if !self.uid_in_use(&candidate.uid)
                    && self
                        .members
                        .iter()
                        .all(|&m| format.is_identity_unique(m, &candidate))
                {
                    unique = true;
                    break;
                }
            }
            if !unique {
                tracing::warn!(%picked, %member, "identity elevation failed, split aborted for item");
                out.aborted.push(picked);
                continue;
            }

            // Move the picked entry and everything equal to it into a new
            // mapping under the elevated uid.
            let movers: Vec<EntryId> = self.mappings[&mapping_id]
                .entries
                .iter()
                .copied()
                .filter(|&e| {
                    e == picked
                        || (e != master
                            && !out.aborted.contains(&e)
                            && self.entries[&e].change.kind.is_known()
                            && self.agree(format, e, picked))
                })
                .collect();

            let new_id = {
                let pin = self.next_mapping;
                self.alloc_mapping(flags, pin)
            };
            for mover in movers {
                out.store_ops.push(StoreOp::Delete {
                    uid: self.entries[&mover].change.uid.clone(),
                    member: self.entries[&mover].member,
                });
                self.detach_entry(flags, mover);
                self.rekey_entry(mover, &candidate.uid);
                {
                    let entry = self.entries.get_mut(&mover).expect("dangling entry");
                    entry.change.kind = ChangeKind::Added;
                    let (fd, fh, fi, fs, fx) = (
                        entry.fl_dirty,
                        entry.fl_has_data,
                        entry.fl_has_info,
                        entry.fl_synced,
                        entry.fl_deleted,
                    );
                    flags.set(fd);
                    flags.set(fh);
                    flags.set(fi);
                    flags.unset(fs);
                    flags.unset(fx);
                }
                self.attach_entry(flags, new_id, mover);
                let pin = self.mappings[&new_id].pin;
                let m = self.entries[&mover].member;
                self.pins.insert((m, candidate.uid.clone()), pin);
                out.store_ops.push(StoreOp::Save(self.link_for(mover)));
            }
            self.set_master(flags, new_id, picked);
            {
                let checked = self.mappings[&new_id].fl_checked;
                flags.set(checked);
            }
            out.new_mappings.push(new_id);
        }

        // The original mapping is now internally consistent.
        let checked = self.mappings[&mapping_id].fl_checked;
        flags.set(checked);
        let solved = self.mappings[&mapping_id].fl_solved;
        flags.set(solved);
        out
    }

    /// Builds the conflict snapshot reported to the host.
    pub(crate) fn conflict_entries(&self, mapping_id: MappingId) -> Vec<(EntryId, MemberId, Change)> {
        self.mappings[&mapping_id]
            .entries
            .iter()
            .map(|&e| {
                let entry = &self.entries[&e];
                (e, entry.member, entry.change.clone())
            })
            .collect()
    }
}
