//! Persistence contract for mapping links.
//!
//! The engine persists one link per mapping entry, keyed by
//! `(uid, member)`; links are only used to regroup entries reported in
//! later runs. The store itself is an external collaborator behind this
//! narrow load/save/delete contract.

use crate::error::EngineResult;
use conflux_protocol::MemberId;
use std::collections::HashMap;

/// One persisted mapping link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingLink {
    /// Record uid within the member's uid space.
    pub uid: String,
    /// The owning member.
    pub member: MemberId,
    /// Correlation group id; entries sharing it belong to one mapping.
    pub mapping: u64,
    /// Object type, if known.
    pub objtype: Option<String>,
    /// Payload format, if known.
    pub format: Option<String>,
}

/// Everything a store hands back at load time.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// The persisted links.
    pub links: Vec<MappingLink>,
    /// False if the previous run did not shut down cleanly; the engine
    /// then requests a slow sync.
    pub clean: bool,
}

/// Load/save/delete contract for mapping links.
pub trait MappingStore: Send {
    /// Loads the persisted links and the clean-shutdown marker.
    fn load(&mut self) -> EngineResult<StoreSnapshot>;

    /// Saves (or overwrites) one link.
    fn save(&mut self, link: &MappingLink) -> EngineResult<()>;

    /// Deletes the link for `(uid, member)`, if present.
    fn delete(&mut self, uid: &str, member: MemberId) -> EngineResult<()>;

    /// Records whether the current run is shut down cleanly.
    fn mark_clean(&mut self, clean: bool) -> EngineResult<()>;
}

/// In-memory store, the default. State does not survive the process.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    links: HashMap<(String, MemberId), MappingLink>,
    clean: bool,
}

impl MemoryMappingStore {
    /// Creates an empty store that reports a clean previous run.
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            clean: true,
        }
    }

    /// Number of stored links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns true if no links are stored.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl MappingStore for MemoryMappingStore {
    fn load(&mut self) -> EngineResult<StoreSnapshot> {
        Ok(StoreSnapshot {
            links: self.links.values().cloned().collect(),
            clean: self.clean,
        })
    }

    fn save(&mut self, link: &MappingLink) -> EngineResult<()> {
        self.links
            .insert((link.uid.clone(), link.member), link.clone());
        Ok(())
    }

    fn delete(&mut self, uid: &str, member: MemberId) -> EngineResult<()> {
        self.links.remove(&(uid.to_string(), member));
        Ok(())
    }

    fn mark_clean(&mut self, clean: bool) -> EngineResult<()> {
        self.clean = clean;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(uid: &str, member: u32, mapping: u64) -> MappingLink {
        MappingLink {
            uid: uid.into(),
            member: MemberId(member),
            mapping,
            objtype: None,
            format: None,
        }
    }

    #[test]
    fn save_load_delete() {
        let mut store = MemoryMappingStore::new();
        store.save(&link("u1", 0, 1)).unwrap();
        store.save(&link("u1", 1, 1)).unwrap();
        store.save(&link("u2", 0, 2)).unwrap();
        assert_eq!(store.len(), 3);

        store.delete("u1", MemberId(0)).unwrap();
        let snap = store.load().unwrap();
        assert_eq!(snap.links.len(), 2);
        assert!(snap.clean);
    }

    #[test]
    fn clean_marker() {
        let mut store = MemoryMappingStore::new();
        store.mark_clean(false).unwrap();
        assert!(!store.load().unwrap().clean);
        store.mark_clean(true).unwrap();
        assert!(store.load().unwrap().clean);
    }

    #[test]
    fn save_overwrites_same_key() {
        let mut store = MemoryMappingStore::new();
        store.save(&link("u1", 0, 1)).unwrap();
        store.save(&link("u1", 0, 7)).unwrap();
        let snap = store.load().unwrap();
        assert_eq!(snap.links.len(), 1);
        assert_eq!(snap.links[0].mapping, 7);
    }
}
