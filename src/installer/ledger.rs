//! File modification ledger
//!
//! Per-destination record of what a session does to a file and which mods
//! are responsible. Entries are staged while the session plans, committed
//! once the file's writes are applied and verified, and discarded on
//! rollback. Only the orchestrator mutates the ledger.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::manifest::ModId;
use crate::paths;

bitflags::bitflags! {
    /// Kinds of change applied to one destination
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChangeKinds: u8 {
        const MOVED = 0b0000_0001;
        const DELETED = 0b0000_0010;
        const EDITED = 0b0000_0100;
        const REPLACED = 0b0000_1000;
        const ADDED = 0b0001_0000;
    }
}

impl ChangeKinds {
    /// Flag names, for display
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Ledger entry for one destination path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    pub destination: String,
    pub kinds: ChangeKinds,
    /// Contributing mods in first-touch order
    pub mods: Vec<ModId>,
    pub reserved: bool,
}

impl FileModification {
    fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            kinds: ChangeKinds::empty(),
            mods: Vec::new(),
            reserved: false,
        }
    }

    fn add_mod(&mut self, mod_id: &ModId) {
        if !self.mods.contains(mod_id) {
            self.mods.push(mod_id.clone());
        }
    }
}

/// Session ledger of file modifications
#[derive(Debug, Default)]
pub struct FileModificationLedger {
    /// Destinations the configuration marks reserved (normalized)
    reserved_paths: Vec<String>,
    staged: BTreeMap<String, FileModification>,
    committed: BTreeMap<String, FileModification>,
}

impl FileModificationLedger {
    pub fn new(reserved_files: &[String]) -> Self {
        Self {
            reserved_paths: reserved_files
                .iter()
                .map(|p| paths::normalize_for_lookup(p))
                .collect(),
            ..Self::default()
        }
    }

    /// Record that `mod_id` touches `destination`, creating the entry on first touch
    pub fn touch(&mut self, destination: &str, mod_id: &ModId, reserved: bool) {
        let key = paths::normalize_for_lookup(destination);
        let entry = self
            .staged
            .entry(key)
            .or_insert_with(|| FileModification::new(destination));
        entry.reserved |= reserved;
        entry.add_mod(mod_id);
    }

    /// Union change kinds into a staged entry
    pub fn record(&mut self, destination: &str, kinds: ChangeKinds, mods: &[ModId]) {
        let key = paths::normalize_for_lookup(destination);
        let entry = self
            .staged
            .entry(key)
            .or_insert_with(|| FileModification::new(destination));
        entry.kinds |= kinds;
        for mod_id in mods {
            entry.add_mod(mod_id);
        }
    }

    /// Whether a destination falls under the zero-tolerance collision policy
    pub fn is_reserved(&self, destination: &str) -> bool {
        let key = paths::normalize_for_lookup(destination);
        self.reserved_paths.contains(&key)
            || self
                .staged
                .get(&key)
                .or_else(|| self.committed.get(&key))
                .is_some_and(|e| e.reserved)
    }

    pub fn staged(&self, destination: &str) -> Option<&FileModification> {
        self.staged.get(&paths::normalize_for_lookup(destination))
    }

    /// Move a staged entry to the committed set
    pub fn commit(&mut self, destination: &str) -> bool {
        let key = paths::normalize_for_lookup(destination);
        match self.staged.remove(&key) {
            Some(entry) => {
                match self.committed.get_mut(&key) {
                    Some(existing) => {
                        existing.kinds |= entry.kinds;
                        existing.reserved |= entry.reserved;
                        for mod_id in &entry.mods {
                            existing.add_mod(mod_id);
                        }
                    }
                    None => {
                        self.committed.insert(key, entry);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Drop every staged entry; returns how many were discarded
    pub fn discard_staged(&mut self) -> usize {
        let count = self.staged.len();
        self.staged.clear();
        count
    }

    /// Committed entries in destination order
    pub fn committed(&self) -> Vec<FileModification> {
        self.committed.values().cloned().collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.committed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kinds_union_and_names() {
        let kinds = ChangeKinds::EDITED | ChangeKinds::ADDED;
        assert!(kinds.contains(ChangeKinds::EDITED));
        assert!(!kinds.contains(ChangeKinds::DELETED));
        assert_eq!(kinds.names(), vec!["EDITED", "ADDED"]);
    }

    #[test]
    fn test_change_kinds_serialize_as_names() {
        let json = serde_json::to_string(&(ChangeKinds::MOVED | ChangeKinds::ADDED)).unwrap();
        assert_eq!(json, "\"MOVED | ADDED\"");
        let back: ChangeKinds = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChangeKinds::MOVED | ChangeKinds::ADDED);
    }

    #[test]
    fn test_touch_record_commit() {
        let mut ledger = FileModificationLedger::new(&[]);
        let a = ModId::new("a");
        let b = ModId::new("b");

        ledger.touch("Data\\x.bin", &a, false);
        ledger.touch("data/X.bin", &b, true);
        ledger.record("data/x.bin", ChangeKinds::EDITED, &[a.clone()]);
        ledger.record("data/x.bin", ChangeKinds::REPLACED, &[b.clone()]);

        let staged = ledger.staged("DATA/X.BIN").unwrap();
        assert_eq!(staged.kinds, ChangeKinds::EDITED | ChangeKinds::REPLACED);
        assert_eq!(staged.mods, vec![a, b]);
        assert!(ledger.is_reserved("data/x.bin"));

        assert!(ledger.commit("data/x.bin"));
        assert!(ledger.staged("data/x.bin").is_none());
        assert_eq!(ledger.committed().len(), 1);
        assert_eq!(ledger.committed()[0].destination, "Data\\x.bin");
    }

    #[test]
    fn test_discard_never_commits() {
        let mut ledger = FileModificationLedger::new(&["Core.pak".to_string()]);
        ledger.touch("a.txt", &ModId::new("a"), false);
        assert!(ledger.is_reserved("core.PAK"));
        assert!(ledger.is_reserved("./core.pak"));
        assert!(!ledger.is_reserved("a.txt"));

        assert_eq!(ledger.discard_staged(), 1);
        assert!(ledger.committed().is_empty());
        assert_eq!(ledger.to_json().unwrap(), "[]");
    }
}
