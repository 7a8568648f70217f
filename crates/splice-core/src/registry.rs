//! Ledger of every modification made to the target process.
//!
//! Each overwritten instruction range and each allocated cave is recorded
//! the moment it is made, keyed by the identifier of the hook that made
//! it. Undo walks the ledger in a safe order: original bytes go back
//! first, so no thread can be executing inside a cave when it is freed.

use tracing::{debug, warn};

use crate::error::Result;
use crate::memory::{TargetProcess, format_bytes};

/// A range of instruction bytes that was overwritten, with its original
/// contents.
#[derive(Debug, Clone)]
pub struct MemoryPatch {
    pub identifier: String,
    pub address: u64,
    pub original_bytes: Vec<u8>,
}

/// What an allocated cave holds.
///
/// Code caves belong to one trampoline installation and are released
/// when it is redone; slot caves hold pointers the injected code writes
/// and must outlive trampoline reinstalls under the same identifier,
/// since the cave body embeds their addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaveKind {
    Code,
    Slot,
}

/// An executable region allocated in the target for injected code or a
/// pointer slot.
#[derive(Debug, Clone)]
pub struct CodeCave {
    pub identifier: String,
    pub address: u64,
    pub size: usize,
    pub kind: CaveKind,
}

/// What an undo pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndoReport {
    /// Patches whose original bytes were written back.
    pub restored: usize,
    /// Caves released back to the target.
    pub freed: usize,
    /// Restore or free attempts that failed (logged individually).
    pub failed: usize,
}

impl UndoReport {
    pub fn merge(&mut self, other: UndoReport) {
        self.restored += other.restored;
        self.freed += other.freed;
        self.failed += other.failed;
    }
}

/// All patches and caves currently applied, in application order.
#[derive(Default)]
pub struct InjectionRegistry {
    patches: Vec<MemoryPatch>,
    caves: Vec<CodeCave>,
}

impl InjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_patch(&mut self, identifier: &str, address: u64, original_bytes: Vec<u8>) {
        debug!(
            "Recording patch '{identifier}' at {address:#x}: {}",
            format_bytes(&original_bytes)
        );
        self.patches.push(MemoryPatch {
            identifier: identifier.to_string(),
            address,
            original_bytes,
        });
    }

    pub fn record_cave(&mut self, identifier: &str, address: u64, size: usize) {
        debug!("Recording {size} byte cave '{identifier}' at {address:#x}");
        self.caves.push(CodeCave {
            identifier: identifier.to_string(),
            address,
            size,
            kind: CaveKind::Code,
        });
    }

    pub fn record_slot(&mut self, identifier: &str, address: u64, size: usize) {
        debug!("Recording {size} byte pointer slot '{identifier}' at {address:#x}");
        self.caves.push(CodeCave {
            identifier: identifier.to_string(),
            address,
            size,
            kind: CaveKind::Slot,
        });
    }

    /// Drop the most recently recorded patch if it belongs to `identifier`.
    ///
    /// Used to back out a record made just before a later step failed,
    /// without touching the target.
    pub fn forget_last_patch(&mut self, identifier: &str) {
        if self
            .patches
            .last()
            .is_some_and(|p| p.identifier == identifier)
        {
            self.patches.pop();
        }
    }

    pub fn has(&self, identifier: &str) -> bool {
        self.patches.iter().any(|p| p.identifier == identifier)
            || self.caves.iter().any(|c| c.identifier == identifier)
    }

    /// Identifiers with at least one live patch or cave, in first-applied
    /// order without duplicates.
    pub fn identifiers(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for id in self
            .patches
            .iter()
            .map(|p| p.identifier.as_str())
            .chain(self.caves.iter().map(|c| c.identifier.as_str()))
        {
            if !seen.iter().any(|s: &String| s == id) {
                seen.push(id.to_string());
            }
        }
        seen
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.caves.is_empty()
    }

    /// Undo everything recorded under one identifier.
    ///
    /// Original bytes are restored before any cave is freed, so the
    /// target never executes a jump into released memory. Entries are
    /// removed from the ledger whether or not the corresponding write
    /// succeeded; a process that has exited cannot be restored, and
    /// keeping the record would make every later undo re-fail.
    pub fn undo(&mut self, process: &dyn TargetProcess, identifier: &str) -> UndoReport {
        self.undo_filtered(process, identifier, None)
    }

    /// Undo only the trampoline part of an installation: restore patches
    /// and free code caves, but keep pointer slots. Used when a
    /// trampoline is redone under the same identifier while the new cave
    /// body already embeds this attempt's slot addresses.
    pub fn undo_trampoline(&mut self, process: &dyn TargetProcess, identifier: &str) -> UndoReport {
        self.undo_filtered(process, identifier, Some(CaveKind::Code))
    }

    fn undo_filtered(
        &mut self,
        process: &dyn TargetProcess,
        identifier: &str,
        kind: Option<CaveKind>,
    ) -> UndoReport {
        let mut report = UndoReport::default();

        let mut i = 0;
        while i < self.patches.len() {
            if self.patches[i].identifier != identifier {
                i += 1;
                continue;
            }
            let patch = self.patches.remove(i);
            match process.write_bytes(patch.address, &patch.original_bytes) {
                Ok(()) => {
                    debug!(
                        "Restored {} bytes at {:#x} for '{identifier}'",
                        patch.original_bytes.len(),
                        patch.address
                    );
                    report.restored += 1;
                }
                Err(e) => {
                    warn!("Failed to restore bytes at {:#x}: {e}", patch.address);
                    report.failed += 1;
                }
            }
        }

        let mut i = 0;
        while i < self.caves.len() {
            if self.caves[i].identifier != identifier
                || kind.is_some_and(|k| self.caves[i].kind != k)
            {
                i += 1;
                continue;
            }
            let cave = self.caves.remove(i);
            // Zero the cave before release so a stale pointer slot reads
            // as unpopulated rather than as garbage.
            let _ = process.write_bytes(cave.address, &vec![0u8; cave.size]);
            match process.free(cave.address, cave.size) {
                Ok(()) => {
                    debug!("Freed cave at {:#x} for '{identifier}'", cave.address);
                    report.freed += 1;
                }
                Err(e) => {
                    warn!("Failed to free cave at {:#x}: {e}", cave.address);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Undo everything, identifier by identifier.
    pub fn undo_all(&mut self, process: &dyn TargetProcess) -> UndoReport {
        let mut report = UndoReport::default();
        for id in self.identifiers() {
            report.merge(self.undo(process, &id));
        }
        report
    }

    /// Forget every record without touching the target. Used when the
    /// process is gone and there is nothing left to restore into.
    pub fn clear(&mut self) {
        self.patches.clear();
        self.caves.clear();
    }

    /// Verify that the bytes currently at each patched address are the
    /// engine's, i.e. the patches have not been overwritten by a game
    /// update or another tool. Returns the identifiers that no longer
    /// match.
    pub fn verify(
        &self,
        process: &dyn TargetProcess,
        expected: impl Fn(&MemoryPatch) -> Option<Vec<u8>>,
    ) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for patch in &self.patches {
            let Some(bytes) = expected(patch) else {
                continue;
            };
            let current = process.read_bytes(patch.address, bytes.len())?;
            if current != bytes && !stale.contains(&patch.identifier) {
                stale.push(patch.identifier.clone());
            }
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockProcess;

    #[test]
    fn undo_restores_original_bytes_before_freeing() {
        let process = MockProcess::builder().region(0x1000, vec![0xAA; 32]).build();
        let cave = process.allocate(16).unwrap();

        let mut registry = InjectionRegistry::new();
        registry.record_patch("hook", 0x1000, vec![0xAA; 4]);
        registry.record_cave("hook", cave, 16);
        process.write_bytes(0x1000, &[0x68, 0, 0, 0]).unwrap();

        let report = registry.undo(&process, "hook");
        assert_eq!(report.restored, 1);
        assert_eq!(report.freed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(process.read_bytes(0x1000, 4).unwrap(), vec![0xAA; 4]);
        assert_eq!(process.freed(), vec![cave]);
        assert!(registry.is_empty());
    }

    #[test]
    fn undo_unknown_identifier_is_a_noop() {
        let process = MockProcess::builder().region(0x1000, vec![0; 16]).build();
        let mut registry = InjectionRegistry::new();
        let report = registry.undo(&process, "nothing-here");
        assert_eq!(report, UndoReport::default());
    }

    #[test]
    fn undo_on_dead_process_counts_failures_but_clears_records() {
        let process = MockProcess::builder().region(0x1000, vec![0; 16]).build();
        let cave = process.allocate(8).unwrap();

        let mut registry = InjectionRegistry::new();
        registry.record_patch("hook", 0x1000, vec![1, 2, 3]);
        registry.record_cave("hook", cave, 8);
        process.kill();

        let report = registry.undo(&process, "hook");
        assert_eq!(report.restored, 0);
        assert_eq!(report.failed, 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn identifiers_are_deduplicated_in_order() {
        let mut registry = InjectionRegistry::new();
        registry.record_patch("a", 0x1000, vec![0]);
        registry.record_cave("a", 0x2000, 8);
        registry.record_patch("b", 0x3000, vec![0]);
        assert_eq!(registry.identifiers(), vec!["a", "b"]);
    }

    #[test]
    fn verify_reports_overwritten_patches() {
        let process = MockProcess::builder().region(0x1000, vec![0xAA; 16]).build();
        let mut registry = InjectionRegistry::new();
        registry.record_patch("hook", 0x1000, vec![0xAA; 4]);

        let stub = vec![0x68, 0, 0, 0];
        process.write_bytes(0x1000, &stub).unwrap();
        let expected = |_: &MemoryPatch| Some(stub.clone());
        assert!(registry.verify(&process, &expected).unwrap().is_empty());

        // Something clobbered the trampoline.
        process.write_bytes(0x1000, &[0xCC; 4]).unwrap();
        assert_eq!(registry.verify(&process, &expected).unwrap(), vec!["hook"]);
    }

    #[test]
    fn undo_all_covers_every_identifier() {
        let process = MockProcess::builder().region(0x1000, vec![0; 64]).build();
        let mut registry = InjectionRegistry::new();
        registry.record_patch("a", 0x1000, vec![7; 2]);
        registry.record_patch("b", 0x1010, vec![9; 2]);

        let report = registry.undo_all(&process);
        assert_eq!(report.restored, 2);
        assert!(registry.is_empty());
    }
}
