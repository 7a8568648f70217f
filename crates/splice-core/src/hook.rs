//! Trampoline installation.
//!
//! A hook replaces `replace_len` bytes at an injection point with a
//! padded absolute jump into a freshly allocated cave. The cave body is
//! produced by a caller-supplied builder, which typically splices a
//! prologue into the displaced original bytes and ends with a jump back
//! to the instruction after the overwritten range.
//!
//! Installation is idempotent per identifier: installing a hook that is
//! already present undoes the previous trampoline first, so repeated
//! installs never leak code caves or stack patches. Pointer slots
//! allocated under the identifier are left alone by that path and are
//! released only on uninstall.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::chain::AddressChain;
use crate::channel::IndirectSlot;
use crate::codegen;
use crate::config::cave::{POINTER_SLOT_SIZE, STANDARD_CAVE_SIZE};
use crate::error::{Error, Result};
use crate::memory::TargetProcess;
use crate::registry::{InjectionRegistry, UndoReport};

/// Everything a cave builder needs to generate position-correct code.
pub struct CaveContext<'a> {
    /// Address of the first overwritten byte.
    pub injection_address: u64,
    /// Address of the first byte after the overwritten range; cave bodies
    /// normally end with an absolute jump here.
    pub return_address: u64,
    /// The bytes displaced by the trampoline.
    pub original_bytes: &'a [u8],
}

/// Installs and removes hooks, keeping the registry consistent.
#[derive(Default)]
pub struct Injector {
    registry: Mutex<InjectionRegistry>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, InjectionRegistry> {
        self.registry.lock().expect("registry lock poisoned")
    }

    /// Install a hook at `injection_point`, replacing `replace_len` bytes.
    ///
    /// `build` receives the resolved addresses and displaced bytes and
    /// returns the complete cave body. Validation happens before any
    /// write: an undersized injection point or an oversized body leaves
    /// the target untouched. Returns the cave address.
    pub fn install(
        &self,
        process: &dyn TargetProcess,
        identifier: &str,
        injection_point: &AddressChain,
        replace_len: usize,
        build: impl FnOnce(&CaveContext) -> Result<Vec<u8>>,
    ) -> Result<u64> {
        let mut registry = self.registry();

        if registry.has(identifier) {
            debug!("'{identifier}' already installed, undoing previous trampoline");
            // Pointer slots under this identifier stay alive: the caller
            // allocated them for the cave body built below, and freeing
            // them here would leave injected code writing through
            // released memory.
            registry.undo_trampoline(process, identifier);
        }

        let injection_address = injection_point.resolve(process)?;
        codegen::check_stub_fits(replace_len)?;

        let original_bytes = process.read_bytes(injection_address, replace_len)?;
        let context = CaveContext {
            injection_address,
            return_address: injection_address + replace_len as u64,
            original_bytes: &original_bytes,
        };
        let contents = build(&context)?;
        if contents.len() > STANDARD_CAVE_SIZE {
            return Err(Error::PatchSpaceOverflow {
                required: contents.len(),
                available: STANDARD_CAVE_SIZE,
            });
        }

        // The patch record goes in before the first mutation so a failure
        // partway through can always be undone from the ledger.
        registry.record_patch(identifier, injection_address, original_bytes.clone());

        let cave_address = match process.allocate(STANDARD_CAVE_SIZE) {
            Ok(address) => address,
            Err(e) => {
                registry.forget_last_patch(identifier);
                return Err(e);
            }
        };
        registry.record_cave(identifier, cave_address, STANDARD_CAVE_SIZE);

        let result = process
            .write_bytes(cave_address, &contents)
            .and_then(|_| {
                let stub = codegen::absolute_jump_padded(cave_address, replace_len)?;
                process.write_bytes(injection_address, &stub)
            });
        if let Err(e) = result {
            registry.undo_trampoline(process, identifier);
            return Err(e);
        }

        info!(
            "Installed '{identifier}': {replace_len} bytes at {injection_address:#x} \
             redirected to cave at {cave_address:#x}"
        );
        Ok(cave_address)
    }

    /// Allocate a zeroed pointer slot, recorded under `identifier` so it
    /// is released by [`Injector::uninstall`]. Slots survive a
    /// trampoline reinstall under the same identifier, since the cave
    /// body embeds their addresses.
    pub fn alloc_pointer_slot(
        &self,
        process: &dyn TargetProcess,
        identifier: &str,
    ) -> Result<IndirectSlot> {
        let address = process.allocate(POINTER_SLOT_SIZE)?;
        process.write_bytes(address, &[0u8; POINTER_SLOT_SIZE])?;
        self.registry()
            .record_slot(identifier, address, POINTER_SLOT_SIZE);
        debug!("Allocated pointer slot for '{identifier}' at {address:#x}");
        Ok(IndirectSlot::new(address))
    }

    /// Remove one hook, restoring the displaced bytes and freeing its
    /// caves. A hook that is not installed is a successful no-op.
    pub fn uninstall(&self, process: &dyn TargetProcess, identifier: &str) -> UndoReport {
        let report = self.registry().undo(process, identifier);
        if report != UndoReport::default() {
            info!(
                "Uninstalled '{identifier}': {} restored, {} freed, {} failed",
                report.restored, report.freed, report.failed
            );
        }
        report
    }

    /// Remove every installed hook.
    pub fn uninstall_all(&self, process: &dyn TargetProcess) -> UndoReport {
        self.registry().undo_all(process)
    }

    /// Best-effort teardown for shutdown paths. Failures are logged by
    /// the registry and summarized in the report, never propagated.
    pub fn abort_all(&self, process: &dyn TargetProcess) -> UndoReport {
        let report = self.uninstall_all(process);
        info!(
            "Teardown: {} patches restored, {} caves freed, {} failures",
            report.restored, report.freed, report.failed
        );
        report
    }

    /// Forget every record without touching memory. For when the process
    /// has exited and its address space no longer exists.
    pub fn forget_all(&self) {
        self.registry().clear();
    }

    pub fn is_installed(&self, identifier: &str) -> bool {
        self.registry().has(identifier)
    }

    pub fn installed_identifiers(&self) -> Vec<String> {
        self.registry().identifiers()
    }
}
