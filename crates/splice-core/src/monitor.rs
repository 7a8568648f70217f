//! Liveness and drift recovery.
//!
//! The target can exit, relaunch, or relocate its module at any time.
//! The monitor owns the attachment and drives a small state machine on
//! every poll tick: find the process, resolve the module base, verify
//! the hooks are still in place, and reinstall everything when the
//! ground has shifted. Callers never install hooks directly; they hand
//! the monitor a list of [`HookSpec`]s and read readiness off it.

use std::collections::HashMap;

use strum::Display;
use tracing::{debug, info, warn};

use crate::chain::AddressChain;
use crate::channel::IndirectSlot;
use crate::error::Result;
use crate::hook::Injector;
use crate::memory::{ProcessLocator, TargetProcess, format_bytes};

/// Slots captured by installed hooks, by name.
pub type SlotTable = HashMap<String, IndirectSlot>;

/// Installer callback for one hook. Runs on every (re)installation with
/// a live process and may register the slots it allocates.
pub type HookInstaller =
    dyn Fn(&dyn TargetProcess, &Injector, &mut SlotTable) -> Result<()> + Send + Sync;

/// A named hook the monitor keeps installed.
pub struct HookSpec {
    identifier: String,
    installer: Box<HookInstaller>,
}

impl HookSpec {
    pub fn new(
        identifier: impl Into<String>,
        installer: impl Fn(&dyn TargetProcess, &Injector, &mut SlotTable) -> Result<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            installer: Box::new(installer),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Run the installer against a live process.
    pub fn run(
        &self,
        process: &dyn TargetProcess,
        injector: &Injector,
        slots: &mut SlotTable,
    ) -> Result<()> {
        (self.installer)(process, injector, slots)
    }
}

/// Known-original bytes at a fixed site, used to detect whether the
/// target's code is in its shipped state. When the signature reads back
/// intact, no hook of ours is installed there and a reinstall is due.
pub struct HookProbe {
    point: AddressChain,
    signature: Vec<u8>,
}

impl HookProbe {
    pub fn new(point: AddressChain, signature: Vec<u8>) -> Self {
        Self { point, signature }
    }
}

/// Where the monitor currently stands with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AttachState {
    /// No process with the configured name is running.
    ProcessMissing,
    /// A process is attached but the module base is unresolved or the
    /// installed hooks cannot be confirmed.
    AddressStale,
    /// Module base resolved and hooks confirmed in place.
    AddressStable,
}

/// What one poll tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PollOutcome {
    /// Still waiting for the target process to appear.
    ProcessMissing,
    /// The attached process exited; all records were discarded.
    ProcessLost,
    /// Attached, but the module base could not be resolved or the probe
    /// site could not be read.
    AddressUnresolved,
    /// The base moved or the hooks were gone; everything was reinstalled.
    Reinstalled,
    /// Hooks confirmed in place; nothing to do.
    Stable,
}

/// Drives attachment, drift detection, and hook reinstallation.
pub struct LivenessMonitor {
    locator: Box<dyn ProcessLocator>,
    process_name: String,
    probe: HookProbe,
    hooks: Vec<HookSpec>,
    required_slots: Vec<String>,
    process: Option<Box<dyn TargetProcess>>,
    state: AttachState,
    last_known_base: Option<u64>,
    slots: SlotTable,
}

impl LivenessMonitor {
    pub fn new(
        locator: Box<dyn ProcessLocator>,
        process_name: impl Into<String>,
        probe: HookProbe,
        hooks: Vec<HookSpec>,
        required_slots: Vec<String>,
    ) -> Self {
        Self {
            locator,
            process_name: process_name.into(),
            probe,
            hooks,
            required_slots,
            process: None,
            state: AttachState::ProcessMissing,
            last_known_base: None,
            slots: SlotTable::new(),
        }
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn process(&self) -> Option<&dyn TargetProcess> {
        self.process.as_deref()
    }

    /// The slot a hook registered under `name`, once populated.
    pub fn slot(&self, name: &str) -> Option<IndirectSlot> {
        self.slots.get(name).copied()
    }

    /// True when effect writes can proceed: attached, base stable, and
    /// every required slot has been captured by its hook.
    pub fn is_ready(&self) -> bool {
        let Some(process) = self.process.as_deref() else {
            return false;
        };
        self.state == AttachState::AddressStable
            && self.required_slots.iter().all(|name| {
                self.slots
                    .get(name)
                    .is_some_and(|slot| slot.is_populated(process))
            })
    }

    /// One tick of the recovery state machine.
    pub fn poll(&mut self, injector: &Injector) -> PollOutcome {
        // Attachment. A handle to an exited process is dropped along with
        // every patch record; the address space it referred to is gone.
        if self.process.as_ref().is_none_or(|p| !p.is_alive()) {
            let was_attached = self.process.take().is_some();
            if was_attached {
                warn!("{} exited, discarding all patch records", self.process_name);
                injector.forget_all();
                self.slots.clear();
                self.last_known_base = None;
                self.state = AttachState::ProcessMissing;
                return PollOutcome::ProcessLost;
            }

            match self.locator.locate(&self.process_name) {
                Ok(Some(process)) => {
                    info!("Attached to {}", self.process_name);
                    self.process = Some(process);
                    self.state = AttachState::AddressStale;
                }
                Ok(None) => return PollOutcome::ProcessMissing,
                Err(e) => {
                    warn!("Failed to attach to {}: {e}", self.process_name);
                    return PollOutcome::ProcessMissing;
                }
            }
        }
        let process = self.process.as_deref().expect("attached above");

        // Base resolution. The probe chain anchors at the module, so a
        // failure here and a failure there are the same condition.
        let base = match self.probe.point.resolve(process) {
            Ok(address) => address,
            Err(e) => {
                debug!("Probe site unresolved: {e}");
                self.state = AttachState::AddressStale;
                return PollOutcome::AddressUnresolved;
            }
        };

        let base_moved = self.last_known_base != Some(base);
        let needs_reinstall = if base_moved {
            if let Some(old) = self.last_known_base {
                info!("Probe site moved from {old:#x} to {base:#x}");
            }
            true
        } else {
            match process.read_bytes(base, self.probe.signature.len()) {
                Ok(bytes) => {
                    // The shipped signature reading back intact means the
                    // trampoline is no longer there.
                    if bytes == self.probe.signature {
                        info!(
                            "Original bytes back at probe site ({}), hooks are gone",
                            format_bytes(&bytes)
                        );
                        true
                    } else {
                        false
                    }
                }
                Err(e) => {
                    debug!("Probe site unreadable: {e}");
                    self.state = AttachState::AddressStale;
                    return PollOutcome::AddressUnresolved;
                }
            }
        };

        if needs_reinstall {
            self.reinstall_all(injector);
            self.last_known_base = Some(base);
            self.state = AttachState::AddressStable;
            return PollOutcome::Reinstalled;
        }

        self.state = AttachState::AddressStable;
        PollOutcome::Stable
    }

    /// Tear down whatever is installed and run every hook's installer
    /// afresh. Individual failures are logged and skipped; a hook that
    /// cannot install now will be retried on the next reinstall.
    fn reinstall_all(&mut self, injector: &Injector) {
        let process = self.process.as_deref().expect("attached");
        injector.uninstall_all(process);
        self.slots.clear();

        for hook in &self.hooks {
            match hook.run(process, injector, &mut self.slots) {
                Ok(()) => debug!("Installed hook '{}'", hook.identifier),
                Err(e) => warn!("Failed to install hook '{}': {e}", hook.identifier),
            }
        }
        info!("Reinstalled {} hooks", self.hooks.len());
    }

    /// Restore the target and drop the attachment. Safe to call at any
    /// point; a missing process just clears local state.
    pub fn detach(&mut self, injector: &Injector) {
        if let Some(process) = self.process.take() {
            injector.abort_all(process.as_ref());
        } else {
            injector.forget_all();
        }
        self.slots.clear();
        self.last_known_base = None;
        self.state = AttachState::ProcessMissing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen;
    use crate::memory::{MockLocator, MockProcess};

    const MODULE: &str = "halo1.dll";
    const BASE: u64 = 0xA000_0000;
    const PROBE_OFFSET: i64 = 0x200;
    const SIGNATURE: [u8; 4] = [0x48, 0x63, 0x42, 0x34];
    const REPLACE_LEN: usize = 0x17;

    fn seeded_process(base: u64) -> MockProcess {
        let process = MockProcess::builder().module(MODULE, base, 0x1000).build();
        process
            .write_bytes(base + PROBE_OFFSET as u64, &SIGNATURE)
            .unwrap();
        process
    }

    /// A hook at the probe site that captures a slot, like the real
    /// pointer-capture injections do.
    fn probe_site_hook(slot_name: &'static str) -> HookSpec {
        HookSpec::new("probe-site", move |process, injector, slots| {
            let point = AddressChain::module_base(MODULE).offset(PROBE_OFFSET);
            injector.install(process, "probe-site", &point, REPLACE_LEN, |ctx| {
                let mut body = ctx.original_bytes.to_vec();
                body.extend(codegen::absolute_jump(ctx.return_address));
                Ok(body)
            })?;
            let slot = injector.alloc_pointer_slot(process, "probe-site")?;
            slots.insert(slot_name.to_string(), slot);
            Ok(())
        })
    }

    fn monitor_with(locator: MockLocator, required: Vec<String>) -> LivenessMonitor {
        let probe = HookProbe::new(
            AddressChain::module_base(MODULE).offset(PROBE_OFFSET),
            SIGNATURE.to_vec(),
        );
        LivenessMonitor::new(
            Box::new(locator),
            "MCC-Win64-Shipping",
            probe,
            vec![probe_site_hook("player_base")],
            required,
        )
    }

    #[test]
    fn attaches_and_installs_on_first_sight() {
        let locator = MockLocator::new(None);
        let mut monitor = monitor_with(locator, vec![]);
        let injector = Injector::new();

        assert_eq!(monitor.poll(&injector), PollOutcome::ProcessMissing);
        assert_eq!(monitor.state(), AttachState::ProcessMissing);

        let process = seeded_process(BASE);
        let locator = MockLocator::new(Some(process.clone()));
        let mut monitor = monitor_with(locator, vec![]);

        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);
        assert_eq!(monitor.state(), AttachState::AddressStable);
        assert!(injector.is_installed("probe-site"));
        assert!(monitor.slot("player_base").is_some());

        // The probe site now holds the trampoline, so the next poll sees
        // a stable installation.
        assert_eq!(monitor.poll(&injector), PollOutcome::Stable);
    }

    #[test]
    fn module_relocation_triggers_reinstall_at_new_base() {
        let process = seeded_process(BASE);
        let locator = MockLocator::new(Some(process.clone()));
        let mut monitor = monitor_with(locator, vec![]);
        let injector = Injector::new();

        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);

        // The game relaunched its module at a new base; the old region
        // moved with it, signature included.
        const NEW_BASE: u64 = 0xB000_0000;
        process.relocate_module(MODULE, NEW_BASE);
        process
            .write_bytes(NEW_BASE + PROBE_OFFSET as u64, &SIGNATURE)
            .unwrap();

        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);
        // The trampoline is at the new address.
        let patched = process
            .read_bytes(NEW_BASE + PROBE_OFFSET as u64, 1)
            .unwrap();
        assert_eq!(patched[0], 0x68);
        assert_eq!(monitor.poll(&injector), PollOutcome::Stable);
    }

    #[test]
    fn restored_original_bytes_trigger_reinstall() {
        let process = seeded_process(BASE);
        let locator = MockLocator::new(Some(process.clone()));
        let mut monitor = monitor_with(locator, vec![]);
        let injector = Injector::new();

        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);
        assert_eq!(monitor.poll(&injector), PollOutcome::Stable);

        // Something put the shipped code back (game update, other tool).
        process
            .write_bytes(BASE + PROBE_OFFSET as u64, &SIGNATURE)
            .unwrap();
        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);
    }

    #[test]
    fn process_exit_discards_records_and_recovers() {
        let process = seeded_process(BASE);
        let locator = MockLocator::new(Some(process.clone()));
        let mut monitor = monitor_with(locator, vec![]);
        let injector = Injector::new();

        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);
        process.kill();

        assert_eq!(monitor.poll(&injector), PollOutcome::ProcessLost);
        assert!(!injector.is_installed("probe-site"));
        assert!(monitor.slot("player_base").is_none());
        assert_eq!(monitor.poll(&injector), PollOutcome::ProcessMissing);
    }

    #[test]
    fn readiness_requires_populated_slots() {
        let process = seeded_process(BASE);
        let locator = MockLocator::new(Some(process.clone()));
        let mut monitor = monitor_with(locator, vec!["player_base".to_string()]);
        let injector = Injector::new();

        assert_eq!(monitor.poll(&injector), PollOutcome::Reinstalled);
        // The hook is installed but has not captured a pointer yet.
        assert!(!monitor.is_ready());

        // The injected code runs and stores a pointer into the slot.
        let slot = monitor.slot("player_base").unwrap();
        process
            .write_bytes(slot.address(), &0xDEAD_0000u64.to_le_bytes())
            .unwrap();
        assert!(monitor.is_ready());
    }

    #[test]
    fn detach_restores_and_clears() {
        let process = seeded_process(BASE);
        let locator = MockLocator::new(Some(process.clone()));
        let mut monitor = monitor_with(locator, vec![]);
        let injector = Injector::new();

        monitor.poll(&injector);
        monitor.detach(&injector);

        assert_eq!(monitor.state(), AttachState::ProcessMissing);
        assert!(!injector.is_installed("probe-site"));
        assert_eq!(
            process
                .read_bytes(BASE + PROBE_OFFSET as u64, SIGNATURE.len())
                .unwrap(),
            SIGNATURE
        );
    }
}
