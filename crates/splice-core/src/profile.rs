//! The concrete hooks for the supported target.
//!
//! Everything target-specific that is not a plain offset lives here:
//! the cave bodies for each injection point, the sentinel values the
//! game scripts use to mark capturable addresses, and typed accessors
//! over the captured objects. The rest of the engine is generic over
//! any [`TargetLayout`].

use crate::chain::WriteMode;
use crate::channel::{IndirectSlot, ValueChannel};
use crate::codegen::{self, CodeBuffer, Reg, reloc};
use crate::error::Result;
use crate::layout::{InjectionPoint, PlayerOffsets, TargetLayout};
use crate::memory::TargetProcess;
use crate::monitor::{HookProbe, HookSpec};

/// Names the hooks register their slots under.
pub mod slots {
    /// Pointer to the player's unit object, captured on unit update.
    pub const PLAYER_BASE: &str = "player_base";
    /// Script-side field for always-on effect flags.
    pub const INSTANT_EFFECTS: &str = "instant_effects";
    /// Script-side field for one-shot timed commands.
    pub const TIMED_EFFECTS: &str = "timed_effects";
    /// Counter advanced by the primary gameplay-tick hook.
    pub const GAMEPLAY_PRIMARY: &str = "gameplay_primary";
    /// Counter advanced by the secondary gameplay-tick hook.
    pub const GAMEPLAY_SECONDARY: &str = "gameplay_secondary";
}

/// Sentinel the effect script stores to mark the instant-effects field.
pub const INSTANT_EFFECTS_MARKER: i32 = 123_456_789;
/// Sentinel the effect script stores to mark the timed-effects field.
pub const TIMED_EFFECTS_MARKER: i32 = 987_654_321;

/// Offset of the writable field relative to a captured sentinel address.
pub const EFFECT_FIELD_OFFSET: i64 = 4;

/// Offset into the script-comm originals where the capture prologue is
/// spliced; the first instructions load the operand registers the
/// prologue inspects.
const SCRIPT_COMM_SPLICE_AT: usize = 0x7;

/// Hook identifiers, also used as registry keys.
pub mod hooks {
    pub const PLAYER_BASE: &str = "player-base";
    pub const SCRIPT_COMM: &str = "script-comm";
    pub const GAMEPLAY_PRIMARY: &str = "gameplay-poll-primary";
    pub const GAMEPLAY_SECONDARY: &str = "gameplay-poll-secondary";
}

/// The probe the monitor uses to notice lost hooks.
pub fn probe(layout: &TargetLayout) -> Result<HookProbe> {
    Ok(HookProbe::new(
        layout.probe.chain(&layout.module_name),
        layout.probe.signature_bytes()?,
    ))
}

/// All hooks for the target, in installation order.
pub fn standard_hooks(layout: &TargetLayout) -> Vec<HookSpec> {
    vec![
        player_base_hook(layout),
        script_comm_hook(layout),
        gameplay_poll_hook(
            layout,
            hooks::GAMEPLAY_PRIMARY,
            slots::GAMEPLAY_PRIMARY,
            layout.gameplay_poll_primary.clone(),
        ),
        gameplay_poll_hook(
            layout,
            hooks::GAMEPLAY_SECONDARY,
            slots::GAMEPLAY_SECONDARY,
            layout.gameplay_poll_secondary.clone(),
        ),
    ]
}

/// Captures the player's unit pointer out of rsi on every unit update.
///
/// The displaced window contains a near Jcc, which gets re-pointed at a
/// stub appended after the return jump.
fn player_base_hook(layout: &TargetLayout) -> HookSpec {
    let module = layout.module_name.clone();
    let point = layout.player_base.clone();

    HookSpec::new(hooks::PLAYER_BASE, move |process, injector, slot_table| {
        let slot = injector.alloc_pointer_slot(process, hooks::PLAYER_BASE)?;
        let chain = point.chain(&module);
        let branch = point.branch;

        injector.install(process, hooks::PLAYER_BASE, &chain, point.replace_len, |ctx| {
            let prologue = CodeBuffer::new()
                .append(&codegen::push_reg(Reg::Rax))
                .append(&[0x48, 0x89, 0xF0]) // mov rax, rsi
                .append(&codegen::store_rax_to(slot.address()))
                .append(&codegen::pop_reg(Reg::Rax))
                .into_vec();

            let mut body = prologue.clone();
            body.extend_from_slice(ctx.original_bytes);
            body.extend(codegen::absolute_jump(ctx.return_address));

            match branch {
                Some(site) => reloc::fix_relative_branch(
                    &body,
                    ctx.injection_address,
                    site.into(),
                    prologue.len(),
                ),
                None => Ok(body),
            }
        })?;

        slot_table.insert(slots::PLAYER_BASE.to_string(), slot);
        Ok(())
    })
}

/// Captures the script-side effect fields.
///
/// The effect script stores a known sentinel into a field and passes its
/// struct through the hooked site in rdx. The prologue compares the
/// field against each sentinel and, on a match, stores the field's
/// address into the corresponding slot. It is spliced after the first
/// instructions of the window so rdx is already loaded when it runs.
fn script_comm_hook(layout: &TargetLayout) -> HookSpec {
    let module = layout.module_name.clone();
    let point = layout.script_comm.clone();

    HookSpec::new(hooks::SCRIPT_COMM, move |process, injector, slot_table| {
        let instant = injector.alloc_pointer_slot(process, hooks::SCRIPT_COMM)?;
        let timed = injector.alloc_pointer_slot(process, hooks::SCRIPT_COMM)?;
        let chain = point.chain(&module);

        injector.install(process, hooks::SCRIPT_COMM, &chain, point.replace_len, |ctx| {
            let prologue = CodeBuffer::new()
                .append(&codegen::push_reg(Reg::Rax))
                .append(&capture_on_marker(INSTANT_EFFECTS_MARKER, instant.address()))
                .append(&capture_on_marker(TIMED_EFFECTS_MARKER, timed.address()))
                .append(&codegen::pop_reg(Reg::Rax))
                .into_vec();

            let mut body = codegen::splice(ctx.original_bytes, &prologue, SCRIPT_COMM_SPLICE_AT);
            body.extend(codegen::absolute_jump(ctx.return_address));
            Ok(body)
        })?;

        slot_table.insert(slots::INSTANT_EFFECTS.to_string(), instant);
        slot_table.insert(slots::TIMED_EFFECTS.to_string(), timed);
        Ok(())
    })
}

/// `cmp dword [rdx+0x28], marker / jne skip / lea rax, [rdx+0x28] /
/// mov [slot], rax` — one capture block of the script-comm prologue.
fn capture_on_marker(marker: i32, slot_address: u64) -> Vec<u8> {
    CodeBuffer::new()
        .append(&[0x81, 0x7A, 0x28]) // cmp dword [rdx+0x28], imm32
        .append_i32(marker)
        .append(&[0x75, 0x0E]) // jne past the capture (4 + 10 bytes)
        .append(&[0x48, 0x8D, 0x42, 0x28]) // lea rax, [rdx+0x28]
        .append(&codegen::store_rax_to(slot_address))
        .into_vec()
}

/// Increments a counter cave on every pass through a gameplay-tick
/// site. The monitor reads the counter to tell a live simulation from a
/// paused or menu-bound game.
fn gameplay_poll_hook(
    layout: &TargetLayout,
    identifier: &'static str,
    slot_name: &'static str,
    point: InjectionPoint,
) -> HookSpec {
    let module = layout.module_name.clone();

    HookSpec::new(identifier, move |process, injector, slot_table| {
        let counter = injector.alloc_pointer_slot(process, identifier)?;
        let chain = point.chain(&module);

        injector.install(process, identifier, &chain, point.replace_len, |ctx| {
            let body = CodeBuffer::new()
                .append(&codegen::push_reg(Reg::Rax))
                .append(&codegen::load_rax_from(counter.address()))
                .append(&codegen::add_rax_imm8(1))
                .append(&codegen::store_rax_to(counter.address()))
                .append(&codegen::pop_reg(Reg::Rax))
                .append(ctx.original_bytes)
                .append(&codegen::absolute_jump(ctx.return_address))
                .into_vec();
            Ok(body)
        })?;

        slot_table.insert(slot_name.to_string(), counter);
        Ok(())
    })
}

/// Detects whether the gameplay tick is advancing between polls.
#[derive(Default)]
pub struct ActivityTracker {
    last: Option<(u64, u64)>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read both counters and report whether either advanced since the
    /// previous call. The first call establishes a baseline and reports
    /// inactive.
    pub fn update(
        &mut self,
        process: &dyn TargetProcess,
        primary: IndirectSlot,
        secondary: IndirectSlot,
    ) -> Result<bool> {
        let read = |slot: IndirectSlot| -> Result<u64> {
            let bytes = process.read_bytes(slot.address(), 8)?;
            Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte read")))
        };
        let current = (read(primary)?, read(secondary)?);
        let active = self.last.is_some_and(|last| last != current);
        self.last = Some(current);
        Ok(active)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Typed access to the captured player unit.
pub struct PlayerAccess {
    channel: ValueChannel,
    offsets: PlayerOffsets,
}

impl PlayerAccess {
    pub fn new(slot: IndirectSlot, offsets: PlayerOffsets) -> Self {
        Self {
            channel: ValueChannel::new(slot),
            offsets,
        }
    }

    /// True when the captured pointer is the player's own unit rather
    /// than some other unit that passed through the hooked path.
    pub fn is_player_unit(&self, process: &dyn TargetProcess) -> Result<bool> {
        let kind: i16 = self.channel.read(process, self.offsets.unit_kind)?;
        Ok(kind == self.offsets.player_unit_kind)
    }

    pub fn health(&self, process: &dyn TargetProcess) -> Result<f32> {
        self.channel.read(process, self.offsets.health)
    }

    pub fn shield(&self, process: &dyn TargetProcess) -> Result<f32> {
        self.channel.read(process, self.offsets.shield)
    }

    pub fn set_health(
        &self,
        process: &dyn TargetProcess,
        value: f32,
        mode: WriteMode,
    ) -> Result<()> {
        self.channel.write(process, self.offsets.health, value, mode)
    }

    pub fn set_shield(
        &self,
        process: &dyn TargetProcess,
        value: f32,
        mode: WriteMode,
    ) -> Result<()> {
        self.channel.write(process, self.offsets.shield, value, mode)
    }

    /// Hold off shield regeneration for `ticks` simulation ticks.
    pub fn delay_shield_regen(&self, process: &dyn TargetProcess, ticks: i16) -> Result<()> {
        self.channel
            .write(process, self.offsets.shield_regen_delay, ticks, WriteMode::Absolute)
    }

    /// Restore health and shield to full in one batch; reports how many
    /// of the writes failed.
    pub fn heal_full(&self, process: &dyn TargetProcess) -> usize {
        self.channel.write_batch(
            process,
            &[
                (self.offsets.health, 1.0f32, WriteMode::Absolute),
                (self.offsets.shield, 1.0f32, WriteMode::Absolute),
            ],
        )
    }
}

/// The two script-side effect channels, once both slots are captured.
pub struct EffectChannels {
    pub instant: ValueChannel,
    pub timed: ValueChannel,
}

impl EffectChannels {
    pub fn new(instant: IndirectSlot, timed: IndirectSlot) -> Self {
        Self {
            instant: ValueChannel::new(instant),
            timed: ValueChannel::new(timed),
        }
    }

    /// Toggle an always-on effect lane.
    pub fn set_effect(&self, process: &dyn TargetProcess, lane: u8, on: bool) -> Result<()> {
        self.instant.set_flag(process, EFFECT_FIELD_OFFSET, lane, on)
    }

    /// Fire a one-shot timed effect.
    pub fn trigger_timed(
        &self,
        process: &dyn TargetProcess,
        index: i16,
        duration: std::time::Duration,
    ) -> Result<()> {
        self.timed
            .send_command(process, EFFECT_FIELD_OFFSET, index, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::JUMP_STUB_LEN;
    use crate::hook::Injector;
    use crate::memory::MockProcess;
    use crate::monitor::SlotTable;

    const BASE: u64 = 0xA000_0000;

    fn layout() -> TargetLayout {
        // Shrunken offsets so everything fits in one small mock region.
        let mut layout = TargetLayout::default();
        layout.player_base.offset = 0x100;
        layout.script_comm.offset = 0x200;
        layout.gameplay_poll_primary.offset = 0x300;
        layout.gameplay_poll_secondary.offset = 0x400;
        layout.probe.offset = 0x200;
        layout
    }

    fn target(layout: &TargetLayout) -> MockProcess {
        let process = MockProcess::builder()
            .module(&layout.module_name, BASE, 0x1000)
            .build();
        // Jcc 0F 85 with a forward displacement inside the player-base
        // window, matching the shape of the real site.
        let mut player_window = vec![0x90u8; layout.player_base.replace_len];
        player_window[0x0E] = 0x0F;
        player_window[0x0F] = 0x85;
        player_window[0x10..0x14].copy_from_slice(&0x100i32.to_le_bytes());
        process
            .write_bytes(BASE + layout.player_base.offset, &player_window)
            .unwrap();
        process
            .write_bytes(BASE + layout.probe.offset, &[0x48, 0x63, 0x42, 0x34])
            .unwrap();
        process
    }

    /// Run every installer directly, as the monitor would.
    fn install_all(
        layout: &TargetLayout,
        process: &MockProcess,
        injector: &Injector,
    ) -> SlotTable {
        let mut table = SlotTable::new();
        for hook in standard_hooks(layout) {
            hook.run(process, injector, &mut table).unwrap();
        }
        table
    }

    #[test]
    fn all_hooks_install_and_register_their_slots() {
        let layout = layout();
        let process = target(&layout);
        let injector = Injector::new();

        let table = install_all(&layout, &process, &injector);
        for name in [
            slots::PLAYER_BASE,
            slots::INSTANT_EFFECTS,
            slots::TIMED_EFFECTS,
            slots::GAMEPLAY_PRIMARY,
            slots::GAMEPLAY_SECONDARY,
        ] {
            assert!(table.contains_key(name), "missing slot {name}");
        }
        for id in [
            hooks::PLAYER_BASE,
            hooks::SCRIPT_COMM,
            hooks::GAMEPLAY_PRIMARY,
            hooks::GAMEPLAY_SECONDARY,
        ] {
            assert!(injector.is_installed(id), "missing hook {id}");
        }
    }

    #[test]
    fn installer_slots_stay_mapped_after_install() {
        let layout = layout();
        let process = target(&layout);
        let injector = Injector::new();

        let table = install_all(&layout, &process, &injector);
        for (name, slot) in &table {
            assert!(
                !process.freed().contains(&slot.address()),
                "slot {name} was freed during install"
            );
            // The injected prologues write here; the region must be live.
            process
                .read_bytes(slot.address(), 8)
                .unwrap_or_else(|_| panic!("slot {name} is unmapped"));
        }
    }

    #[test]
    fn player_base_cave_relocates_the_jcc() {
        let layout = layout();
        let process = target(&layout);
        let injector = Injector::new();
        let mut table = SlotTable::new();
        player_base_hook(&layout)
            .run(&process, &injector, &mut table)
            .unwrap();

        // Find the cave through the stub at the injection point.
        let stub = process
            .read_bytes(BASE + layout.player_base.offset, JUMP_STUB_LEN)
            .unwrap();
        let cave = decode_stub_target(&stub);
        let body = process.read_bytes(cave, 128).unwrap();

        // The prologue stores rsi through rax into the slot.
        assert_eq!(body[0], 0x50);
        assert_eq!(&body[1..4], [0x48, 0x89, 0xF0]);
        let slot = table[slots::PLAYER_BASE];
        assert_eq!(
            u64::from_le_bytes(body[6..14].try_into().unwrap()),
            slot.address()
        );

        // The Jcc sits after the 15-byte prologue and now points at the
        // appended stub, which targets the original destination.
        let prologue_len = 15;
        let jcc = prologue_len + 0x0E;
        assert_eq!(&body[jcc..jcc + 2], [0x0F, 0x85]);
        let new_disp =
            u32::from_le_bytes(body[jcc + 2..jcc + 6].try_into().unwrap()) as usize;
        let stub_at = jcc + 6 + new_disp;
        let target = decode_stub_target(&body[stub_at..stub_at + JUMP_STUB_LEN]);
        let original_jcc = BASE + layout.player_base.offset + 0x0E;
        assert_eq!(target, original_jcc + 6 + 0x100);
    }

    #[test]
    fn gameplay_counters_drive_the_activity_tracker() {
        let layout = layout();
        let process = target(&layout);
        let injector = Injector::new();
        let table = install_all(&layout, &process, &injector);

        let primary = table[slots::GAMEPLAY_PRIMARY];
        let secondary = table[slots::GAMEPLAY_SECONDARY];
        let mut tracker = ActivityTracker::new();

        // Baseline.
        assert!(!tracker.update(&process, primary, secondary).unwrap());
        // No ticks ran.
        assert!(!tracker.update(&process, primary, secondary).unwrap());

        // Simulate the injected code running once.
        process
            .write_bytes(primary.address(), &1u64.to_le_bytes())
            .unwrap();
        assert!(tracker.update(&process, primary, secondary).unwrap());
        assert!(!tracker.update(&process, primary, secondary).unwrap());
    }

    #[test]
    fn player_access_reads_and_writes_through_the_captured_unit() {
        let layout = layout();
        let process = MockProcess::builder()
            .region(0x5000, vec![0u8; 8])
            .region(0x6000, vec![0u8; 0x1000])
            .build();
        process.write_bytes(0x5000, &0x6000u64.to_le_bytes()).unwrap();
        // Mark the unit as the player's.
        process
            .write_bytes(
                0x6000 + layout.player.unit_kind as u64,
                &layout.player.player_unit_kind.to_le_bytes(),
            )
            .unwrap();

        let access = PlayerAccess::new(IndirectSlot::new(0x5000), layout.player);
        assert!(access.is_player_unit(&process).unwrap());

        access
            .set_health(&process, 0.5, WriteMode::Absolute)
            .unwrap();
        assert_eq!(access.health(&process).unwrap(), 0.5);

        assert_eq!(access.heal_full(&process), 0);
        assert_eq!(access.health(&process).unwrap(), 1.0);
        assert_eq!(access.shield(&process).unwrap(), 1.0);

        access.delay_shield_regen(&process, 300).unwrap();
        let delay: i16 = ValueChannel::new(IndirectSlot::new(0x5000))
            .read(&process, layout.player.shield_regen_delay)
            .unwrap();
        assert_eq!(delay, 300);
    }

    #[test]
    fn effect_channels_write_next_to_the_sentinel() {
        let process = MockProcess::builder()
            .region(0x5000, vec![0u8; 8])
            .region(0x5100, vec![0u8; 8])
            .region(0x6000, vec![0u8; 0x100])
            .region(0x7000, vec![0u8; 0x100])
            .build();
        process.write_bytes(0x5000, &0x6000u64.to_le_bytes()).unwrap();
        process.write_bytes(0x5100, &0x7000u64.to_le_bytes()).unwrap();

        let channels =
            EffectChannels::new(IndirectSlot::new(0x5000), IndirectSlot::new(0x5100));

        channels.set_effect(&process, 3, true).unwrap();
        let flags = i32::from_le_bytes(
            process
                .read_bytes(0x6000 + EFFECT_FIELD_OFFSET as u64, 4)
                .unwrap()
                .try_into()
                .unwrap(),
        );
        assert_eq!(flags, 1 << 3);

        channels
            .trigger_timed(&process, 7, std::time::Duration::from_secs(2))
            .unwrap();
        let packed = i32::from_le_bytes(
            process
                .read_bytes(0x7000 + EFFECT_FIELD_OFFSET as u64, 4)
                .unwrap()
                .try_into()
                .unwrap(),
        );
        assert_eq!(packed & 0xFFFF, 7);
        assert_eq!(packed >> 16, 2000 / 33);
    }

    fn decode_stub_target(stub: &[u8]) -> u64 {
        assert_eq!(stub[0], 0x68);
        let low = u32::from_le_bytes(stub[1..5].try_into().unwrap()) as u64;
        let high = u32::from_le_bytes(stub[9..13].try_into().unwrap()) as u64;
        (high << 32) | low
    }
}
