use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use splice_core::chain::AddressChain;
use splice_core::config::timing::{MONITOR_POLL_INTERVAL, REATTACH_DELAY};
use splice_core::hook::Injector;
use splice_core::layout::{self, TargetLayout};
use splice_core::memory::{ProcessLocator, TargetProcess, format_bytes};
use splice_core::monitor::{LivenessMonitor, PollOutcome};
use splice_core::profile::{self, ActivityTracker, PlayerAccess, slots};
use tracing::{info, warn};

use crate::shutdown::ShutdownSignal;

/// Load the layout file, falling back to the built-in defaults when it
/// is missing or unreadable.
pub fn load_or_default(path: &Path) -> TargetLayout {
    match layout::load_layout(path) {
        Ok(layout) => layout,
        Err(e) => {
            warn!("Failed to load layout from {}: {e}, using defaults", path.display());
            TargetLayout::default()
        }
    }
}

/// Write the built-in layout to disk as a starting point for edits.
pub fn init_layout(path: &Path) -> Result<()> {
    layout::save_layout(&TargetLayout::default(), path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote default layout to {}", path.display());
    Ok(())
}

#[cfg(target_os = "windows")]
fn locator() -> Result<Box<dyn ProcessLocator>> {
    Ok(Box::new(splice_core::memory::WindowsLocator))
}

#[cfg(not(target_os = "windows"))]
fn locator() -> Result<Box<dyn ProcessLocator>> {
    Err(anyhow!("live process access is only supported on Windows"))
}

fn attach(layout: &TargetLayout) -> Result<Box<dyn TargetProcess>> {
    locator()?
        .locate(&layout.process_name)?
        .ok_or_else(|| anyhow!("{} is not running", layout.process_name))
}

/// Keep the hooks installed until interrupted, surviving process
/// restarts and module relocation.
pub fn watch(layout: TargetLayout) -> Result<()> {
    let injector = Injector::new();
    let probe = profile::probe(&layout)?;
    let hooks = profile::standard_hooks(&layout);
    let required = vec![
        slots::PLAYER_BASE.to_string(),
        slots::INSTANT_EFFECTS.to_string(),
        slots::TIMED_EFFECTS.to_string(),
    ];
    let mut monitor = LivenessMonitor::new(
        locator()?,
        layout.process_name.clone(),
        probe,
        hooks,
        required,
    );

    let shutdown = Arc::new(ShutdownSignal::new());
    let handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || handler.trigger())?;

    info!("Watching for {}", layout.process_name);
    let mut tracker = ActivityTracker::new();
    let mut was_ready = false;
    let mut was_active = false;

    while !shutdown.is_shutdown() {
        let outcome = monitor.poll(&injector);

        if outcome == PollOutcome::Reinstalled {
            tracker.reset();
        }

        let ready = monitor.is_ready();
        if ready && !was_ready {
            info!("All hooks installed and slots captured");
            report_player(&monitor, &layout);
        }
        was_ready = ready;

        if ready
            && let (Some(primary), Some(secondary), Some(process)) = (
                monitor.slot(slots::GAMEPLAY_PRIMARY),
                monitor.slot(slots::GAMEPLAY_SECONDARY),
                monitor.process(),
            )
            && let Ok(active) = tracker.update(process, primary, secondary)
        {
            if active != was_active {
                info!("Gameplay {}", if active { "running" } else { "paused" });
            }
            was_active = active;
        }

        let delay = match outcome {
            PollOutcome::ProcessMissing => REATTACH_DELAY,
            _ => MONITOR_POLL_INTERVAL,
        };
        shutdown.wait(delay);
    }

    info!("Shutting down, restoring the target");
    monitor.detach(&injector);
    Ok(())
}

fn report_player(monitor: &LivenessMonitor, layout: &TargetLayout) {
    let (Some(slot), Some(process)) = (monitor.slot(slots::PLAYER_BASE), monitor.process()) else {
        return;
    };
    let access = PlayerAccess::new(slot, layout.player);
    match access.is_player_unit(process) {
        Ok(true) => {
            if let (Ok(health), Ok(shield)) = (access.health(process), access.shield(process)) {
                info!("Player unit captured: health {health:.2}, shield {shield:.2}");
            }
        }
        Ok(false) => info!("Captured unit is not the player yet"),
        Err(e) => warn!("Player unit not readable yet: {e}"),
    }
}

/// One-shot report of the target's state.
pub fn status(layout: TargetLayout) -> Result<()> {
    let process = attach(&layout)?;
    let base = AddressChain::module_base(&layout.module_name).resolve(process.as_ref())?;
    println!("process: {} (alive: {})", layout.process_name, process.is_alive());
    println!("module:  {} at {base:#x}", layout.module_name);

    let probe = layout.probe.chain(&layout.module_name);
    let signature = layout.probe.signature_bytes()?;
    let current = probe.get_bytes(process.as_ref(), signature.len())?;
    let hooked = current != signature;
    println!(
        "probe:   {} ({})",
        format_bytes(&current),
        if hooked { "hooked" } else { "original" }
    );
    Ok(())
}

/// Read bytes at a module-relative offset.
pub fn peek(layout: TargetLayout, offset: u64, len: usize) -> Result<()> {
    let process = attach(&layout)?;
    let chain = AddressChain::module_base(&layout.module_name).offset(offset as i64);
    let address = chain.resolve(process.as_ref())?;
    let bytes = chain.get_bytes(process.as_ref(), len)?;
    println!("{address:#x}: {}", format_bytes(&bytes));
    Ok(())
}

/// Write bytes at a module-relative offset.
pub fn poke(layout: TargetLayout, offset: u64, pattern: &str) -> Result<()> {
    let bytes = layout::parse_pattern(pattern)?;
    let process = attach(&layout)?;
    let chain = AddressChain::module_base(&layout.module_name).offset(offset as i64);
    let address = chain.resolve(process.as_ref())?;
    chain.set_bytes(process.as_ref(), &bytes)?;
    println!("wrote {} bytes at {address:#x}", bytes.len());
    Ok(())
}

/// Run the full install/recover/teardown path against an in-memory
/// target. Useful for checking a layout edit without a live game.
pub fn selftest() -> Result<()> {
    use splice_core::memory::{MockLocator, MockProcess};

    // Shrunken offsets so the whole target fits in one small region.
    let mut layout = TargetLayout::default();
    layout.player_base.offset = 0x100;
    layout.script_comm.offset = 0x200;
    layout.gameplay_poll_primary.offset = 0x300;
    layout.gameplay_poll_secondary.offset = 0x400;
    layout.probe.offset = 0x200;

    const BASE: u64 = 0xA000_0000;
    let process = MockProcess::builder()
        .module(&layout.module_name, BASE, 0x1000)
        .build();
    let mut window = vec![0x90u8; layout.player_base.replace_len];
    window[0x0E] = 0x0F;
    window[0x0F] = 0x85;
    window[0x10..0x14].copy_from_slice(&0x100i32.to_le_bytes());
    process.write_bytes(BASE + layout.player_base.offset, &window)?;
    process.write_bytes(BASE + layout.probe.offset, &layout.probe.signature_bytes()?)?;

    let injector = Injector::new();
    let mut monitor = LivenessMonitor::new(
        Box::new(MockLocator::new(Some(process.clone()))),
        layout.process_name.clone(),
        profile::probe(&layout)?,
        profile::standard_hooks(&layout),
        vec![],
    );

    let first = monitor.poll(&injector);
    let second = monitor.poll(&injector);
    println!("install: {first}, then {second}");

    monitor.detach(&injector);
    let restored =
        process.read_bytes(BASE + layout.probe.offset, 4)? == layout.probe.signature_bytes()?;
    println!(
        "teardown: probe bytes {}",
        if restored { "restored" } else { "NOT restored" }
    );

    if first == PollOutcome::Reinstalled && second == PollOutcome::Stable && restored {
        println!("selftest passed");
        Ok(())
    } else {
        Err(anyhow!("selftest failed"))
    }
}
