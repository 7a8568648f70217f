//! Access to the target process's address space.
//!
//! Everything above this module talks to the target through the
//! [`TargetProcess`] trait, so the engine itself carries no OS-specific
//! code. The Windows implementation lives in [`windows`]; tests run
//! against the in-memory mock.

#[cfg(target_os = "windows")]
mod windows;

#[cfg(any(test, feature = "debug-tools"))]
pub mod mock;

#[cfg(target_os = "windows")]
pub use windows::{WindowsLocator, WindowsProcess};

#[cfg(any(test, feature = "debug-tools"))]
pub use mock::{MockLocator, MockProcess, MockProcessBuilder};

use crate::error::Result;

/// Raw read/write access to one attached process.
///
/// These are the only primitives the engine needs from the operating
/// system: byte-level reads and writes at absolute addresses, executable
/// memory allocation, module base lookup, and a liveness check. All
/// methods return a result instead of blocking or throwing; a dead
/// process surfaces as read/write failures, never as a panic.
pub trait TargetProcess: Send {
    /// True while the process handle still refers to a running process.
    fn is_alive(&self) -> bool;

    /// Base address of a loaded module (e.g. `halo1.dll`), by file name.
    fn module_base(&self, module: &str) -> Result<u64>;

    /// Read `len` bytes at an absolute address.
    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    /// Write bytes at an absolute address.
    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Allocate a readable/writable/executable region and return its address.
    fn allocate(&self, size: usize) -> Result<u64>;

    /// Release a region previously returned by [`TargetProcess::allocate`].
    fn free(&self, address: u64, size: usize) -> Result<()>;
}

/// Finds and opens a target process by executable name.
pub trait ProcessLocator: Send {
    /// Returns `Ok(None)` when no process with that name is running.
    fn locate(&self, process_name: &str) -> Result<Option<Box<dyn TargetProcess>>>;
}

/// Format bytes as spaced uppercase hex for log output.
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
