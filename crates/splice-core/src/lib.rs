//! Runtime instrumentation engine for an external game process.
//!
//! The engine attaches to a running target, installs trampoline hooks
//! that redirect short instruction windows into allocated code caves,
//! and exchanges data with the injected code through pointer slots. A
//! liveness monitor keeps the whole arrangement standing while the
//! target exits, relaunches, and relocates underneath it.
//!
//! The crate splits into a generic core and one target profile:
//!
//! - [`memory`]: process attachment and raw address-space access
//! - [`chain`]: symbolic pointer chains resolved on demand
//! - [`codegen`]: x86-64 fragment builders and branch relocation
//! - [`registry`] / [`hook`]: the patch ledger and the injector
//! - [`channel`]: typed access through captured pointer slots
//! - [`monitor`]: attach/drift/reinstall state machine
//! - [`layout`] / [`profile`]: offsets and hooks for the supported build

pub mod chain;
pub mod channel;
pub mod codegen;
pub mod config;
pub mod error;
pub mod hook;
pub mod layout;
pub mod memory;
pub mod monitor;
pub mod profile;
pub mod registry;

pub use chain::{AddressChain, WriteMode};
pub use channel::{IndirectSlot, ValueChannel};
pub use error::{Error, Result};
pub use hook::Injector;
pub use layout::{TargetLayout, load_layout, save_layout};
pub use monitor::{AttachState, HookSpec, LivenessMonitor, PollOutcome};
