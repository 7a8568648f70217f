//! Typed access to game state through injected pointer slots.
//!
//! Hooks capture live object pointers by storing them into pointer
//! slots the injector allocates. A [`ValueChannel`] reads the slot on
//! every access, so a channel stays valid across object churn: whatever
//! the hook last captured is what the channel addresses.

use std::time::Duration;

use tracing::warn;

use crate::chain::{AddressChain, Scalar, WriteMode};
use crate::config::timing::FRAME_MILLIS;
use crate::error::{Error, Result};
use crate::memory::TargetProcess;

/// Highest usable flag lane; bit 31 is the sign bit and stays clear.
pub const MAX_FLAG_LANE: u8 = 30;

/// A cave holding a single pointer written by injected code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectSlot {
    address: u64,
}

impl IndirectSlot {
    pub fn new(address: u64) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Read the captured pointer. A zero slot means the hook has not run
    /// yet, which is an error distinct from any real address.
    pub fn resolve(&self, process: &dyn TargetProcess) -> Result<u64> {
        let bytes = process.read_bytes(self.address, 8)?;
        let pointer = u64::from_le_bytes(bytes.try_into().expect("8-byte read"));
        if pointer == 0 {
            return Err(Error::NullPointer {
                address: self.address,
            });
        }
        Ok(pointer)
    }

    /// True once the hook has stored a pointer into the slot.
    pub fn is_populated(&self, process: &dyn TargetProcess) -> bool {
        self.resolve(process).is_ok()
    }
}

/// Reads and writes fields of the object a slot points at.
#[derive(Debug, Clone, Copy)]
pub struct ValueChannel {
    slot: IndirectSlot,
}

impl ValueChannel {
    pub fn new(slot: IndirectSlot) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> IndirectSlot {
        self.slot
    }

    fn chain(&self, offset: i64) -> AddressChain {
        AddressChain::absolute(self.slot.address).deref().offset(offset)
    }

    /// Read a field at `offset` from the pointed-to object.
    pub fn read<T: Scalar>(&self, process: &dyn TargetProcess, offset: i64) -> Result<T> {
        self.chain(offset).get(process)
    }

    /// Write a field at `offset`. `WriteMode::Relative` adds to the
    /// stored value instead of replacing it.
    pub fn write<T: Scalar>(
        &self,
        process: &dyn TargetProcess,
        offset: i64,
        value: T,
        mode: WriteMode,
    ) -> Result<()> {
        self.chain(offset).set(process, value, mode)
    }

    pub fn read_bytes(
        &self,
        process: &dyn TargetProcess,
        offset: i64,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.chain(offset).get_bytes(process, len)
    }

    /// Write raw bytes at `offset`. Byte arrays have no arithmetic sum,
    /// so only `WriteMode::Absolute` is accepted.
    pub fn write_bytes(
        &self,
        process: &dyn TargetProcess,
        offset: i64,
        bytes: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        if mode == WriteMode::Relative {
            return Err(Error::RelativeWriteUnsupported("byte arrays"));
        }
        self.chain(offset).set_bytes(process, bytes)
    }

    /// Apply several writes, continuing past individual failures.
    /// Returns the number of writes that failed.
    pub fn write_batch<T: Scalar>(
        &self,
        process: &dyn TargetProcess,
        writes: &[(i64, T, WriteMode)],
    ) -> usize {
        let mut failures = 0;
        for &(offset, value, mode) in writes {
            if let Err(e) = self.write(process, offset, value, mode) {
                warn!("Batch write at offset {offset:#x} failed: {e}");
                failures += 1;
            }
        }
        failures
    }

    /// Set or clear one bit lane in an `i32` flag field.
    ///
    /// Lanes above [`MAX_FLAG_LANE`] are rejected so the field never
    /// goes negative.
    pub fn set_flag(
        &self,
        process: &dyn TargetProcess,
        offset: i64,
        lane: u8,
        on: bool,
    ) -> Result<()> {
        if lane > MAX_FLAG_LANE {
            return Err(Error::FlagLaneOutOfRange(lane));
        }
        let flags: i32 = self.read(process, offset)?;
        let updated = if on {
            flags | (1 << lane)
        } else {
            flags & !(1 << lane)
        };
        self.write(process, offset, updated, WriteMode::Absolute)
    }

    /// Post a one-shot command: the effect index in the low 16 bits and
    /// the duration in frames in the high 16. The injected poll loop
    /// consumes the value and zeroes the field.
    pub fn send_command(
        &self,
        process: &dyn TargetProcess,
        offset: i64,
        index: i16,
        duration: Duration,
    ) -> Result<()> {
        // The duration lane is 16 bits wide; longer durations saturate
        // instead of shifting into the sign bit.
        let frames = (duration.as_millis() as u32 / FRAME_MILLIS).min(i16::MAX as u32) as i32;
        let packed = (frames << 16) | (index as i32 & 0xFFFF);
        self.write(process, offset, packed, WriteMode::Absolute)
    }
}
