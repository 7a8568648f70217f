//! Pointer chains: symbolic descriptions of addresses in the target.
//!
//! A chain is a small immutable value, not a live reference — it is
//! resolved on demand against whatever process is currently attached, and
//! nothing is cached across a process restart. Resolution is fallible and
//! a failure is always distinguishable from "resolved to address zero".

use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::TargetProcess;

/// One step of a pointer chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStep {
    /// Start from the base address of a loaded module.
    ModuleBase(String),
    /// Start from a fixed absolute address.
    Absolute(u64),
    /// Add a signed delta to the current address.
    Offset(i64),
    /// Read the current address as a 64-bit pointer and continue from it.
    Deref,
}

/// An ordered list of steps from a known anchor to a live address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressChain {
    steps: Vec<ChainStep>,
}

/// How a write combines with the value already in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the stored value.
    Absolute,
    /// Store the arithmetic sum of the old value and the supplied one.
    Relative,
}

impl AddressChain {
    pub fn module_base(name: impl Into<String>) -> Self {
        Self {
            steps: vec![ChainStep::ModuleBase(name.into())],
        }
    }

    pub fn absolute(address: u64) -> Self {
        Self {
            steps: vec![ChainStep::Absolute(address)],
        }
    }

    pub fn offset(mut self, delta: i64) -> Self {
        self.steps.push(ChainStep::Offset(delta));
        self
    }

    pub fn deref(mut self) -> Self {
        self.steps.push(ChainStep::Deref);
        self
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    /// Walk the chain against the attached process and produce an address.
    pub fn resolve(&self, process: &dyn TargetProcess) -> Result<u64> {
        let mut current: Option<u64> = None;

        for step in &self.steps {
            current = Some(match (step, current) {
                (ChainStep::ModuleBase(name), _) => process.module_base(name)?,
                (ChainStep::Absolute(address), _) => *address,
                (ChainStep::Offset(delta), Some(address)) => address.wrapping_add_signed(*delta),
                (ChainStep::Deref, Some(address)) => {
                    let bytes = process.read_bytes(address, 8)?;
                    let pointer = u64::from_le_bytes(bytes.try_into().expect("8-byte read"));
                    if pointer == 0 {
                        return Err(Error::NullPointer { address });
                    }
                    pointer
                }
                (_, None) => {
                    return Err(Error::InvalidChain(
                        "chain must start with a module base or absolute address".to_string(),
                    ));
                }
            });
        }

        current.ok_or_else(|| Error::InvalidChain("chain is empty".to_string()))
    }

    /// Typed read at the resolved address.
    pub fn get<T: Scalar>(&self, process: &dyn TargetProcess) -> Result<T> {
        let address = self.resolve(process)?;
        let bytes = process.read_bytes(address, T::SIZE).inspect_err(|_| {
            warn!("Could not read value at {address:#x}, memory may be gone");
        })?;
        Ok(T::read_le(&bytes))
    }

    /// Typed write at the resolved address.
    ///
    /// `WriteMode::Relative` stores old + new, which lets callers add to a
    /// counter without a separate read step.
    pub fn set<T: Scalar>(
        &self,
        process: &dyn TargetProcess,
        value: T,
        mode: WriteMode,
    ) -> Result<()> {
        let address = self.resolve(process)?;
        let value = match mode {
            WriteMode::Absolute => value,
            WriteMode::Relative => {
                let bytes = process.read_bytes(address, T::SIZE)?;
                T::read_le(&bytes).combine(value)
            }
        };
        let mut out = Vec::with_capacity(T::SIZE);
        value.write_le(&mut out);
        process.write_bytes(address, &out).inspect_err(|_| {
            warn!("Could not write value at {address:#x}");
        })
    }

    /// Raw read of `len` bytes at the resolved address.
    pub fn get_bytes(&self, process: &dyn TargetProcess, len: usize) -> Result<Vec<u8>> {
        let address = self.resolve(process)?;
        process.read_bytes(address, len)
    }

    /// Raw write at the resolved address. There is no relative form for
    /// byte arrays; see [`Error::RelativeWriteUnsupported`].
    pub fn set_bytes(&self, process: &dyn TargetProcess, bytes: &[u8]) -> Result<()> {
        let address = self.resolve(process)?;
        process.write_bytes(address, bytes)
    }
}

/// Fixed-width values that can be read and written through a chain.
pub trait Scalar: Copy {
    const SIZE: usize;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);

    /// Combination used by relative writes (arithmetic sum).
    fn combine(self, delta: Self) -> Self;
}

macro_rules! int_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                Self::from_le_bytes(bytes[..Self::SIZE].try_into().expect("sized read"))
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn combine(self, delta: Self) -> Self {
                self.wrapping_add(delta)
            }
        }
    )*};
}

macro_rules! float_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                Self::from_le_bytes(bytes[..Self::SIZE].try_into().expect("sized read"))
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn combine(self, delta: Self) -> Self {
                self + delta
            }
        }
    )*};
}

int_scalar!(i16, i32, i64, u64);
float_scalar!(f32, f64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockProcess;

    fn process_with_module() -> MockProcess {
        MockProcess::builder()
            .module("halo1.dll", 0xA000_0000, 0x1000)
            .build()
    }

    #[test]
    fn resolve_module_plus_offset() {
        let process = process_with_module();
        let chain = AddressChain::module_base("halo1.dll").offset(0x40);
        assert_eq!(chain.resolve(&process).unwrap(), 0xA000_0040);
    }

    #[test]
    fn resolve_missing_module_fails() {
        let process = process_with_module();
        let chain = AddressChain::module_base("other.dll");
        assert!(matches!(
            chain.resolve(&process),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn deref_follows_stored_pointer() {
        let process = process_with_module();
        // Store a pointer to 0xA0000200 at 0xA0000100.
        process
            .write_bytes(0xA000_0100, &0xA000_0200u64.to_le_bytes())
            .unwrap();
        process.write_bytes(0xA000_0200, &[0xAB]).unwrap();

        let chain = AddressChain::absolute(0xA000_0100).deref();
        assert_eq!(chain.resolve(&process).unwrap(), 0xA000_0200);
        assert_eq!(chain.get_bytes(&process, 1).unwrap(), vec![0xAB]);
    }

    #[test]
    fn deref_null_is_an_error_not_zero() {
        let process = process_with_module();
        let chain = AddressChain::absolute(0xA000_0100).deref();
        assert!(matches!(
            chain.resolve(&process),
            Err(Error::NullPointer { address: 0xA000_0100 })
        ));
    }

    #[test]
    fn offset_without_anchor_is_invalid() {
        let process = process_with_module();
        let chain = AddressChain {
            steps: vec![ChainStep::Offset(4)],
        };
        assert!(matches!(
            chain.resolve(&process),
            Err(Error::InvalidChain(_))
        ));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let process = process_with_module();
        let chain = AddressChain::module_base("halo1.dll").offset(0x9C);

        chain.set(&process, 0.75f32, WriteMode::Absolute).unwrap();
        assert_eq!(chain.get::<f32>(&process).unwrap(), 0.75);

        chain.set(&process, 0.25f32, WriteMode::Relative).unwrap();
        assert_eq!(chain.get::<f32>(&process).unwrap(), 1.0);
    }

    #[test]
    fn relative_write_sums_integers() {
        let process = process_with_module();
        let chain = AddressChain::module_base("halo1.dll").offset(0xC0);

        chain.set(&process, 5i16, WriteMode::Absolute).unwrap();
        chain.set(&process, -2i16, WriteMode::Relative).unwrap();
        assert_eq!(chain.get::<i16>(&process).unwrap(), 3);
    }
}
