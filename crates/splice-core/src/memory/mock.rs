//! In-memory stand-in for a target process, used by tests.
//!
//! Memory is a set of discrete regions; reads and writes that leave every
//! region fail the way a real cross-process read of an unmapped page does.
//! Cloning a `MockProcess` shares the underlying memory, so a test can keep
//! its own handle to inspect what the code under test did.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::memory::{ProcessLocator, TargetProcess};

/// Address where mock allocations start, far from any seeded region.
const ALLOC_BASE: u64 = 0x7000_0000_0000;

struct Region {
    base: u64,
    data: Vec<u8>,
}

struct Inner {
    regions: Vec<Region>,
    modules: HashMap<String, u64>,
    alive: bool,
    alloc_cursor: u64,
    allocations: Vec<(u64, usize)>,
    freed: Vec<u64>,
    fail_next_alloc: bool,
}

#[derive(Clone)]
pub struct MockProcess {
    inner: Arc<Mutex<Inner>>,
}

impl MockProcess {
    pub fn builder() -> MockProcessBuilder {
        MockProcessBuilder::default()
    }

    /// Simulate the process exiting; all reads and writes fail afterwards.
    pub fn kill(&self) {
        self.inner.lock().unwrap().alive = false;
    }

    /// Move a module to a new base address (simulates a reload/relaunch).
    pub fn relocate_module(&self, name: &str, new_base: u64) {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.modules.get(name).copied();
        if let Some(old) = old
            && let Some(region) = inner.regions.iter_mut().find(|r| r.base == old)
        {
            region.base = new_base;
        }
        inner.modules.insert(name.to_string(), new_base);
    }

    /// Make the next allocation fail, to exercise abort paths.
    pub fn fail_next_allocation(&self) {
        self.inner.lock().unwrap().fail_next_alloc = true;
    }

    /// Addresses and sizes handed out by `allocate`, in order.
    pub fn allocations(&self) -> Vec<(u64, usize)> {
        self.inner.lock().unwrap().allocations.clone()
    }

    /// Addresses released through `free`, in order.
    pub fn freed(&self) -> Vec<u64> {
        self.inner.lock().unwrap().freed.clone()
    }

    fn with_region<R>(
        &self,
        address: u64,
        len: usize,
        f: impl FnOnce(&mut Vec<u8>, usize) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.alive {
            return None;
        }
        let region = inner.regions.iter_mut().find(|r| {
            address >= r.base && address.saturating_add(len as u64) <= r.base + r.data.len() as u64
        })?;
        let offset = (address - region.base) as usize;
        Some(f(&mut region.data, offset))
    }
}

impl TargetProcess for MockProcess {
    fn is_alive(&self) -> bool {
        self.inner.lock().unwrap().alive
    }

    fn module_base(&self, module: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        if !inner.alive {
            return Err(Error::ModuleNotFound(module.to_string()));
        }
        inner
            .modules
            .get(module)
            .copied()
            .ok_or_else(|| Error::ModuleNotFound(module.to_string()))
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.with_region(address, len, |data, offset| data[offset..offset + len].to_vec())
            .ok_or_else(|| Error::MemoryReadFailed {
                address,
                message: "unmapped".to_string(),
            })
    }

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        self.with_region(address, bytes.len(), |data, offset| {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        })
        .ok_or_else(|| Error::MemoryWriteFailed {
            address,
            message: "unmapped".to_string(),
        })
    }

    fn allocate(&self, size: usize) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.alive || std::mem::take(&mut inner.fail_next_alloc) {
            return Err(Error::AllocationFailed {
                size,
                message: "mock allocation refused".to_string(),
            });
        }
        let base = inner.alloc_cursor;
        inner.alloc_cursor += (size as u64).next_multiple_of(0x1000);
        inner.regions.push(Region {
            base,
            data: vec![0u8; size],
        });
        inner.allocations.push((base, size));
        Ok(base)
    }

    fn free(&self, address: u64, _size: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.alive {
            return Err(Error::FreeFailed {
                address,
                message: "process has exited".to_string(),
            });
        }
        let Some(pos) = inner.regions.iter().position(|r| r.base == address) else {
            return Err(Error::FreeFailed {
                address,
                message: "not an allocated region".to_string(),
            });
        };
        inner.regions.remove(pos);
        inner.freed.push(address);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockProcessBuilder {
    regions: Vec<Region>,
    modules: HashMap<String, u64>,
}

impl MockProcessBuilder {
    /// Seed a readable/writable region with the given contents.
    pub fn region(mut self, base: u64, data: Vec<u8>) -> Self {
        self.regions.push(Region { base, data });
        self
    }

    /// Register a module and seed a region of `size` zero bytes at its base.
    pub fn module(mut self, name: &str, base: u64, size: usize) -> Self {
        self.modules.insert(name.to_string(), base);
        self.regions.push(Region {
            base,
            data: vec![0u8; size],
        });
        self
    }

    pub fn build(self) -> MockProcess {
        MockProcess {
            inner: Arc::new(Mutex::new(Inner {
                regions: self.regions,
                modules: self.modules,
                alive: true,
                alloc_cursor: ALLOC_BASE,
                allocations: Vec::new(),
                freed: Vec::new(),
                fail_next_alloc: false,
            })),
        }
    }
}

/// Locator that hands out clones of one mock process, or nothing.
pub struct MockLocator {
    process: Mutex<Option<MockProcess>>,
}

impl MockLocator {
    pub fn new(process: Option<MockProcess>) -> Self {
        Self {
            process: Mutex::new(process),
        }
    }

    /// Make the target "appear" (subsequent locates succeed).
    pub fn set(&self, process: MockProcess) {
        *self.process.lock().unwrap() = Some(process);
    }
}

impl ProcessLocator for MockLocator {
    fn locate(&self, _process_name: &str) -> Result<Option<Box<dyn TargetProcess>>> {
        let guard = self.process.lock().unwrap();
        Ok(guard
            .as_ref()
            .filter(|p| p.is_alive())
            .map(|p| Box::new(p.clone()) as Box<dyn TargetProcess>))
    }
}
