//! Windows implementation of the process access traits, built on
//! OpenProcess / ReadProcessMemory / WriteProcessMemory / VirtualAllocEx
//! and the Toolhelp snapshot API.

use std::ffi::c_void;

use tracing::debug;
use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAllocEx, VirtualFreeEx,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::error::{Error, Result};
use crate::memory::{ProcessLocator, TargetProcess};

/// An open handle to a running process.
pub struct WindowsProcess {
    pid: u32,
    handle: HANDLE,
}

// HANDLE is a plain kernel handle value; the owning struct may move
// between threads as long as it is not shared without synchronization.
unsafe impl Send for WindowsProcess {}

impl WindowsProcess {
    /// Open a process by id with the rights the engine needs
    /// (query, read, write, allocate).
    pub fn open(pid: u32) -> Result<Self> {
        // SAFETY: OpenProcess has no memory-safety preconditions.
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION | PROCESS_VM_READ | PROCESS_VM_WRITE
                    | PROCESS_VM_OPERATION,
                false,
                pid,
            )
        }
        .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;

        Ok(Self { pid, handle })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by OpenProcess and is closed once.
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl TargetProcess for WindowsProcess {
    fn is_alive(&self) -> bool {
        let mut code = 0u32;
        // SAFETY: querying the exit code of an open handle.
        match unsafe { GetExitCodeProcess(self.handle, &mut code) } {
            Ok(()) => code == STILL_ACTIVE.0 as u32,
            Err(_) => false,
        }
    }

    fn module_base(&self, module: &str) -> Result<u64> {
        let snapshot =
            // SAFETY: snapshot handle is closed below on every path.
            unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid) }
                .map_err(|e| Error::ModuleNotFound(format!("{module}: {e}")))?;

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        let mut base = None;
        // SAFETY: entry.dwSize is initialized; the snapshot handle is valid.
        let mut more = unsafe { Module32FirstW(snapshot, &mut entry) }.is_ok();
        while more {
            if utf16_name(&entry.szModule).eq_ignore_ascii_case(module) {
                base = Some(entry.modBaseAddr as u64);
                break;
            }
            // SAFETY: same as above.
            more = unsafe { Module32NextW(snapshot, &mut entry) }.is_ok();
        }

        // SAFETY: closing the snapshot handle exactly once.
        unsafe {
            let _ = CloseHandle(snapshot);
        }

        base.ok_or_else(|| Error::ModuleNotFound(module.to_string()))
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut read = 0usize;
        // SAFETY: the buffer outlives the call and is at least `len` bytes.
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                len,
                Some(&mut read),
            )
        }
        .map_err(|e| Error::MemoryReadFailed {
            address,
            message: e.to_string(),
        })?;

        if read != len {
            return Err(Error::MemoryReadFailed {
                address,
                message: format!("short read: {read} of {len} bytes"),
            });
        }

        Ok(buffer)
    }

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let mut written = 0usize;
        // SAFETY: the source slice is valid for the whole call.
        unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| Error::MemoryWriteFailed {
            address,
            message: e.to_string(),
        })?;

        if written != bytes.len() {
            return Err(Error::MemoryWriteFailed {
                address,
                message: format!("short write: {written} of {} bytes", bytes.len()),
            });
        }

        Ok(())
    }

    fn allocate(&self, size: usize) -> Result<u64> {
        // SAFETY: a null preferred address lets the kernel pick the region.
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };

        if address.is_null() {
            return Err(Error::AllocationFailed {
                size,
                message: windows::core::Error::from_win32().to_string(),
            });
        }

        debug!("Allocated {size} byte cave at {:#x}", address as u64);
        Ok(address as u64)
    }

    fn free(&self, address: u64, _size: usize) -> Result<()> {
        // MEM_RELEASE requires a zero size; the region is released whole.
        // SAFETY: the address came from VirtualAllocEx on the same handle.
        unsafe { VirtualFreeEx(self.handle, address as *mut c_void, 0, MEM_RELEASE) }.map_err(
            |e| Error::FreeFailed {
                address,
                message: e.to_string(),
            },
        )
    }
}

/// Locates processes through a Toolhelp process snapshot.
pub struct WindowsLocator;

impl ProcessLocator for WindowsLocator {
    fn locate(&self, process_name: &str) -> Result<Option<Box<dyn TargetProcess>>> {
        let Some(pid) = find_pid(process_name)? else {
            return Ok(None);
        };
        let process = WindowsProcess::open(pid)?;
        debug!("Opened {process_name} (pid {pid})");
        Ok(Some(Box::new(process)))
    }
}

fn find_pid(process_name: &str) -> Result<Option<u32>> {
    // The snapshot lists executables with their extension; accept the name
    // with or without ".exe".
    let with_exe = format!("{process_name}.exe");

    // SAFETY: snapshot handle is closed below on every path.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| Error::ProcessNotFound(format!("{process_name}: {e}")))?;

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut pid = None;
    // SAFETY: entry.dwSize is initialized; the snapshot handle is valid.
    let mut more = unsafe { Process32FirstW(snapshot, &mut entry) }.is_ok();
    while more {
        let name = utf16_name(&entry.szExeFile);
        if name.eq_ignore_ascii_case(process_name) || name.eq_ignore_ascii_case(&with_exe) {
            pid = Some(entry.th32ProcessID);
            break;
        }
        // SAFETY: same as above.
        more = unsafe { Process32NextW(snapshot, &mut entry) }.is_ok();
    }

    // SAFETY: closing the snapshot handle exactly once.
    unsafe {
        let _ = CloseHandle(snapshot);
    }

    Ok(pid)
}

fn utf16_name(raw: &[u16]) -> String {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..end])
}
