//! Windows primitives for the executable-memory arena, via `windows-sys`.
//!
//! Windows reports allocation/protection failures synchronously
//! (`VirtualAlloc`/`VirtualProtect` return codes), so unlike the Unix path
//! there is no SIGBUS/SIGSEGV-style probe here — a failing `VirtualAlloc`
//! or `VirtualProtect` during backend construction is itself the
//! diagnostic.

use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READ, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

pub fn page_size() -> usize {
    // Windows' allocation granularity is 64 KiB but page size for
    // VirtualProtect purposes is 4 KiB on all supported targets.
    4096
}

pub fn requires_write_protect_toggle() -> bool {
    false
}

pub fn map_rw(size: usize) -> Result<*mut u8, String> {
    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if ptr.is_null() {
        return Err(format!(
            "VirtualAlloc({size}) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(ptr as *mut u8)
}

pub fn unmap(ptr: *mut u8, _size: usize) -> Result<(), String> {
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(format!("VirtualFree failed: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

pub fn thread_write_protect(_enabled: bool) {}

pub fn protect_rw(ptr: *mut u8, size: usize) -> Result<(), String> {
    let mut old = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old) };
    if ok == 0 {
        return Err(format!(
            "VirtualProtect(RW) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

pub fn protect_rx(ptr: *mut u8, size: usize) -> Result<(), String> {
    let mut old = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old) };
    if ok == 0 {
        return Err(format!(
            "VirtualProtect(RX) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

pub fn flush_icache(ptr: *const u8, size: usize) {
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr as *const _, size);
    }
}

/// Windows has no equivalent probe; failures surface synchronously through
/// `VirtualAlloc`/`VirtualProtect` return codes instead.
pub fn probe_write_to_executable_page() -> Result<(), String> {
    let size = page_size();
    let ptr = map_rw(size)?;
    protect_rx(ptr, size)?;
    let result = protect_rw(ptr, size).map(|_| ());
    let _ = unmap(ptr, size);
    result
}
