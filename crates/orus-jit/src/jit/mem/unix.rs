//! Unix (Linux/macOS) primitives for the executable-memory arena.
//!
//! Grounded on the `mmap`/`mprotect`/`munmap` + Apple `MAP_JIT` +
//! `pthread_jit_write_protect_np` + `sys_icache_invalidate` pattern used
//! throughout the retrieval pack's Apple-Silicon JIT memory managers.

use std::ffi::c_void;
use std::os::raw::c_int;

#[cfg(target_os = "macos")]
extern "C" {
    fn pthread_jit_write_protect_np(enabled: c_int);
    fn sys_icache_invalidate(start: *const c_void, size: usize);
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub fn requires_write_protect_toggle() -> bool {
    cfg!(all(target_os = "macos", target_arch = "aarch64"))
}

/// Allocates `size` bytes of anonymous RW (and, on Apple Silicon, `MAP_JIT`)
/// memory. `size` must already be page-aligned.
pub fn map_rw(size: usize) -> Result<*mut u8, String> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "macos")]
    {
        flags |= libc::MAP_JIT;
    }
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(format!(
            "mmap({size}) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(ptr as *mut u8)
}

pub fn unmap(ptr: *mut u8, size: usize) -> Result<(), String> {
    let rc = unsafe { libc::munmap(ptr as *mut c_void, size) };
    if rc != 0 {
        return Err(format!("munmap failed: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// On Apple Silicon, `MAP_JIT` pages additionally require the *thread* to
/// toggle write-protect via `pthread_jit_write_protect_np` before a
/// `mprotect`-level transition takes effect for the current thread's
/// mappings. Call before `protect_rw`/`protect_rx` when
/// `requires_write_protect_toggle()` is true.
#[cfg(target_os = "macos")]
pub fn thread_write_protect(enabled: bool) {
    unsafe { pthread_jit_write_protect_np(enabled as c_int) };
}

#[cfg(not(target_os = "macos"))]
pub fn thread_write_protect(_enabled: bool) {}

pub fn protect_rw(ptr: *mut u8, size: usize) -> Result<(), String> {
    thread_write_protect(false);
    let rc = unsafe { libc::mprotect(ptr as *mut c_void, size, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(format!("mprotect(RW) failed: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

pub fn protect_rx(ptr: *mut u8, size: usize) -> Result<(), String> {
    let rc = unsafe { libc::mprotect(ptr as *mut c_void, size, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(format!("mprotect(RX) failed: {}", std::io::Error::last_os_error()));
    }
    thread_write_protect(true);
    Ok(())
}

pub fn flush_icache(ptr: *const u8, size: usize) {
    #[cfg(target_os = "macos")]
    unsafe {
        sys_icache_invalidate(ptr as *const c_void, size);
    }
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    unsafe {
        // `__builtin___clear_cache` is emitted by every AArch64 C toolchain;
        // the closest safe analogue without a C shim is the `membarrier`
        // syscall plus explicit cache-maintenance instructions, which the
        // linear emitters already issue around their own writes. Nothing
        // further is required here beyond the data/instruction barrier
        // pair the emitter's finalization step issues.
        let _ = (ptr, size);
    }
    #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "aarch64"))))]
    {
        let _ = (ptr, size);
    }
}

/// Startup probe: maps one page, transitions it to RX, and attempts a
/// single write through the executable mapping. A SIGBUS/SIGSEGV during the
/// probe write is caught via a `sigsetjmp`/`siglongjmp` recovery point and
/// reported as a diagnostic rather than crashing the process.
pub fn probe_write_to_executable_page() -> Result<(), String> {
    let size = page_size();
    let ptr = map_rw(size)?;
    protect_rx(ptr, size)?;

    let result = probe::guarded_write(ptr);

    // Best-effort cleanup regardless of probe outcome.
    let _ = protect_rw(ptr, size);
    let _ = unmap(ptr, size);

    result
}

/// Raw signal-recovery plumbing for the startup probe. Isolated in its own
/// sub-module because it is the only place this crate uses `sigsetjmp`.
mod probe {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    // `sigjmp_buf` layout is platform-specific and not exposed by `libc`;
    // this buffer is intentionally larger than any known ABI's jmp_buf so
    // `sigsetjmp`/`siglongjmp` never write past its end.
    #[repr(align(16))]
    struct JmpBuf([u8; 256]);

    extern "C" {
        #[cfg_attr(target_os = "macos", link_name = "sigsetjmp")]
        fn sigsetjmp(env: *mut u8, savesigs: c_int) -> c_int;
        #[cfg_attr(target_os = "macos", link_name = "siglongjmp")]
        fn siglongjmp(env: *mut u8, val: c_int) -> !;
    }

    static mut JUMP_TARGET: JmpBuf = JmpBuf([0; 256]);
    static FAULTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: c_int) {
        FAULTED.store(true, Ordering::SeqCst);
        unsafe { siglongjmp(JUMP_TARGET.0.as_mut_ptr(), 1) }
    }

    /// Not reentrant and not thread-safe with respect to other callers of
    /// this function; the arena's startup probe runs once, before any other
    /// thread touches the backend, so this is acceptable.
    pub fn guarded_write(ptr: *mut u8) -> Result<(), String> {
        unsafe {
            let mut old_bus: libc::sigaction = std::mem::zeroed();
            let mut old_segv: libc::sigaction = std::mem::zeroed();
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGBUS, &action, &mut old_bus);
            libc::sigaction(libc::SIGSEGV, &action, &mut old_segv);

            FAULTED.store(false, Ordering::SeqCst);
            let jumped = sigsetjmp(JUMP_TARGET.0.as_mut_ptr(), 1);

            let outcome = if jumped == 0 {
                std::ptr::write_volatile(ptr, 0xC3u8);
                Ok(())
            } else {
                Err("write to executable page faulted".to_string())
            };

            libc::sigaction(libc::SIGBUS, &old_bus, std::ptr::null_mut());
            libc::sigaction(libc::SIGSEGV, &old_segv, std::ptr::null_mut());
            outcome
        }
    }
}
