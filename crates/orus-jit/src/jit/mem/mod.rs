//! The executable-memory arena (`spec.md` §4.1).
//!
//! Supplies page-aligned executable memory with a uniform W^X protocol
//! across Linux, macOS and Windows. All region-list mutations are
//! serialized by a single mutex, matching the concurrency model's
//! requirement that W^X transitions are process-global.

#[cfg(unix)]
#[path = "unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "windows.rs"]
mod platform;

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ArenaError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("protection transition failed: {0}")]
    ProtectionFailed(String),
    #[error("pointer {0:#x} is not a registered region")]
    UnknownRegion(usize),
}

fn round_up_to_page(size: usize) -> usize {
    let page = platform::page_size();
    (size + page - 1) & !(page - 1)
}

/// Tracks one mapped region: its extent, whether it came from `mmap`-family
/// allocation, whether it needs the Apple per-thread write-protect toggle,
/// and its current protection state.
#[derive(Debug)]
struct ExecutableRegion {
    base: *mut u8,
    size: usize,
    requires_write_protect: bool,
    currently_executable: bool,
}

// SAFETY: regions are only mutated while holding the arena's mutex; the
// raw pointer itself is never dereferenced from this module except through
// the platform shims, which accept only the extent recorded here.
unsafe impl Send for ExecutableRegion {}

struct ArenaState {
    regions: Vec<ExecutableRegion>,
}

impl ArenaState {
    fn find_mut(&mut self, ptr: *mut u8) -> Option<&mut ExecutableRegion> {
        self.regions.iter_mut().find(|r| r.base == ptr)
    }
}

/// The executable-memory arena. One instance is owned by the backend for
/// its lifetime.
pub struct Arena {
    state: Mutex<ArenaState>,
    available: bool,
    diagnostic: Option<String>,
}

impl Arena {
    /// Runs the startup probe and constructs an arena. The arena is always
    /// returned (never `Err`): an unavailable backend still needs an arena
    /// object to report its diagnostic through `availability()`.
    pub fn new() -> Self {
        let (available, diagnostic) = match platform::probe_write_to_executable_page() {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Arena {
            state: Mutex::new(ArenaState { regions: Vec::new() }),
            available,
            diagnostic,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Allocates `size` bytes (rounded up to a page) as RW memory and
    /// registers the region. Returns the base pointer and the rounded-up
    /// capacity.
    pub fn alloc_executable(&self, size: usize) -> Result<(*mut u8, usize), ArenaError> {
        let capacity = round_up_to_page(size.max(1));
        let ptr = platform::map_rw(capacity).map_err(ArenaError::OutOfMemory)?;
        let mut state = self.state.lock();
        state.regions.push(ExecutableRegion {
            base: ptr,
            size: capacity,
            requires_write_protect: platform::requires_write_protect_toggle(),
            currently_executable: false,
        });
        Ok((ptr, capacity))
    }

    /// Transitions every registered region to RX (`enable = true`) or RW
    /// (`enable = false`). On Apple Silicon, also toggles the thread's JIT
    /// write-protect state when any region requires it. On failure, leaves
    /// state as the platform reports it (individual regions may be left RW)
    /// and surfaces the first error.
    pub fn set_write_protection(&self, enable: bool) -> Result<(), ArenaError> {
        let mut state = self.state.lock();
        let needs_toggle = state.regions.iter().any(|r| r.requires_write_protect);
        if needs_toggle && !enable {
            platform::thread_write_protect(false);
        }
        for region in state.regions.iter_mut() {
            let result = if enable {
                platform::protect_rx(region.base, region.size)
            } else {
                platform::protect_rw(region.base, region.size)
            };
            result.map_err(ArenaError::ProtectionFailed)?;
            region.currently_executable = enable;
        }
        Ok(())
    }

    /// Transitions a single region to RX and flushes the instruction cache
    /// for it. The common "publish" step after an emitter finishes writing.
    pub fn make_executable(&self, ptr: *mut u8, size: usize) -> Result<(), ArenaError> {
        let mut state = self.state.lock();
        let region = state
            .find_mut(ptr)
            .ok_or(ArenaError::UnknownRegion(ptr as usize))?;
        platform::protect_rx(region.base, region.size).map_err(ArenaError::ProtectionFailed)?;
        region.currently_executable = true;
        drop(state);
        self.flush_icache(ptr, size);
        Ok(())
    }

    pub fn flush_icache(&self, ptr: *const u8, size: usize) {
        platform::flush_icache(ptr, size);
    }

    /// Unregisters and releases a region previously returned by
    /// `alloc_executable`.
    pub fn release_executable(&self, ptr: *mut u8, capacity: usize) -> Result<(), ArenaError> {
        let mut state = self.state.lock();
        let idx = state
            .regions
            .iter()
            .position(|r| r.base == ptr)
            .ok_or(ArenaError::UnknownRegion(ptr as usize))?;
        state.regions.remove(idx);
        drop(state);
        platform::unmap(ptr, capacity).map_err(ArenaError::OutOfMemory)
    }

    #[cfg(test)]
    fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all mutable region state is behind `Mutex`; `available` and
// `diagnostic` are set once at construction and never mutated afterward.
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_arena_probes_successfully_on_this_host() {
        let arena = Arena::new();
        assert!(arena.is_available(), "diagnostic: {:?}", arena.diagnostic());
    }

    #[test]
    fn alloc_then_release_round_trips() {
        let arena = Arena::new();
        let (ptr, capacity) = arena.alloc_executable(64).expect("alloc");
        assert!(capacity >= 64);
        assert_eq!(arena.region_count(), 1);
        arena.release_executable(ptr, capacity).expect("release");
        assert_eq!(arena.region_count(), 0);
    }

    #[test]
    fn make_executable_on_unknown_pointer_errors() {
        let arena = Arena::new();
        let bogus = 0x1000 as *mut u8;
        assert_eq!(
            arena.make_executable(bogus, 8),
            Err(ArenaError::UnknownRegion(bogus as usize))
        );
    }

    #[test]
    fn write_then_execute_round_trip() {
        let arena = Arena::new();
        let (ptr, capacity) = arena.alloc_executable(64).expect("alloc");
        // RW by default after alloc; write a trivial function body.
        #[cfg(all(unix, target_arch = "x86_64"))]
        let code: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]; // mov eax,42; ret
        #[cfg(all(unix, target_arch = "aarch64"))]
        let code: &[u8] = &[0x40, 0x05, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6]; // mov w0,#42; ret
        #[cfg(not(unix))]
        let code: &[u8] = &[];

        if code.is_empty() {
            return;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
        arena.make_executable(ptr, code.len()).expect("make_executable");

        #[cfg(unix)]
        unsafe {
            let f: extern "C" fn() -> i32 = std::mem::transmute(ptr);
            assert_eq!(f(), 42);
        }

        arena.set_write_protection(false).expect("back to rw");
        arena.release_executable(ptr, capacity).expect("release");
    }
}
