//! The minimal slice of VM state the JIT backend reads and writes.
//!
//! The real VM (scheduler, classes, modules, reflection, GC) is an external
//! collaborator; this struct carries only the fields the backend's contract
//! in `spec.md` §3/§4 actually names.

use super::registers::TypedRegisterFile;
use super::tostring_cache::ToStringCache;
use super::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ptr::NonNull;

/// `(function_index, loop_index, generation)`, written into
/// `Vm::jit_pending_trigger` on bailout and consumed by the VM between
/// bytecode instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptTrigger {
    pub function_index: u32,
    pub loop_index: u32,
    pub generation: u32,
}

/// Iteration progress for a `Range`-derived iterator, keyed by whichever
/// register currently holds the range or iterator object. The real VM's
/// iterator protocol covers arbitrary iterables (arrays, enums, generators
/// the external object model owns); this reference interpreter only has
/// concrete bounds to drive for the one case `Range` gives it, so that's
/// the only case it tracks real per-iterator state for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeIterState {
    pub current: i32,
    pub end: i32,
}

pub struct Vm {
    pub boxed_registers: Vec<Value>,
    pub typed_registers: TypedRegisterFile,
    pub tostring_cache: ToStringCache,

    /// Set by a helper when a runtime error (allocation failure, assertion
    /// failure, user exception) occurs; checked by the dispatcher on return
    /// from a native entry.
    pub last_error: Option<String>,

    pub jit_pending_trigger: Option<DeoptTrigger>,
    pub jit_pending_invalidate: bool,
    pub jit_native_slow_path_pending: bool,
    pub jit_native_type_deopts: u64,

    /// Opaque pointer to the top of the native-frame stack (a
    /// `jit::runtime::frame::NativeFrame`, type-erased here so this contract
    /// module does not depend on the JIT implementation). `None` when no
    /// native frame is active.
    pub jit_native_frame_top: Option<NonNull<u8>>,

    /// Loops that have recently bailed out and should not be immediately
    /// recompiled, keyed by `loop_index`.
    pub loop_blocklist: FxHashSet<u32>,

    /// Counts every `Backend::enter` call, native or interpreted, observed
    /// by `spec.md` §8's end-to-end scenarios.
    pub dispatch_count: u64,

    /// When true, the next array/enum/iterator-constructing helper op
    /// simulates its external allocator requesting a GC pause: it sets
    /// `jit_native_slow_path_pending` and consumes this flag. The real
    /// allocator this crate does not reimplement would set
    /// `jit_native_slow_path_pending` directly from native code; this flag
    /// exists only so tests can arrange for that to happen from inside the
    /// reference interpreter's own allocating ops instead of presetting
    /// `jit_native_slow_path_pending` before entry.
    pub jit_alloc_triggers_gc: bool,

    /// Per-register `Range` iteration state; see [`RangeIterState`].
    pub jit_range_iterators: FxHashMap<u32, RangeIterState>,
}

impl Vm {
    pub fn new(register_count: usize) -> Self {
        Vm {
            boxed_registers: vec![Value::Boxed; register_count],
            typed_registers: TypedRegisterFile::new(register_count),
            tostring_cache: ToStringCache::new(),
            last_error: None,
            jit_pending_trigger: None,
            jit_pending_invalidate: false,
            jit_native_slow_path_pending: false,
            jit_native_type_deopts: 0,
            jit_native_frame_top: None,
            loop_blocklist: FxHashSet::default(),
            dispatch_count: 0,
            jit_alloc_triggers_gc: false,
            jit_range_iterators: FxHashMap::default(),
        }
    }

    pub fn set_register(&mut self, reg: u32, value: Value) {
        let idx = reg as usize;
        if idx >= self.boxed_registers.len() {
            self.boxed_registers.resize(idx + 1, Value::Boxed);
        }
        self.boxed_registers[idx] = value;
    }

    pub fn register(&self, reg: u32) -> Value {
        self.boxed_registers
            .get(reg as usize)
            .cloned()
            .unwrap_or(Value::Boxed)
    }

    pub fn is_loop_blocked(&self, loop_index: u32) -> bool {
        self.loop_blocklist.contains(&loop_index)
    }
}
