//! Safepoint protocol (`spec.md` §4.5 / §5).
//!
//! Both emitted native code and the IR interpreter poll a safepoint before
//! starting a new loop iteration. Polling flushes the typed-register window
//! back into the boxed register file — the only form the VM's GC and
//! foreign-call contract can observe — and reports whether the caller
//! should stop running compiled/interpreted code and fall back to the
//! bytecode interpreter.

use crate::runtime::Vm;

/// Flushes the typed-register window and returns `true` if execution should
/// bail out to the bytecode interpreter: either a slow-path request is
/// pending (consumed here), a deopt trigger is already queued, or a runtime
/// error is pending (both left in place for the dispatcher to read and
/// unwind).
pub fn poll(vm: &mut Vm) -> bool {
    let mut boxed = std::mem::take(&mut vm.boxed_registers);
    vm.typed_registers.flush_all(&mut boxed);
    vm.boxed_registers = boxed;

    if vm.jit_native_slow_path_pending {
        vm.jit_native_slow_path_pending = false;
        return true;
    }
    vm.jit_pending_trigger.is_some() || vm.last_error.is_some()
}

/// `extern "C"` wrapper around [`poll`] for native code to call directly at
/// loop back-edges. Returns `true` when the caller should stop and bail out
/// to the interpreter.
///
/// # Safety
/// `vm` must point to a valid, exclusively-borrowed [`Vm`].
pub unsafe extern "C" fn poll_native(vm: *mut Vm) -> bool {
    poll(&mut *vm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DeoptTrigger, Value};

    #[test]
    fn poll_flushes_dirty_typed_registers() {
        let mut vm = Vm::new(2);
        vm.typed_registers.write_i32(0, 9);
        poll(&mut vm);
        assert_eq!(vm.register(0), Value::I32(9));
    }

    #[test]
    fn poll_reports_and_clears_pending_slow_path() {
        let mut vm = Vm::new(1);
        vm.jit_native_slow_path_pending = true;
        assert!(poll(&mut vm));
        assert!(!vm.jit_native_slow_path_pending);
    }

    #[test]
    fn poll_reports_pending_deopt_trigger_without_clearing_it() {
        let mut vm = Vm::new(1);
        vm.jit_pending_trigger = Some(DeoptTrigger {
            function_index: 0,
            loop_index: 0,
            generation: 0,
        });
        assert!(poll(&mut vm));
        assert!(vm.jit_pending_trigger.is_some());
    }

    #[test]
    fn poll_reports_pending_runtime_error_without_clearing_it() {
        let mut vm = Vm::new(1);
        vm.last_error = Some("assertion failed".to_string());
        assert!(poll(&mut vm));
        assert!(vm.last_error.is_some());
    }

    #[test]
    fn poll_with_nothing_pending_reports_false() {
        let mut vm = Vm::new(1);
        assert!(!poll(&mut vm));
    }
}
