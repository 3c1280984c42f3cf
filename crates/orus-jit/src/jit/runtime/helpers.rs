//! Runtime helper functions native code calls into for slow paths it cannot
//! inline (`spec.md` §4.5).
//!
//! Each helper takes a raw `*mut Vm` — emitted code only ever holds a
//! pointer, never a borrow — and returns `bool`: `true` on success, `false`
//! to signal the caller should treat this as a guard failure and route to
//! `tier::bailout_and_deopt`. This mirrors the call sequence a linear
//! emitter produces: load the helper's address into a scratch register,
//! call it, test the return register for zero.
//!
//! The linear emitters only ever lower the typed-`I32` fast path (`spec.md`
//! §4.4's narrower scope for direct native codegen), so this module carries
//! only the two helpers that path actually calls; string ops, `I64`,
//! `Convert`, and calls fall through the compile cascade to the helper-stub
//! strategy, which runs the whole program through the reference interpreter
//! instead of calling into helpers piecemeal.

use crate::runtime::Vm;

/// Loads typed register `reg` as `i32` into `*out`, reporting `false` on a
/// kind guard miss instead of trusting whatever bits happen to be there.
/// The linear emitters use this to bring loop-carried values into physical
/// registers at a native block's entry, since native code never reaches
/// into [`crate::runtime::TypedRegisterFile`]'s backing storage directly.
///
/// # Safety
/// `vm` and `out` must both be valid for the duration of the call.
pub unsafe extern "C" fn try_load_i32(vm: *mut Vm, reg: u32, out: *mut i32) -> bool {
    match (*vm).typed_registers.read_i32(reg) {
        Ok(v) => {
            *out = v;
            true
        }
        Err(_) => false,
    }
}

/// Writes an `i32` back into typed register `reg` at a native block's exit.
///
/// # Safety
/// `vm` must be valid for the duration of the call.
pub unsafe extern "C" fn store_i32(vm: *mut Vm, reg: u32, value: i32) {
    (*vm).typed_registers.write_i32(reg, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Value;

    #[test]
    fn try_load_i32_round_trips_a_written_value() {
        let mut vm = Vm::new(2);
        vm.typed_registers.write_i32(0, 42);
        let mut out = 0i32;
        unsafe {
            assert!(try_load_i32(&mut vm, 0, &mut out));
        }
        assert_eq!(out, 42);
    }

    #[test]
    fn try_load_i32_reports_guard_miss_on_kind_mismatch() {
        let mut vm = Vm::new(2);
        vm.set_register(0, Value::I64(1));
        let mut out = 0i32;
        unsafe {
            assert!(!try_load_i32(&mut vm, 0, &mut out));
        }
    }

    #[test]
    fn store_i32_writes_through_to_the_typed_register_file() {
        let mut vm = Vm::new(2);
        unsafe {
            store_i32(&mut vm, 1, 7);
        }
        assert_eq!(vm.typed_registers.read_i32(1), Ok(7));
    }
}
