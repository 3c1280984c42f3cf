//! The DynASM-style action-buffer emitter (`spec.md` §4.4, §6).
//!
//! An alternative to the hand-rolled byte encoders in [`super::x86_64`] /
//! [`super::aarch64`]: instead of pushing bytes through a [`super::CodeBuffer`]
//! by hand, this strategy builds the same "call back into the IR
//! interpreter" trampoline [`super::helper_stub`] emits, but through
//! `dynasmrt`'s assembler and its `dynasm!` macro. Selected at runtime via
//! `ORUS_JIT_FORCE_DYNASM`, independent of whether this crate was built
//! with the `force-dynasm` Cargo feature — without that feature the
//! `dynasmrt`/`dynasm` crates aren't linked in at all, so this module falls
//! back to [`super::helper_stub::emit`] directly, which produces the exact
//! same machine code by hand.

use super::CodegenError;
use crate::jit::registry::OwnedIrProgram;

/// Builds the vm-pointer-preserving trampoline into
/// [`super::helper_stub::run_via_interpreter`] via whichever mechanism is
/// actually linked in.
pub fn emit(program_ptr: *const OwnedIrProgram) -> Result<Vec<u8>, CodegenError> {
    #[cfg(feature = "force-dynasm")]
    {
        emit_via_dynasmrt(program_ptr)
    }
    #[cfg(not(feature = "force-dynasm"))]
    {
        super::helper_stub::emit(program_ptr)
    }
}

#[cfg(feature = "force-dynasm")]
fn emit_via_dynasmrt(program_ptr: *const OwnedIrProgram) -> Result<Vec<u8>, CodegenError> {
    use dynasmrt::{dynasm, DynasmApi};

    let program_ptr = program_ptr as i64;
    let trampoline_ptr = super::helper_stub::run_via_interpreter as usize as i64;

    #[cfg(target_arch = "x86_64")]
    {
        let mut ops = dynasmrt::x64::Assembler::new()
            .map_err(|e| CodegenError::ArenaUnavailable(e.to_string()))?;
        let start = ops.offset();
        dynasm!(ops
            ; .arch x64
            ; mov rsi, QWORD program_ptr
            ; mov rax, QWORD trampoline_ptr
            ; jmp rax
        );
        let buf = ops
            .finalize()
            .map_err(|_| CodegenError::BufferOverflow)?;
        Ok(buf[start.0..].to_vec())
    }
    #[cfg(target_arch = "aarch64")]
    {
        let mut ops = dynasmrt::aarch64::Assembler::new()
            .map_err(|e| CodegenError::ArenaUnavailable(e.to_string()))?;
        let start = ops.offset();
        dynasm!(ops
            ; .arch aarch64
            ; movz x1, (program_ptr & 0xFFFF) as u32
            ; movk x1, ((program_ptr >> 16) & 0xFFFF) as u32, lsl 16
            ; movk x1, ((program_ptr >> 32) & 0xFFFF) as u32, lsl 32
            ; movk x1, ((program_ptr >> 48) & 0xFFFF) as u32, lsl 48
            ; movz x9, (trampoline_ptr & 0xFFFF) as u32
            ; movk x9, ((trampoline_ptr >> 16) & 0xFFFF) as u32, lsl 16
            ; movk x9, ((trampoline_ptr >> 32) & 0xFFFF) as u32, lsl 32
            ; movk x9, ((trampoline_ptr >> 48) & 0xFFFF) as u32, lsl 48
            ; br x9
        );
        let buf = ops
            .finalize()
            .map_err(|_| CodegenError::BufferOverflow)?;
        Ok(buf[start.0..].to_vec())
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (program_ptr, trampoline_ptr);
        Err(CodegenError::PlatformUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_produces_a_runnable_trampoline() {
        let dummy = std::ptr::null::<OwnedIrProgram>();
        let bytes = emit(dummy);
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        assert!(!bytes.unwrap().is_empty());
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        assert!(bytes.is_err());
    }
}
