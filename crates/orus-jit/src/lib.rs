//! Orus JIT Backend
//!
//! The adaptive native-code JIT backend for the Orus register-based
//! bytecode VM: an executable-memory arena, a native-block registry, a
//! flat IR with a reference interpreter, per-target linear emitters
//! (x86-64, AArch64) with a DynASM-style and helper-stub fallback, a
//! tier/deopt controller, and the runtime protocol (native frames,
//! safepoints, guard helpers) native code calls back into.
//!
//! # Example
//!
//! ```rust,ignore
//! use orus_jit::jit::{Backend, BackendConfig};
//!
//! let mut backend = Backend::create(BackendConfig::from_env()).expect("host supported");
//! let entry = backend.compile_noop().unwrap();
//! let mut vm = orus_jit::runtime::Vm::new(8);
//! assert!(backend.enter(&mut vm, &entry));
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::needless_return)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

/// Bytecode module: the minimal chunk/constant-pool stand-in this backend
/// compiles against.
pub mod bytecode;

/// JIT module: arena, registry, IR, interpreter, emitters, runtime
/// protocol, tier controller, diagnostics, and the external `Backend`
/// facade.
pub mod jit;

/// Runtime module: contract types for the external VM this backend serves
/// (boxed values, the typed-register window, the to-string cache).
pub mod runtime;

pub use bytecode::{Chunk, Constant, ModuleError};
pub use jit::{Backend, BackendConfig, JITEntry, JitError};
