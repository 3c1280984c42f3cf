//! The adaptive native-code JIT backend (`spec.md` §1-§2).
//!
//! Submodules mirror the component breakdown: [`mem`] is the executable
//! memory arena, [`registry`] the native-block registry, [`ir`] the flat
//! IR this backend compiles and interprets, [`interp`] its reference
//! interpreter, [`backend`] the per-target linear emitters and fallback
//! strategies, [`runtime`] the native-frame/safepoint/helper protocol
//! native code calls back into, [`tier`] the promotion/demotion
//! controller, [`debug`] parity and diagnostic accounting, and [`engine`]
//! the external-facing `Backend` type that wires all of the above
//! together behind the VM's `{ enter, invalidate, flush }` contract.

pub mod backend;
pub mod debug;
pub mod engine;
pub mod interp;
pub mod ir;
pub mod mem;
pub mod registry;
pub mod runtime;
pub mod tier;

pub use engine::{
    Availability, AvailabilityStatus, Backend, BackendConfig, BackendVtable, JitError, JITEntry,
    Target,
};
