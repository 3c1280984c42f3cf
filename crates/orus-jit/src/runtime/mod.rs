//! Contract types for the external collaborators the JIT backend talks to:
//! the boxed value representation, the typed-register window, the
//! to-string inline cache, and the slice of VM state the backend reads and
//! writes. None of these reimplement the real VM/GC — they model only the
//! operations this crate's specification depends on.

pub mod registers;
pub mod tostring_cache;
pub mod value;
pub mod vm;

pub use registers::{GuardFailure, TypedRegisterFile, WindowVersion};
pub use tostring_cache::ToStringCache;
pub use value::{Value, ValueKind};
pub use vm::{DeoptTrigger, RangeIterState, Vm};
