//! JIT-internal runtime collaborators: the native-frame protocol, the
//! safepoint poll, and the helper functions native code calls for slow
//! paths it cannot inline.
//!
//! Distinct from the crate-level [`crate::runtime`] module, which only
//! models the contract types of the external VM this backend serves.

pub mod frame;
pub mod helpers;
pub mod safepoint;

pub use frame::NativeFrame;
