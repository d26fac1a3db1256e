#![forbid(unsafe_code)]
//! vdisk public API facade.
//!
//! Re-exports core functionality from `vdisk-core` through a stable external
//! interface. Front ends (the CLI, report renderers) depend on this crate
//! only.

pub use vdisk_core::*;
