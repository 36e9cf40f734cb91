#![forbid(unsafe_code)]
//! Virtual block device public API facade.
//!
//! Re-exports the engine from `vbd-core` through a stable external
//! interface. This is the crate that downstream consumers (the CLI and
//! embedding applications) depend on.

pub use vbd_core::*;
