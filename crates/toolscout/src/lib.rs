//! Facade crate for toolscout.
//!
//! Re-exports the shared types and traits from `toolscout-core`.

pub use toolscout_core::*;
