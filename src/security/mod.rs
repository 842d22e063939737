//! Privilege-boundary checks for the helper.
//!
//! See [`boundary`] for the module overview, threat model,
//! and public API.

mod allowlist;
mod audit;
mod boundary;
mod command_gate;
mod deleter;
mod errors;
mod signature;

// The boundary.rs facade controls the entire public API surface.
pub use self::boundary::*;
