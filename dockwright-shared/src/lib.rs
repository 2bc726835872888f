//! Dockwright Shared - Code shared by the builder, launcher and CLI
//!
//! This crate contains the error taxonomy and the constants that the build
//! side and the run side must agree on.

pub mod constants;
pub mod errors;

pub use errors::{DockwrightError, DockwrightResult};
