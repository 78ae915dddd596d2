//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `bicameral` crate.
//!
//! It centralizes the error taxonomy and logging setup so every component
//! reports failures the same way.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
