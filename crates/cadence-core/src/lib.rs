//! Cadence Core
//!
//! Core domain types, traits, and error handling for the Cadence deployment
//! orchestrator. This crate has minimal dependencies and defines the shared
//! vocabulary used by the scheduling services.

pub mod application;
pub mod change;
pub mod deployment;
pub mod error;
pub mod ids;
pub mod job;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
