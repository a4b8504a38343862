//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the offline download core:
//! - Logging and tracing infrastructure
//! - Bridge configuration with fail-fast capability checks
//! - Event bus for download lifecycle notifications
//!
//! ## Overview
//!
//! Nothing in this crate knows about queue semantics. It establishes the
//! logging conventions, the capability wiring, and the broadcast channel that
//! `core-offline` builds on.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
