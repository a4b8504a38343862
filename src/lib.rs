//! Workspace facade crate.
//!
//! Re-exports the offline download queue so host applications can depend on a
//! single package. The `desktop-shims` feature (enabled by default) also pulls
//! in the desktop bridge adapters and lets `CoreConfig` fill in missing
//! capabilities automatically.

pub use core_offline::*;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop as desktop;
