//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` streaming bodies
//! - `FileSystemAccess` using `tokio::fs` under the user data directory
//! - `SettingsStore` using a SQLite-backed key-value table
//! - `NetworkMonitor` using a polling connectivity probe
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let fs = TokioFileSystem::new();
//!
//!     // Hand both to CoreConfig::builder()
//! }
//! ```

mod filesystem;
mod http;
mod network;
mod settings;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
pub use settings::SqliteSettingsStore;
