//! Download queue scheduling.

mod activity;
pub mod manager;
pub mod policy;

pub use manager::{QueueManager, QueueManagerBuilder};
pub use policy::downloads_allowed;
