//! # Event Bus System
//!
//! Broadcasts download lifecycle events using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The queue manager publishes one event per state transition (queued,
//! started, progress, completed, retry scheduled, failed, paused, resumed,
//! removed) plus storage-level events from recovery and quota eviction.
//! Presentation layers that prefer a push stream over polling the queue
//! snapshot subscribe here.
//!
//! ```text
//! ┌──────────────┐     emit      ┌───────────┐     subscribe    ┌────────────┐
//! │ QueueManager ├──────────────>│           ├─────────────────>│ Subscriber │
//! └──────────────┘               │ EventBus  │                  └────────────┘
//! ┌──────────────┐     emit      │ (broadcast│     subscribe    ┌────────────┐
//! │   Recovery   ├──────────────>│  channel) ├─────────────────>│ Subscriber │
//! └──────────────┘               └───────────┘                  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Download(DownloadEvent::Queued {
//!         item_id: "item-1".to_string(),
//!         resource_id: "track-1".to_string(),
//!     }))
//!     .ok();
//!
//! let received = stream.recv().await.unwrap();
//! assert_eq!(received.description(), "Download queued");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Progress events are the usual culprit; lagging is non-fatal.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Publishing with no subscribers returns an error that emitters ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Queue item lifecycle events
    Download(DownloadEvent),
    /// Local storage maintenance events
    Storage(StorageEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Storage(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Download(DownloadEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Storage(StorageEvent::RecoveryFailed { .. }) => EventSeverity::Error,
            CoreEvent::Download(DownloadEvent::RetryScheduled { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Paused { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Download(DownloadEvent::Evicted { .. }) => EventSeverity::Info,
            CoreEvent::Storage(StorageEvent::RecoveryCompleted { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Download Events
// ============================================================================

/// Events describing queue item transitions.
///
/// Identifiers are carried as strings so the payload stays serializable for
/// FFI and JSON consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// A new queue item was created (or a failed/paused one was reused).
    Queued { item_id: String, resource_id: String },
    /// A transfer attempt started.
    Started {
        item_id: String,
        resource_id: String,
        /// Attempt number for this item, starting at 1
        attempt: u32,
    },
    /// Progress update for the current attempt.
    Progress {
        item_id: String,
        resource_id: String,
        percent: u8,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    },
    /// The resource is on disk and the item is completed.
    Completed {
        item_id: String,
        resource_id: String,
        local_path: String,
    },
    /// An attempt failed and another one will follow after `delay_ms`.
    RetryScheduled {
        item_id: String,
        resource_id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    /// The item reached the terminal failed state.
    Failed {
        item_id: String,
        resource_id: String,
        retry_count: u32,
        error: String,
    },
    Paused {
        item_id: String,
        resource_id: String,
        /// `network`, `manual` or `error`
        reason: String,
    },
    Resumed { item_id: String, resource_id: String },
    Removed { item_id: String, resource_id: String },
    /// A downloaded resource was deleted at the user's request.
    Deleted { resource_id: String },
    /// A downloaded resource was deleted to stay within the retention quota.
    Evicted { resource_id: String },
    /// The network/preference policy flipped.
    PolicyChanged { downloads_allowed: bool },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Queued { .. } => "Download queued",
            DownloadEvent::Started { .. } => "Download started",
            DownloadEvent::Progress { .. } => "Download progress",
            DownloadEvent::Completed { .. } => "Download completed",
            DownloadEvent::RetryScheduled { .. } => "Download retry scheduled",
            DownloadEvent::Failed { .. } => "Download failed",
            DownloadEvent::Paused { .. } => "Download paused",
            DownloadEvent::Resumed { .. } => "Download resumed",
            DownloadEvent::Removed { .. } => "Download removed from queue",
            DownloadEvent::Deleted { .. } => "Downloaded resource deleted",
            DownloadEvent::Evicted { .. } => "Downloaded resource evicted",
            DownloadEvent::PolicyChanged { .. } => "Download policy changed",
        }
    }
}

// ============================================================================
// Storage Events
// ============================================================================

/// Events emitted by the startup consistency pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum StorageEvent {
    RecoveryCompleted {
        /// Records whose file moved under the current storage root
        migrated: usize,
        /// Files on disk that were re-attached to new records
        adopted: usize,
        /// Leftover partial files that were removed
        partials_removed: usize,
    },
    RecoveryFailed { message: String },
}

impl StorageEvent {
    fn description(&self) -> &str {
        match self {
            StorageEvent::RecoveryCompleted { .. } => "Storage recovery completed",
            StorageEvent::RecoveryFailed { .. } => "Storage recovery failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s.
///
/// Cloning is cheap; every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// Subscribers that fall behind by more than `capacity` events receive
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let downloads_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Download(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
