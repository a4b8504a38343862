//! Network download policy.

use bridge_traits::ConnectionKind;

use crate::preferences::DownloadPreferences;

/// Downloads may run when the user does not insist on an unmetered link, or
/// when the current link is unmetered.
pub fn downloads_allowed(preferences: &DownloadPreferences, kind: ConnectionKind) -> bool {
    !preferences.require_unmetered || kind == ConnectionKind::Unmetered
}

/// What the manager last observed about the network.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NetworkState {
    pub(crate) kind: ConnectionKind,
    /// Outcome of the last evaluation; `None` before the first pass
    pub(crate) downloads_allowed: Option<bool>,
}

impl NetworkState {
    pub(crate) fn new(kind: ConnectionKind) -> Self {
        Self {
            kind,
            downloads_allowed: None,
        }
    }

    /// Records a reachability reading. Returns false when the kind is unchanged.
    pub(crate) fn observe(&mut self, kind: ConnectionKind) -> bool {
        if self.kind == kind {
            return false;
        }
        self.kind = kind;
        true
    }

    /// Stores a fresh evaluation and returns the previous one when it differs.
    pub(crate) fn settle(&mut self, allowed: bool) -> Option<Option<bool>> {
        let previous = self.downloads_allowed.replace(allowed);
        (previous != Some(allowed)).then_some(previous)
    }
}
