//! Single-slot restart coordination.
//!
//! A burst of rebuilds must not run overlapping spawn sequences. Every request
//! replaces the pending callback; the replaced one is dropped without ever
//! being called. Exactly one callback, the most recent, fires per close cycle.

use std::fmt;

/// Marker for one restart request. Tokens increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RestartToken(u64);

impl fmt::Display for RestartToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct RestartCoordinator<C> {
    pending: Option<(RestartToken, C)>,
    issued: u64,
}

impl<C> Default for RestartCoordinator<C> {
    fn default() -> Self {
        Self {
            pending: None,
            issued: 0,
        }
    }
}

impl<C> RestartCoordinator<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` as the sole completion handler.
    pub fn request(&mut self, callback: C) -> RestartToken {
        self.issued += 1;
        let token = RestartToken(self.issued);
        if let Some((stale, _)) = self.pending.take() {
            tracing::debug!("Restart {} superseded by {}", stale, token);
        }
        self.pending = Some((token, callback));
        token
    }

    /// Hand out the pending callback. Returns `None` once taken.
    pub fn take(&mut self) -> Option<(RestartToken, C)> {
        self.pending.take()
    }
}
