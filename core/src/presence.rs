/// Derived online/offline indicator
use crate::push::connection::{ConnectionPhase, ConnectionState};
use tokio::sync::watch;

/// Read-only view of the push connection state
#[derive(Clone)]
pub struct Presence {
    state: watch::Receiver<ConnectionState>,
}

impl Presence {
    pub fn new(state: watch::Receiver<ConnectionState>) -> Self {
        Self { state }
    }

    /// Chooses push vs. fallback at send time
    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected()
    }

    /// Automatic reconnects are used up; offer the manual refresh
    pub fn needs_manual_resync(&self) -> bool {
        self.state.borrow().phase == ConnectionPhase::Exhausted
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}
