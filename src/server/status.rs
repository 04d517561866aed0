use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LifecycleState {
    /// Server is completely stopped
    #[default]
    Stopped = 0,
    /// Server is binding its listener
    Starting = 1,
    /// Server is running and accepting connections
    Running = 2,
    /// Server no longer accepts connections and waits for open ones to close
    Draining = 3,
}

impl LifecycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn shutdown_requested(&self) -> bool {
        matches!(self, Self::Draining)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Stopped => "Server is stopped",
            Self::Starting => "Server is starting up",
            Self::Running => "Server is running and accepting connections",
            Self::Draining => "Server is draining open connections",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Lock-free holder of a server's [`LifecycleState`].
///
/// Every transition is a compare-and-swap from an expected state, so two
/// callers racing on `start` or `stop` cannot both win.
#[derive(Debug, Default)]
pub(crate) struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally return to `Stopped`.
    pub fn reset(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.swap(LifecycleState::Stopped as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to`, or report the state that was observed instead.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }
}
