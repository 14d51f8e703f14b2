//! Update coordinator: mutual exclusion between the fetch and apply paths
//!
//! Both agents share one [`Coordinator`]. Entering a critical section is a single
//! compare-and-exchange from [`GateState::Idle`], so two agents observing the gate
//! free in the same instant cannot both win. The returned [`GateGuard`] puts the
//! state back to idle when dropped, which covers early returns and `?` paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

/// Which agent, if any, currently holds the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GateState {
    /// No critical section in progress
    Idle = 0,
    /// The fetch agent is writing the staging slot
    Downloading = 1,
    /// The apply agent is flashing the firmware partition
    Applying = 2,
}

impl GateState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => GateState::Downloading,
            2 => GateState::Applying,
            _ => GateState::Idle,
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateState::Idle => write!(f, "idle"),
            GateState::Downloading => write!(f, "downloading"),
            GateState::Applying => write!(f, "applying"),
        }
    }
}

/// Shared coordination state for the two update agents
#[derive(Debug, Default)]
pub struct Coordinator {
    state: AtomicU8,
}

impl Coordinator {
    /// Create an idle coordinator
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(GateState::Idle as u8),
        }
    }

    /// Create an idle coordinator ready to be shared between agents
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current gate state
    #[inline]
    pub fn state(&self) -> GateState {
        GateState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether neither agent holds the gate
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state() == GateState::Idle
    }

    /// Enter the download critical section.
    ///
    /// Returns `None` when a download or an apply is already active.
    pub fn try_enter_download(&self) -> Option<GateGuard<'_>> {
        self.try_enter(GateState::Downloading)
    }

    /// Enter the apply critical section.
    ///
    /// Returns `None` when an apply or a download is already active.
    pub fn try_enter_apply(&self) -> Option<GateGuard<'_>> {
        self.try_enter(GateState::Applying)
    }

    fn try_enter(&self, target: GateState) -> Option<GateGuard<'_>> {
        match self.state.compare_exchange(
            GateState::Idle as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!("Update gate acquired: {}", target);
                Some(GateGuard {
                    coordinator: self,
                    held: target,
                })
            }
            Err(current) => {
                debug!(
                    "Update gate busy ({}), {} deferred",
                    GateState::from_u8(current),
                    target
                );
                None
            }
        }
    }

    fn release(&self, held: GateState) {
        // Only the holder moves the state back to idle.
        if self
            .state
            .compare_exchange(
                held as u8,
                GateState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!("Update gate released: {}", held);
        }
    }
}

/// Proof of holding the update gate; releases it on drop
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    coordinator: &'a Coordinator,
    held: GateState,
}

impl GateGuard<'_> {
    /// State this guard holds
    pub fn held(&self) -> GateState {
        self.held
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_excludes_apply() {
        let coordinator = Coordinator::new();

        let guard = coordinator.try_enter_download();
        assert!(guard.is_some());
        assert_eq!(coordinator.state(), GateState::Downloading);
        assert!(coordinator.try_enter_apply().is_none());
        assert!(coordinator.try_enter_download().is_none());

        drop(guard);
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_apply_excludes_download() {
        let coordinator = Coordinator::new();

        let guard = coordinator.try_enter_apply();
        assert_eq!(guard.as_ref().map(GateGuard::held), Some(GateState::Applying));
        assert!(coordinator.try_enter_download().is_none());
        assert!(coordinator.try_enter_apply().is_none());

        drop(guard);
        assert!(coordinator.try_enter_download().is_some());
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_gate_released_on_early_return() {
        fn failing_section(coordinator: &Coordinator) -> Result<(), &'static str> {
            let _gate = coordinator.try_enter_apply().ok_or("busy")?;
            Err("injected failure")
        }

        let coordinator = Coordinator::new();
        assert_eq!(failing_section(&coordinator), Err("injected failure"));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_gate_released_on_panic() {
        let coordinator = Arc::new(Coordinator::new());
        let c = coordinator.clone();
        let joined = std::thread::spawn(move || {
            let _gate = c.try_enter_download();
            panic!("injected panic inside critical section");
        })
        .join();

        assert!(joined.is_err());
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_gate_state_display() {
        assert_eq!(GateState::Idle.to_string(), "idle");
        assert_eq!(GateState::Downloading.to_string(), "downloading");
        assert_eq!(GateState::Applying.to_string(), "applying");
    }
}
