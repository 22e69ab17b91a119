//! Map lifecycle state machine

use crate::{MapError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LifecycleState {
    Uninitialized,
    TokenAcquired,
    Initialized,
    DataLoading,
    Ready,
    Suspended,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LifecycleEvent {
    TokenAcquired,
    MapInitialized,
    LoadStarted,
    LoadFinished,
    VisibilityLost,
    VisibilityRegained,
    Failed,
    /// Manual retry after an unrecoverable failure
    Retry,
}

/// Validated lifecycle of one map instance
///
/// ```text
/// Uninitialized -> TokenAcquired -> Initialized -> DataLoading <-> Ready
/// any -> Suspended -> Initialized (or back to where it was before initialization)
/// any -> Error -> Uninitialized (only on Retry)
/// ```
#[derive(Clone, Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    /// Where `VisibilityRegained` leads while suspended
    resume_to: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            resume_to: LifecycleState::Uninitialized,
        }
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Target state of `event` from the current state, if legal
    pub fn target(&self, event: LifecycleEvent) -> Option<LifecycleState> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        match (self.state, event) {
            (S::Error, E::Retry) => Some(S::Uninitialized),
            (S::Error, _) => None,
            (_, E::Failed) => Some(S::Error),
            (S::Suspended, E::VisibilityLost) => Some(S::Suspended),
            (S::Suspended, E::VisibilityRegained) => Some(self.resume_to),
            (S::Suspended, _) => None,
            (_, E::VisibilityLost) => Some(S::Suspended),
            (S::Uninitialized, E::TokenAcquired) => Some(S::TokenAcquired),
            (S::TokenAcquired, E::MapInitialized) => Some(S::Initialized),
            (S::Initialized | S::Ready | S::DataLoading, E::LoadStarted) => Some(S::DataLoading),
            (S::DataLoading, E::LoadFinished) => Some(S::Ready),
            _ => None,
        }
    }

    /// Apply `event`, returning the new state
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<LifecycleState> {
        let from = self.state;
        let to = self
            .target(event)
            .ok_or(MapError::InvalidTransition { from, event })?;

        if to == LifecycleState::Suspended && from != LifecycleState::Suspended {
            self.resume_to = match from {
                LifecycleState::Uninitialized | LifecycleState::TokenAcquired => from,
                _ => LifecycleState::Initialized,
            };
        }

        if from != to {
            match to {
                LifecycleState::Error => tracing::error!(?from, ?event, "Map entered error state"),
                _ => tracing::info!(?from, ?to, ?event, "Lifecycle transition"),
            }
        }
        self.state = to;
        Ok(to)
    }

    /// Whether the map may issue fetches and render
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Initialized | LifecycleState::DataLoading | LifecycleState::Ready
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    fn ready() -> Lifecycle {
        let mut lifecycle = Lifecycle::new();
        for event in [E::TokenAcquired, E::MapInitialized, E::LoadStarted, E::LoadFinished] {
            lifecycle.apply(event).unwrap();
        }
        lifecycle
    }

    #[test]
    fn test_happy_path() {
        let mut lifecycle = ready();
        assert_eq!(lifecycle.state(), S::Ready);
        assert!(lifecycle.is_active());
        assert_eq!(lifecycle.apply(E::LoadStarted).unwrap(), S::DataLoading);
        // A superseding viewport change while loading
        assert_eq!(lifecycle.apply(E::LoadStarted).unwrap(), S::DataLoading);
        assert_eq!(lifecycle.apply(E::LoadFinished).unwrap(), S::Ready);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.apply(E::LoadStarted),
            Err(MapError::InvalidTransition {
                from: S::Uninitialized,
                event: E::LoadStarted
            })
        ));
        assert!(ready().apply(E::MapInitialized).is_err());
        assert!(ready().apply(E::LoadFinished).is_err());
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut lifecycle = ready();
        assert_eq!(lifecycle.apply(E::VisibilityLost).unwrap(), S::Suspended);
        assert!(!lifecycle.is_active());
        assert!(lifecycle.apply(E::LoadStarted).is_err());
        assert_eq!(lifecycle.apply(E::VisibilityLost).unwrap(), S::Suspended);
        assert_eq!(lifecycle.apply(E::VisibilityRegained).unwrap(), S::Initialized);
    }

    #[test]
    fn test_suspend_before_initialization_resumes_in_place() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.apply(E::TokenAcquired).unwrap();
        lifecycle.apply(E::VisibilityLost).unwrap();
        assert_eq!(lifecycle.apply(E::VisibilityRegained).unwrap(), S::TokenAcquired);
    }

    #[test]
    fn test_error_only_left_by_retry() {
        let mut lifecycle = ready();
        assert_eq!(lifecycle.apply(E::Failed).unwrap(), S::Error);
        for event in [E::LoadStarted, E::VisibilityLost, E::VisibilityRegained, E::TokenAcquired] {
            assert!(lifecycle.apply(event).is_err());
        }
        assert_eq!(lifecycle.apply(E::Retry).unwrap(), S::Uninitialized);
    }

    #[test]
    fn test_any_state_can_fail() {
        let mut suspended = ready();
        suspended.apply(E::VisibilityLost).unwrap();
        assert_eq!(suspended.apply(E::Failed).unwrap(), S::Error);
        assert_eq!(Lifecycle::new().apply(E::Failed).unwrap(), S::Error);
    }
}
