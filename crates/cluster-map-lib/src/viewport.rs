//! Camera change filtering and trailing-edge debounce

use crate::{MapError, Result, Viewport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ViewportConfig {
    /// Zoom delta that counts as a real change
    pub zoom_epsilon: f64,
    /// Center delta in degrees (per axis) that counts as a real change
    pub center_epsilon: f64,
    /// Quiet period before a change is emitted
    pub debounce: Duration,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            zoom_epsilon: 0.5,
            center_epsilon: 0.0005,
            debounce: Duration::from_millis(200),
        }
    }
}

impl ViewportConfig {
    pub fn validate(&self) -> Result<()> {
        let range = Duration::from_millis(100)..=Duration::from_millis(300);
        if !range.contains(&self.debounce) {
            return Err(MapError::InvalidConfig(format!(
                "viewport debounce must be within 100..=300ms, got {:?}",
                self.debounce
            )));
        }
        if !(self.zoom_epsilon > 0.0 && self.center_epsilon > 0.0) {
            return Err(MapError::InvalidConfig(
                "viewport epsilons must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Turns a stream of raw camera states into coalesced change notifications
///
/// The tracker is a plain state machine driven by explicit timestamps so that it can
/// be tested without a clock; [`ViewportTracker::next_change`] drives it from a
/// channel of camera updates.
#[derive(Debug, Clone)]
pub struct ViewportTracker {
    config: ViewportConfig,
    last_emitted: Option<Viewport>,
    pending: Option<(Viewport, Instant)>,
}

impl ViewportTracker {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            config,
            last_emitted: None,
            pending: None,
        }
    }

    /// Observe a camera state; returns true if a change is now pending
    ///
    /// Every observation restarts the debounce timer. A camera that returns to
    /// the last emitted position cancels the pending change.
    pub fn observe(&mut self, viewport: Viewport, now: Instant) -> bool {
        if let Some(last) = &self.last_emitted
            && viewport.is_equivalent(last, self.config.zoom_epsilon, self.config.center_epsilon)
        {
            self.pending = None;
            return false;
        }
        self.pending = Some((viewport, now + self.config.debounce));
        true
    }

    /// Emit the pending change once its quiet period has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<Viewport> {
        match self.pending {
            Some((_, deadline)) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// Emit the pending change immediately
    pub fn flush(&mut self) -> Option<Viewport> {
        let (viewport, _) = self.pending.take()?;
        tracing::debug!(zoom = viewport.zoom, center = ?viewport.center, "Viewport changed");
        self.last_emitted = Some(viewport);
        Some(viewport)
    }

    /// When the pending change fires, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, deadline)| deadline)
    }

    pub fn last_emitted(&self) -> Option<&Viewport> {
        self.last_emitted.as_ref()
    }

    /// Forget everything; the next observation always counts as a change
    pub fn reset(&mut self) {
        self.last_emitted = None;
        self.pending = None;
    }

    /// Wait for the next coalesced change from a stream of camera states
    ///
    /// Returns `None` once the camera channel is closed and nothing is pending.
    pub async fn next_change(
        &mut self,
        camera: &mut mpsc::UnboundedReceiver<Viewport>,
    ) -> Option<Viewport> {
        loop {
            match self.deadline() {
                Some(deadline) => {
                    tokio::select! {
                        update = camera.recv() => match update {
                            Some(viewport) => {
                                self.observe(viewport, Instant::now());
                            }
                            None => return self.flush(),
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            if let Some(viewport) = self.poll(Instant::now()) {
                                return Some(viewport);
                            }
                        }
                    }
                }
                None => {
                    let viewport = camera.recv().await?;
                    self.observe(viewport, Instant::now());
                }
            }
        }
    }
}
