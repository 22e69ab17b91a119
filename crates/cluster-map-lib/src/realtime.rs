//! Live point set and change-feed merging
//!
//! The merger is the only writer of the live point set. It applies insert, update
//! and delete events in arrival order, keyed by point id so duplicate deliveries are
//! harmless, and decides when enough has changed to justify rebuilding the index.
//! Rebuilds are coalesced: a burst of events produces one rebuild, not one per event.
//!
//! Connection loss flips the feed to [`FeedStatus::Stale`]. After reconnecting the
//! merger refuses to apply events until a full reconciliation set is installed; events
//! received in the meantime are buffered and replayed on top of it.

use crate::collaborators::{ChangeFeed, ConnectionState, FeedMessage};
use crate::{ChangeEvent, ChangeFilter, ChangeKind, MapError, Point, PointId, Result};
use indexmap::IndexMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Rebuild coalescing parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct MergeConfig {
    /// Pending changes that make a rebuild due immediately (subject to the interval)
    pub dirty_threshold: usize,
    /// Minimum time between two rebuilds
    pub min_rebuild_interval: Duration,
    /// Longest time a pending change may wait for a rebuild
    pub max_staleness: Duration,
    /// Events held while the feed is not live; on overflow the buffer is dropped
    /// and reconciliation alone restores the set
    pub max_buffered_events: usize,
    /// Feed topic to subscribe to
    pub topic: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            dirty_threshold: 64,
            min_rebuild_interval: Duration::from_millis(500),
            max_staleness: Duration::from_millis(1000),
            max_buffered_events: 10_000,
            topic: "points".to_string(),
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<()> {
        let interval = Duration::from_millis(300)..=Duration::from_millis(1000);
        if !interval.contains(&self.min_rebuild_interval) {
            return Err(MapError::InvalidConfig(format!(
                "min_rebuild_interval must be within 300..=1000ms, got {:?}",
                self.min_rebuild_interval
            )));
        }
        if self.max_staleness < self.min_rebuild_interval {
            return Err(MapError::InvalidConfig(
                "max_staleness must not be shorter than min_rebuild_interval".to_string(),
            ));
        }
        if self.dirty_threshold == 0 {
            return Err(MapError::InvalidConfig(
                "dirty_threshold must be positive".to_string(),
            ));
        }
        if self.max_buffered_events == 0 {
            return Err(MapError::InvalidConfig(
                "max_buffered_events must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Points keyed by id, in insertion order
///
/// Updates keep a point's original position so clustering tie-breaks stay stable
/// across rebuilds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointSet {
    points: IndexMap<PointId, Point>,
}

impl PointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set; later duplicates of an id replace earlier ones
    pub fn from_points(points: impl IntoIterator<Item = Point>) -> Self {
        let mut set = Self::new();
        for point in points {
            set.upsert(point);
        }
        set
    }

    /// Insert or replace a point; returns false when nothing changed
    pub fn upsert(&mut self, point: Point) -> bool {
        match self.points.get_mut(&point.id) {
            Some(existing) if *existing == point => false,
            Some(existing) => {
                *existing = point;
                true
            }
            None => {
                self.points.insert(point.id.clone(), point);
                true
            }
        }
    }

    /// Remove a point; returns false when it was not present
    pub fn remove(&mut self, id: &PointId) -> bool {
        self.points.shift_remove(id).is_some()
    }

    pub fn get(&self, id: &PointId) -> Option<&Point> {
        self.points.get(id)
    }

    pub fn contains(&self, id: &PointId) -> bool {
        self.points.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    pub fn to_vec(&self) -> Vec<Point> {
        self.points.values().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Health of the change feed as seen by the merger
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeedStatus {
    /// Connected and reconciled; events are applied as they arrive
    Live,
    /// Disconnected or reconnecting; the live set may be missing changes
    Stale,
    /// Reconnected; a full reconciliation fetch must complete before merging resumes
    AwaitingReconciliation,
}

/// What applying a single event did to the live set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Removed,
    /// Duplicate delivery or delete of an unknown point
    Unchanged,
    /// Malformed coordinates
    Rejected,
    /// Held back until reconciliation completes
    Buffered,
}

impl MergeOutcome {
    pub fn is_change(self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted | MergeOutcome::Updated | MergeOutcome::Removed
        )
    }
}

/// Owner of the live point set
#[derive(Debug)]
pub struct RealtimeMerger {
    config: MergeConfig,
    filter: ChangeFilter,
    points: PointSet,
    status: FeedStatus,
    buffered: Vec<ChangeEvent>,
    dirty: usize,
    first_dirty_at: Option<Instant>,
    last_rebuild_at: Option<Instant>,
    force_rebuild: bool,
    /// Incremented on every change to the live set
    revision: u64,
}

impl RealtimeMerger {
    pub fn new(config: MergeConfig, filter: ChangeFilter) -> Self {
        Self {
            config,
            filter,
            points: PointSet::new(),
            status: FeedStatus::Live,
            buffered: Vec::new(),
            dirty: 0,
            first_dirty_at: None,
            last_rebuild_at: None,
            force_rebuild: false,
            revision: 0,
        }
    }

    /// Subscribe to the configured topic with this merger's filter
    pub fn subscribe(&self, feed: &dyn ChangeFeed) -> Result<mpsc::UnboundedReceiver<FeedMessage>> {
        feed.subscribe(&self.config.topic, &self.filter)
    }

    /// Dispatch one feed message
    pub fn handle(&mut self, message: FeedMessage, now: Instant) -> Option<MergeOutcome> {
        match message {
            FeedMessage::Event(event) => Some(self.apply(event, now)),
            FeedMessage::Connection(state) => {
                self.on_connection(state);
                None
            }
        }
    }

    /// Apply a change event to the live set
    ///
    /// Marks the set dirty but never rebuilds; see [`RealtimeMerger::rebuild_due`].
    pub fn apply(&mut self, event: ChangeEvent, now: Instant) -> MergeOutcome {
        if self.status != FeedStatus::Live {
            if self.buffered.len() >= self.config.max_buffered_events {
                tracing::warn!(
                    dropped = self.buffered.len(),
                    "Reconnect buffer full, relying on reconciliation"
                );
                self.buffered.clear();
            }
            self.buffered.push(event);
            return MergeOutcome::Buffered;
        }
        let outcome = self.apply_to_set(event);
        if outcome.is_change() {
            self.mark_dirty(now);
        }
        outcome
    }

    fn apply_to_set(&mut self, event: ChangeEvent) -> MergeOutcome {
        let ChangeEvent { kind, point } = event;
        match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                if let Err(err) = point.validate() {
                    tracing::warn!(%err, "Rejecting change event");
                    return MergeOutcome::Rejected;
                }
                if !self.filter.matches(&point) {
                    // The point left the filter: treat like a delete
                    return if self.points.remove(&point.id) {
                        MergeOutcome::Removed
                    } else {
                        MergeOutcome::Unchanged
                    };
                }
                let existed = self.points.contains(&point.id);
                match (self.points.upsert(point), existed) {
                    (false, _) => MergeOutcome::Unchanged,
                    (true, true) => MergeOutcome::Updated,
                    (true, false) => MergeOutcome::Inserted,
                }
            }
            ChangeKind::Delete => {
                if self.points.remove(&point.id) {
                    MergeOutcome::Removed
                } else {
                    MergeOutcome::Unchanged
                }
            }
        }
    }

    fn mark_dirty(&mut self, now: Instant) {
        self.dirty += 1;
        self.revision += 1;
        self.first_dirty_at.get_or_insert(now);
    }

    /// React to a connection state change; returns the new feed status
    pub fn on_connection(&mut self, state: ConnectionState) -> FeedStatus {
        let next = match (self.status, state) {
            (FeedStatus::Live, ConnectionState::Connected) => FeedStatus::Live,
            (_, ConnectionState::Connected) => FeedStatus::AwaitingReconciliation,
            (_, ConnectionState::Reconnecting | ConnectionState::Disconnected) => {
                FeedStatus::Stale
            }
        };
        if next != self.status {
            match next {
                FeedStatus::Stale => tracing::warn!(?state, "Change feed lost, data is stale"),
                _ => tracing::info!(?state, status = ?next, "Change feed status changed"),
            }
        }
        self.status = next;
        next
    }

    /// The feed ended for good
    pub fn on_closed(&mut self) {
        if self.status != FeedStatus::Stale {
            tracing::warn!("Change feed closed, data is stale");
        }
        self.status = FeedStatus::Stale;
    }

    #[inline]
    pub fn needs_reconciliation(&self) -> bool {
        self.status == FeedStatus::AwaitingReconciliation
    }

    /// Install a full reconciliation set and replay buffered events on top of it
    ///
    /// Returns the number of replayed events.
    pub fn reconcile(&mut self, points: Vec<Point>, now: Instant) -> usize {
        self.replace(points, now);
        self.status = FeedStatus::Live;
        let buffered = std::mem::take(&mut self.buffered);
        let replayed = buffered.len();
        for event in buffered {
            self.apply_to_set(event);
        }
        tracing::info!(
            points = self.points.len(),
            replayed,
            "Reconciled live point set"
        );
        replayed
    }

    /// Replace the live set with a fresh fetch result and request a rebuild
    pub fn replace(&mut self, points: Vec<Point>, now: Instant) {
        self.install(points);
        self.force_rebuild = true;
        self.first_dirty_at.get_or_insert(now);
    }

    /// Replace the live set with data that is already rendered (no rebuild needed)
    pub fn install(&mut self, points: Vec<Point>) {
        let mut set = PointSet::new();
        for point in points {
            if point.validate().is_ok() && self.filter.matches(&point) {
                set.upsert(point);
            }
        }
        self.points = set;
        self.revision += 1;
    }

    /// Whether pending changes justify a rebuild at `now`
    pub fn rebuild_due(&self, now: Instant) -> bool {
        self.next_rebuild_at().is_some_and(|at| at <= now)
    }

    /// Earliest instant at which a rebuild becomes due, if any change is pending
    pub fn next_rebuild_at(&self) -> Option<Instant> {
        let first_dirty = self.first_dirty_at?;
        if self.force_rebuild {
            return Some(first_dirty);
        }
        if self.dirty == 0 {
            return None;
        }
        let ready = if self.dirty >= self.config.dirty_threshold {
            first_dirty
        } else {
            first_dirty + self.config.max_staleness
        };
        Some(match self.last_rebuild_at {
            Some(last) => ready.max(last + self.config.min_rebuild_interval),
            None => ready,
        })
    }

    /// Record that the index was rebuilt from the current set
    pub fn mark_rebuilt(&mut self, now: Instant) {
        self.dirty = 0;
        self.first_dirty_at = None;
        self.force_rebuild = false;
        self.last_rebuild_at = Some(now);
    }

    #[inline]
    pub fn points(&self) -> &PointSet {
        &self.points
    }

    #[inline]
    pub fn status(&self) -> FeedStatus {
        self.status
    }

    #[inline]
    pub fn dirty_count(&self) -> usize {
        self.dirty
    }

    #[inline]
    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Attributes;

    fn merger() -> RealtimeMerger {
        RealtimeMerger::new(MergeConfig::default(), ChangeFilter::default())
    }

    fn point(id: &str, lat: f64) -> Point {
        Point::new(id, lat, 10.0)
    }

    #[test]
    fn test_insert_is_idempotent() {
        let now = Instant::now();
        let event = ChangeEvent::insert(point("a", 1.0));

        let mut once = merger();
        once.apply(event.clone(), now);

        let mut twice = merger();
        assert_eq!(twice.apply(event.clone(), now), MergeOutcome::Inserted);
        assert_eq!(twice.apply(event, now), MergeOutcome::Unchanged);

        assert_eq!(once.points(), twice.points());
        assert_eq!(twice.dirty_count(), 1);
    }

    #[test]
    fn test_events_applied_in_arrival_order() {
        let now = Instant::now();
        let mut merger = merger();
        merger.apply(ChangeEvent::insert(point("a", 1.0)), now);
        merger.apply(ChangeEvent::insert(point("b", 2.0)), now);
        assert_eq!(merger.apply(ChangeEvent::update(point("a", 3.0)), now), MergeOutcome::Updated);
        assert_eq!(merger.apply(ChangeEvent::delete(point("b", 0.0)), now), MergeOutcome::Removed);
        assert_eq!(merger.apply(ChangeEvent::delete(point("b", 0.0)), now), MergeOutcome::Unchanged);

        let points = merger.points().to_vec();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].lat, 3.0);
    }

    #[test]
    fn test_update_keeps_insertion_position() {
        let mut set = PointSet::from_points([point("a", 1.0), point("b", 2.0), point("c", 3.0)]);
        set.upsert(point("a", 9.0));
        let ids: Vec<_> = set.iter().map(|p| p.id.0.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_malformed_event_rejected() {
        let mut merger = merger();
        let outcome = merger.apply(ChangeEvent::insert(Point::new("x", f64::NAN, 0.0)), Instant::now());
        assert_eq!(outcome, MergeOutcome::Rejected);
        assert!(merger.points().is_empty());
    }

    #[test]
    fn test_filter_exit_removes_point() {
        let filter = ChangeFilter {
            verified_only: true,
            categories: None,
        };
        let mut merger = RealtimeMerger::new(MergeConfig::default(), filter);
        let now = Instant::now();
        let verified = point("a", 1.0).with_attributes(Attributes {
            verified: true,
            ..Default::default()
        });
        assert_eq!(merger.apply(ChangeEvent::insert(verified), now), MergeOutcome::Inserted);
        // Verification revoked
        assert_eq!(merger.apply(ChangeEvent::update(point("a", 1.0)), now), MergeOutcome::Removed);
        assert_eq!(merger.apply(ChangeEvent::insert(point("b", 1.0)), now), MergeOutcome::Unchanged);
        assert!(merger.points().is_empty());
    }

    #[test]
    fn test_rebuilds_are_coalesced() {
        let config = MergeConfig {
            dirty_threshold: 3,
            ..Default::default()
        };
        let mut merger = RealtimeMerger::new(config, ChangeFilter::default());
        let start = Instant::now();
        assert_eq!(merger.next_rebuild_at(), None);

        merger.apply(ChangeEvent::insert(point("a", 1.0)), start);
        assert!(!merger.rebuild_due(start));
        // Below the threshold a change waits at most max_staleness
        assert_eq!(merger.next_rebuild_at(), Some(start + Duration::from_millis(1000)));

        merger.apply(ChangeEvent::insert(point("b", 1.0)), start);
        merger.apply(ChangeEvent::insert(point("c", 1.0)), start);
        assert!(merger.rebuild_due(start));
        merger.mark_rebuilt(start);
        assert_eq!(merger.dirty_count(), 0);

        // A burst right after a rebuild waits for the minimum interval
        let soon = start + Duration::from_millis(100);
        for id in ["d", "e", "f", "g"] {
            merger.apply(ChangeEvent::insert(point(id, 1.0)), soon);
        }
        assert!(!merger.rebuild_due(soon));
        assert!(merger.rebuild_due(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_disconnect_and_reconcile() {
        let mut merger = merger();
        let now = Instant::now();
        merger.apply(ChangeEvent::insert(point("a", 1.0)), now);
        merger.mark_rebuilt(now);

        assert_eq!(merger.on_connection(ConnectionState::Disconnected), FeedStatus::Stale);
        assert_eq!(
            merger.on_connection(ConnectionState::Connected),
            FeedStatus::AwaitingReconciliation
        );
        assert!(merger.needs_reconciliation());

        // Not applied before the reconciliation set is installed
        assert_eq!(
            merger.apply(ChangeEvent::insert(point("late", 5.0)), now),
            MergeOutcome::Buffered
        );
        assert_eq!(merger.points().len(), 1);

        let replayed = merger.reconcile(vec![point("a", 1.0), point("b", 2.0)], now);
        assert_eq!(replayed, 1);
        assert_eq!(merger.status(), FeedStatus::Live);
        assert_eq!(merger.points().len(), 3);
        assert!(merger.points().contains(&PointId::from("late")));
        // Reconciliation always triggers a rebuild
        assert!(merger.rebuild_due(now));
    }

    #[test]
    fn test_reconnect_buffer_is_bounded() {
        let config = MergeConfig {
            max_buffered_events: 4,
            ..Default::default()
        };
        let mut merger = RealtimeMerger::new(config, ChangeFilter::default());
        let now = Instant::now();
        merger.on_connection(ConnectionState::Reconnecting);

        for i in 0..10 {
            let event = ChangeEvent::insert(point(&format!("e{i}"), 1.0));
            assert_eq!(merger.apply(event, now), MergeOutcome::Buffered);
            assert!(merger.buffered_count() <= 4);
        }
        assert_eq!(merger.buffered_count(), 2);

        merger.on_connection(ConnectionState::Connected);
        let replayed = merger.reconcile(vec![point("a", 1.0)], now);
        assert_eq!(replayed, 2);
        assert_eq!(merger.points().len(), 3);
        assert!(merger.points().contains(&PointId::from("e9")));
    }

    #[test]
    fn test_connected_while_live_is_noop() {
        let mut merger = merger();
        assert_eq!(merger.on_connection(ConnectionState::Connected), FeedStatus::Live);
        merger.on_closed();
        assert_eq!(merger.status(), FeedStatus::Stale);
    }

    #[test]
    fn test_install_skips_rebuild() {
        let mut merger = merger();
        let revision = merger.revision();
        merger.install(vec![point("a", 1.0), Point::new("bad", 100.0, 0.0)]);
        assert_eq!(merger.points().len(), 1);
        assert!(merger.revision() > revision);
        assert_eq!(merger.next_rebuild_at(), None);
    }

    #[test]
    fn test_merge_config_validation() {
        assert!(MergeConfig::default().validate().is_ok());
        let too_fast = MergeConfig {
            min_rebuild_interval: Duration::from_millis(50),
            ..Default::default()
        };
        assert!(too_fast.validate().is_err());
        let no_buffer = MergeConfig {
            max_buffered_events: 0,
            ..Default::default()
        };
        assert!(no_buffer.validate().is_err());
    }
}
