//! Interfaces to the services the engine depends on, plus in-memory implementations
//!
//! The engine never talks to a network directly. Point queries, the change feed and
//! the token service are reached through the traits in this module so that deployments
//! can plug in their own clients and tests can script failures and latency.

use crate::{BoundingBox, ChangeEvent, ChangeFilter, MapError, Point, PointId, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Windowed point query service
#[async_trait]
pub trait PointQuery: Send + Sync {
    /// Eligible points inside `bbox`, at most `cap` of them when a cap is given
    async fn list_points(
        &self,
        bbox: &BoundingBox,
        filter: &ChangeFilter,
        cap: Option<usize>,
    ) -> Result<Vec<Point>>;
}

/// Connection state reported by the change feed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
}

/// A message delivered by a change feed subscription
#[derive(Clone, Debug, PartialEq)]
pub enum FeedMessage {
    Event(ChangeEvent),
    Connection(ConnectionState),
}

/// Realtime change feed with at-least-once delivery
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to `topic`; the stream ends when the feed is closed for good
    fn subscribe(
        &self,
        topic: &str,
        filter: &ChangeFilter,
    ) -> Result<mpsc::UnboundedReceiver<FeedMessage>>;
}

/// Opaque access token service
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `Ok(None)` means the service answered but has no token for this session
    async fn get_token(&self) -> Result<Option<String>>;
}

/// Point query backed by an in-memory list
///
/// Supports artificial latency and scripted failures for simulations and tests.
#[derive(Debug, Default)]
pub struct InMemoryPointQuery {
    points: RwLock<IndexMap<PointId, Point>>,
    latency: Duration,
    failures: AtomicU32,
    calls: AtomicUsize,
}

impl InMemoryPointQuery {
    pub fn new(points: impl IntoIterator<Item = Point>) -> Self {
        Self {
            points: RwLock::new(points.into_iter().map(|p| (p.id.clone(), p)).collect()),
            ..Default::default()
        }
    }

    /// Delay every answer by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` calls fail with a transient error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of `list_points` calls served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Mirror a change event into the backing store
    pub async fn apply(&self, event: &ChangeEvent) {
        let mut points = self.points.write().await;
        match event.kind {
            crate::ChangeKind::Insert | crate::ChangeKind::Update => {
                points.insert(event.point.id.clone(), event.point.clone());
            }
            crate::ChangeKind::Delete => {
                points.shift_remove(&event.point.id);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }
}

#[async_trait]
impl PointQuery for InMemoryPointQuery {
    async fn list_points(
        &self,
        bbox: &BoundingBox,
        filter: &ChangeFilter,
        cap: Option<usize>,
    ) -> Result<Vec<Point>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MapError::Fetch {
                attempts: 1,
                reason: "scripted failure".to_string(),
            });
        }

        let points = self.points.read().await;
        let matching = points
            .values()
            .filter(|p| bbox.contains(p.lat, p.lon) && filter.matches(p))
            .take(cap.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }
}

/// Change feed that fans messages out to every live subscriber
#[derive(Debug, Default)]
pub struct ChannelFeed {
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<FeedMessage>)>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every subscriber of `topic`
    pub fn publish(&self, topic: &str, event: ChangeEvent) {
        self.broadcast(topic, FeedMessage::Event(event));
    }

    /// Report a connection state change to every subscriber of `topic`
    pub fn set_connection(&self, topic: &str, state: ConnectionState) {
        self.broadcast(topic, FeedMessage::Connection(state));
    }

    /// Drop every subscription; receivers observe the end of their stream
    pub fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn broadcast(&self, topic: &str, message: FeedMessage) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(subscribed, sender)| {
            subscribed != topic || sender.send(message.clone()).is_ok()
        });
    }
}

impl ChangeFeed for ChannelFeed {
    fn subscribe(
        &self,
        topic: &str,
        _filter: &ChangeFilter,
    ) -> Result<mpsc::UnboundedReceiver<FeedMessage>> {
        // Every event is forwarded; the merger re-checks eligibility so that points
        // leaving the filter are removed
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), sender));
        tracing::debug!(topic, "New change feed subscription");
        Ok(receiver)
    }
}

/// Token provider returning a fixed answer
#[derive(Clone, Debug, Default)]
pub struct StaticToken(pub Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn get_token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}
