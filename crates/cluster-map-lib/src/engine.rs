//! MapEngine - Top-level orchestrator for the live clustering pipeline
//!
//! The engine owns every component and drives them from a single cooperative event
//! loop: camera updates go through the [`ViewportTracker`], accepted viewports start a
//! versioned fetch through the [`WindowLoader`], feed messages go to the
//! [`RealtimeMerger`], and coalesced rebuilds re-render the current viewport. Every
//! rendered feature set leaves the engine as a [`RenderFrame`].
//!
//! Nothing here blocks: index rebuilds run on the blocking pool and fetches run as
//! separate tasks whose results are validated against the latest request version.

use crate::collaborators::{ChangeFeed, ConnectionState, FeedMessage, PointQuery, TokenProvider};
use crate::config::EngineConfig;
use crate::lifecycle::{Lifecycle, LifecycleEvent, LifecycleState};
use crate::marker::{MarkerArena, MarkerDiff, MarkerFactory, Theme};
use crate::performance::PerformanceMonitor;
use crate::planner::{AdaptiveRenderPlanner, RenderPlan};
use crate::realtime::{FeedStatus, RealtimeMerger};
use crate::source::{
    DataSource, FullIndexSource, LoadedWindow, SourceMode, WindowLoader, WindowResult,
    WindowedSource,
};
use crate::viewport::ViewportTracker;
use crate::{Feature, MapError, Result, Viewport};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Everything the render surface needs to draw one state of the map
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RenderFrame {
    /// Monotonic frame counter
    pub version: u64,
    pub viewport: Viewport,
    pub plan: RenderPlan,
    pub features: Vec<Feature>,
    /// Marker changes relative to the previous frame
    pub diff: MarkerDiff,
    /// Points inside the viewport before capping
    pub total_count: usize,
    /// Shown from last-good data after a failure or while the feed is stale
    pub stale: bool,
}

/// Input from the host application
#[derive(Clone, Debug)]
pub enum EngineInput {
    Camera(Viewport),
    FrameTime(Duration),
    Visibility(bool),
    Retry,
    SetTheme(Theme),
}

/// Output towards the host application
#[derive(Clone, Debug, PartialEq)]
pub enum EngineUpdate {
    Frame(RenderFrame),
    State {
        state: LifecycleState,
        /// Reason for entering [`LifecycleState::Error`]
        error: Option<String>,
    },
}

/// Internal wake-up reasons of the event loop
#[derive(Debug)]
enum Internal {
    Loaded(LoadedWindow),
    Feed(Option<FeedMessage>),
    Debounce,
    Reconcile,
    Rebuild,
}

/// The live map clustering engine
pub struct MapEngine {
    config: EngineConfig,
    lifecycle: Lifecycle,
    token_provider: Arc<dyn TokenProvider>,
    token: Option<String>,
    feed: Arc<dyn ChangeFeed>,
    feed_rx: Option<mpsc::UnboundedReceiver<FeedMessage>>,
    source: Arc<dyn DataSource>,
    loader: WindowLoader,
    loaded: mpsc::UnboundedReceiver<LoadedWindow>,
    tracker: ViewportTracker,
    monitor: PerformanceMonitor,
    planner: AdaptiveRenderPlanner,
    merger: RealtimeMerger,
    markers: MarkerFactory,
    arena: MarkerArena,
    viewport: Option<Viewport>,
    /// Viewport whose window backs the live set (windowed mode)
    installed_for: Option<Viewport>,
    last_frame: Option<RenderFrame>,
    frame_version: u64,
    outbox: VecDeque<EngineUpdate>,
}

impl MapEngine {
    /// Create an engine over an explicit data source
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn DataSource>,
        feed: Arc<dyn ChangeFeed>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let (loader, loaded) = WindowLoader::new(Arc::clone(&source));
        Ok(Self {
            lifecycle: Lifecycle::new(),
            token_provider,
            token: None,
            feed,
            feed_rx: None,
            source,
            loader,
            loaded,
            tracker: ViewportTracker::new(config.viewport.clone()),
            monitor: PerformanceMonitor::new(config.performance.clone()),
            planner: AdaptiveRenderPlanner::new(config.planner.clone()),
            merger: RealtimeMerger::new(config.merge.clone(), config.filter.clone()),
            markers: MarkerFactory::new(config.theme.clone(), config.cache.marker_capacity()),
            arena: MarkerArena::new(),
            viewport: None,
            installed_for: None,
            last_frame: None,
            frame_version: 0,
            outbox: VecDeque::new(),
            config,
        })
    }

    /// Create an engine whose data source is chosen by `config.mode`
    pub fn from_query(
        config: EngineConfig,
        query: Arc<dyn PointQuery>,
        feed: Arc<dyn ChangeFeed>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn DataSource> = match config.mode {
            SourceMode::Full => Arc::new(FullIndexSource::new(
                query,
                config.filter.clone(),
                config.retry.clone(),
                config.cluster.clone(),
            )?),
            SourceMode::Windowed => Arc::new(WindowedSource::new(
                query,
                config.filter.clone(),
                config.retry.clone(),
                config.cluster.clone(),
                &config.cache,
            )?),
        };
        tracing::info!(mode = ?config.mode, "Created map engine");
        Self::new(config, source, feed, token_provider)
    }

    /// Acquire the token, subscribe to the feed and load the initial point set
    ///
    /// Any failure moves the engine to [`LifecycleState::Error`].
    pub async fn initialize(&mut self) -> Result<()> {
        match self.try_initialize().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn try_initialize(&mut self) -> Result<()> {
        if self.lifecycle.state() == LifecycleState::Uninitialized {
            let provider = Arc::clone(&self.token_provider);
            let token = self
                .config
                .retry
                .run("get_token", |_| provider.get_token())
                .await?;
            let Some(token) = token.filter(|token| !token.is_empty()) else {
                return Err(MapError::TokenUnavailable);
            };
            self.token = Some(token);
            self.transition(LifecycleEvent::TokenAcquired)?;
        }

        // Subscribe before loading so that no change falls between the two
        self.resubscribe()?;
        let points = self.source.load_points(self.viewport.as_ref()).await?;
        let now = Instant::now();
        self.merger.reconcile(points, now);
        self.installed_for = self.viewport;
        self.source.refresh(self.merger.points().to_vec()).await?;
        self.merger.mark_rebuilt(now);

        self.transition(LifecycleEvent::MapInitialized)?;
        if let Some(viewport) = self.viewport {
            self.start_load(viewport);
        }
        Ok(())
    }

    /// Leave the error state and initialize again
    pub async fn retry(&mut self) -> Result<()> {
        self.transition(LifecycleEvent::Retry)?;
        self.token = None;
        self.initialize().await
    }

    /// Feed a raw camera state
    pub fn observe_viewport(&mut self, viewport: Viewport) {
        self.tracker.observe(viewport, Instant::now());
    }

    /// Feed the duration of one rendered frame
    pub fn record_frame(&mut self, frame_time: Duration) {
        let Some(budget) = self.monitor.record_frame(frame_time) else {
            return;
        };
        let Some(viewport) = self.viewport else {
            return;
        };
        let (_, changed) = self.planner.update(viewport.zoom, Some(budget.fps));
        if changed {
            self.start_load(viewport);
        }
    }

    /// Visibility of the map changed
    pub fn set_visible(&mut self, visible: bool) {
        if visible {
            if self.lifecycle.state() != LifecycleState::Suspended
                || !self.try_transition(LifecycleEvent::VisibilityRegained)
            {
                return;
            }
            if self.lifecycle.is_active() {
                if let Err(err) = self.resubscribe() {
                    self.fail(&err);
                    return;
                }
                if let Some(viewport) = self.viewport {
                    self.start_load(viewport);
                }
            }
        } else {
            if !self.try_transition(LifecycleEvent::VisibilityLost) {
                return;
            }
            self.loader.supersede();
            self.feed_rx = None;
            self.merger.on_connection(ConnectionState::Disconnected);
            let released = self.arena.clear();
            tracing::debug!(released = released.len(), "Released markers");
        }
    }

    /// Switch marker themes and restyle the current frame
    pub fn set_theme(&mut self, theme: Theme) {
        if let Err(err) = theme.validate() {
            tracing::warn!(%err, "Ignoring invalid theme");
            return;
        }
        self.markers.set_theme(theme);
        if let Some(frame) = self.last_frame.clone() {
            self.emit(frame.viewport, frame.plan, frame.features, frame.total_count, frame.stale);
        }
    }

    /// Apply one host input
    pub async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Camera(viewport) => self.observe_viewport(viewport),
            EngineInput::FrameTime(frame_time) => self.record_frame(frame_time),
            EngineInput::Visibility(visible) => {
                self.set_visible(visible);
                if matches!(
                    self.lifecycle.state(),
                    LifecycleState::Uninitialized | LifecycleState::TokenAcquired
                ) && let Err(err) = self.initialize().await
                {
                    tracing::warn!(%err, "Initialization after resume failed");
                }
            }
            EngineInput::Retry => {
                if let Err(err) = self.retry().await {
                    tracing::warn!(%err, "Retry failed");
                }
            }
            EngineInput::SetTheme(theme) => self.set_theme(theme),
        }
    }

    /// Wait for the next update produced by the engine
    pub async fn next_update(&mut self) -> EngineUpdate {
        loop {
            if let Some(update) = self.outbox.pop_front() {
                return update;
            }
            let internal = self.next_internal().await;
            self.handle_internal(internal).await;
        }
    }

    /// Run the engine until the input channel closes
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<EngineInput>,
        updates: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Result<()> {
        if let Err(err) = self.initialize().await {
            tracing::error!(%err, "Initialization failed");
        }

        loop {
            while let Some(update) = self.outbox.pop_front() {
                if updates.send(update).is_err() {
                    tracing::debug!("Update receiver dropped, stopping engine");
                    return Ok(());
                }
            }

            // Only cancel-safe waits are raced; handlers always run to completion
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => break,
                },
                internal = self.next_internal() => self.handle_internal(internal).await,
            }
        }

        self.loader.cancel();
        tracing::info!(state = ?self.lifecycle.state(), "Engine stopped");
        Ok(())
    }

    async fn next_internal(&mut self) -> Internal {
        let active = self.lifecycle.is_active();
        if active && self.merger.needs_reconciliation() {
            return Internal::Reconcile;
        }
        let debounce = self.tracker.deadline();
        let rebuild = if active {
            self.merger.next_rebuild_at()
        } else {
            None
        };

        tokio::select! {
            Some(loaded) = self.loaded.recv() => Internal::Loaded(loaded),
            message = recv_feed(&mut self.feed_rx) => Internal::Feed(message),
            () = sleep_until(debounce) => Internal::Debounce,
            () = sleep_until(rebuild) => Internal::Rebuild,
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Loaded(loaded) => self.on_loaded(loaded),
            Internal::Feed(Some(message)) => self.on_feed_message(message),
            Internal::Feed(None) => {
                self.feed_rx = None;
                self.merger.on_closed();
                self.fail(&MapError::FeedClosed);
            }
            Internal::Debounce => {
                if let Some(viewport) = self.tracker.poll(Instant::now()) {
                    self.viewport = Some(viewport);
                    self.start_load(viewport);
                }
            }
            Internal::Reconcile => self.reconcile().await,
            Internal::Rebuild => self.rebuild().await,
        }
    }

    fn start_load(&mut self, viewport: Viewport) {
        if !self.lifecycle.is_active() {
            return;
        }
        let (plan, _) = self.planner.update(viewport.zoom, self.monitor.fps());
        self.try_transition(LifecycleEvent::LoadStarted);
        self.loader.request(viewport, plan.cap_policy());
    }

    fn on_loaded(&mut self, loaded: LoadedWindow) {
        if !self.loader.accept(&loaded) {
            return;
        }
        match loaded.result {
            Ok(window) => {
                if self.source.mode() == SourceMode::Windowed {
                    // The fresh window replaces the live set wholesale
                    self.merger.install(window.window_points.clone());
                    self.merger.mark_rebuilt(Instant::now());
                    self.installed_for = Some(loaded.viewport);
                }
                self.try_transition(LifecycleEvent::LoadFinished);
                self.emit_window(loaded.viewport, &window);
            }
            Err(err) => self.fail(&err),
        }
    }

    fn on_feed_message(&mut self, message: FeedMessage) {
        let before = self.merger.status();
        if let Some(outcome) = self.merger.handle(message, Instant::now()) {
            tracing::trace!(?outcome, dirty = self.merger.dirty_count(), "Applied change event");
        }
        if before != FeedStatus::Stale && self.merger.status() == FeedStatus::Stale {
            self.republish_stale();
        }
    }

    async fn reconcile(&mut self) {
        match self.source.load_points(self.viewport.as_ref()).await {
            Ok(points) => {
                self.merger.reconcile(points, Instant::now());
                self.installed_for = self.viewport;
            }
            Err(err) => self.fail(&err),
        }
    }

    async fn rebuild(&mut self) {
        let now = Instant::now();
        let points = self.merger.points().to_vec();
        match self.source.refresh(points.clone()).await {
            Ok(version) => tracing::debug!(version, points = points.len(), "Index refreshed"),
            Err(err) => {
                self.fail(&err);
                return;
            }
        }
        self.merger.mark_rebuilt(now);

        let Some(viewport) = self.viewport else {
            return;
        };
        if self.source.mode() == SourceMode::Windowed && self.installed_for != Some(viewport) {
            // The live set belongs to an older window; only a fetch can render this one
            if !self.loader.is_loading() {
                self.start_load(viewport);
            }
            return;
        }
        let (plan, _) = self.planner.update(viewport.zoom, self.monitor.fps());
        match self
            .source
            .render_local(&points, &viewport.bbox, viewport.zoom, &plan.cap_policy())
        {
            Ok(window) => {
                // The local render reflects newer data than any fetch in flight
                self.loader.supersede();
                if self.lifecycle.state() == LifecycleState::DataLoading {
                    self.try_transition(LifecycleEvent::LoadFinished);
                }
                self.emit_window(viewport, &window);
            }
            Err(err) => tracing::warn!(%err, "Local re-render failed"),
        }
    }

    fn resubscribe(&mut self) -> Result<()> {
        let receiver = self.merger.subscribe(self.feed.as_ref())?;
        self.feed_rx = Some(receiver);
        self.merger.on_connection(ConnectionState::Connected);
        Ok(())
    }

    /// Enter the error state, keeping the last good frame on screen
    fn fail(&mut self, err: &MapError) {
        tracing::error!(%err, state = ?self.lifecycle.state(), "Unrecoverable failure");
        self.loader.supersede();
        if self.lifecycle.apply(LifecycleEvent::Failed).is_ok() {
            self.outbox.push_back(EngineUpdate::State {
                state: LifecycleState::Error,
                error: Some(err.to_string()),
            });
        }
        self.republish_stale();
    }

    fn republish_stale(&mut self) {
        let Some(frame) = self.last_frame.as_mut() else {
            return;
        };
        self.frame_version += 1;
        frame.version = self.frame_version;
        frame.diff = MarkerDiff::default();
        frame.stale = true;
        self.outbox.push_back(EngineUpdate::Frame(frame.clone()));
    }

    fn emit_window(&mut self, viewport: Viewport, window: &WindowResult) {
        let plan = self
            .planner
            .current()
            .unwrap_or_else(|| self.planner.evaluate(viewport.zoom, self.monitor.fps()));
        let stale = self.merger.status() != FeedStatus::Live;
        self.emit(viewport, plan, window.features(), window.total_count, stale);
    }

    fn emit(
        &mut self,
        viewport: Viewport,
        plan: RenderPlan,
        features: Vec<Feature>,
        total_count: usize,
        stale: bool,
    ) {
        let diff = self.arena.reconcile(&features, &mut self.markers);
        self.frame_version += 1;
        tracing::debug!(
            version = self.frame_version,
            features = features.len(),
            total_count,
            added = diff.added.len(),
            updated = diff.updated.len(),
            removed = diff.removed.len(),
            stale,
            "Rendered frame"
        );
        let frame = RenderFrame {
            version: self.frame_version,
            viewport,
            plan,
            features,
            diff,
            total_count,
            stale,
        };
        self.last_frame = Some(frame.clone());
        self.outbox.push_back(EngineUpdate::Frame(frame));
    }

    fn transition(&mut self, event: LifecycleEvent) -> Result<LifecycleState> {
        let before = self.lifecycle.state();
        let after = self.lifecycle.apply(event)?;
        if before != after {
            self.outbox.push_back(EngineUpdate::State {
                state: after,
                error: None,
            });
        }
        Ok(after)
    }

    fn try_transition(&mut self, event: LifecycleEvent) -> bool {
        match self.transition(event) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(%err, "Ignoring lifecycle event");
                false
            }
        }
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[inline]
    pub fn feed_status(&self) -> FeedStatus {
        self.merger.status()
    }

    /// Latest accepted viewport
    pub fn viewport(&self) -> Option<&Viewport> {
        self.viewport.as_ref()
    }

    pub fn last_frame(&self) -> Option<&RenderFrame> {
        self.last_frame.as_ref()
    }

    /// Points in the live set
    pub fn point_count(&self) -> usize {
        self.merger.points().len()
    }

    /// The cached session token
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

async fn recv_feed(feed: &mut Option<mpsc::UnboundedReceiver<FeedMessage>>) -> Option<FeedMessage> {
    match feed {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelFeed, InMemoryPointQuery, StaticToken};
    use crate::planner::RenderMode;
    use crate::{Attributes, BoundingBox, ChangeEvent, LatLon, Point};

    const TOPIC: &str = "points";

    fn grid(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| {
                let lat = 45.0 + (i / 40) as f64 * 0.0005;
                let lon = 10.0 + (i % 40) as f64 * 0.0005;
                Point::new(format!("p{i:04}"), lat, lon).with_attributes(Attributes {
                    verified: i % 10 == 0,
                    ..Default::default()
                })
            })
            .collect()
    }

    fn viewport(zoom: f64) -> Viewport {
        let center = LatLon::new(45.0, 10.0);
        Viewport::new(BoundingBox::new(46.0, 44.0, 11.0, 9.0).unwrap(), zoom, center)
    }

    fn engine(
        config: EngineConfig,
        points: Vec<Point>,
    ) -> (MapEngine, Arc<InMemoryPointQuery>, Arc<ChannelFeed>) {
        let query = Arc::new(InMemoryPointQuery::new(points));
        let feed = Arc::new(ChannelFeed::new());
        let engine = MapEngine::from_query(
            config,
            query.clone(),
            feed.clone(),
            Arc::new(StaticToken::new("token")),
        )
        .unwrap();
        (engine, query, feed)
    }

    async fn next_frame(engine: &mut MapEngine) -> RenderFrame {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let EngineUpdate::Frame(frame) = engine.next_update().await {
                    return frame;
                }
            }
        })
        .await
        .expect("no frame produced")
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_frame() {
        let (mut engine, _, _) = engine(EngineConfig::default(), grid(400));
        engine.initialize().await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Initialized);
        assert_eq!(engine.token(), Some("token"));
        assert_eq!(engine.point_count(), 400);

        engine.observe_viewport(viewport(10.0));
        let frame = next_frame(&mut engine).await;
        assert_eq!(engine.state(), LifecycleState::Ready);
        assert_eq!(frame.total_count, 400);
        assert_eq!(frame.plan.mode, RenderMode::Cluster);
        assert_eq!(frame.diff.added.len(), frame.features.len());
        assert!(!frame.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_insert_rerenders() {
        let (mut engine, _, feed) = engine(EngineConfig::default(), grid(100));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(10.0));
        let first = next_frame(&mut engine).await;

        feed.publish(TOPIC, ChangeEvent::insert(Point::new("new", 45.5, 10.5)));
        let second = next_frame(&mut engine).await;
        assert_eq!(second.total_count, first.total_count + 1);
        assert!(second.version > first.version);
        assert_eq!(engine.point_count(), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delivery_does_not_rebuild() {
        let (mut engine, _, feed) = engine(EngineConfig::default(), grid(10));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(10.0));
        next_frame(&mut engine).await;

        let existing = grid(10).remove(3);
        feed.publish(TOPIC, ChangeEvent::insert(existing));
        let result = tokio::time::timeout(Duration::from_secs(5), next_frame(&mut engine)).await;
        assert!(result.is_err(), "an idempotent insert must not produce a frame");
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_cap_at_25_fps() {
        let (mut engine, _, _) = engine(EngineConfig::default(), grid(1_000));
        engine.initialize().await.unwrap();
        for _ in 0..30 {
            engine.record_frame(Duration::from_millis(40));
        }
        engine.observe_viewport(viewport(16.0));
        let frame = next_frame(&mut engine).await;
        assert_eq!(frame.plan.mode, RenderMode::Flat);
        assert_eq!(frame.plan.cap, 100);
        assert_eq!(frame.total_count, 1_000);
        assert_eq!(frame.features.len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fps_drop_replans() {
        let (mut engine, _, _) = engine(EngineConfig::default(), grid(1_000));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(16.0));
        let healthy = next_frame(&mut engine).await;
        assert_eq!(healthy.features.len(), 500);

        for _ in 0..30 {
            engine.record_frame(Duration::from_millis(40));
        }
        let degraded = next_frame(&mut engine).await;
        assert_eq!(degraded.features.len(), 100);
        assert_eq!(degraded.diff.removed.len(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_marks_stale_then_reconciles() {
        let (mut engine, query, feed) = engine(EngineConfig::default(), grid(50));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(10.0));
        next_frame(&mut engine).await;

        feed.set_connection(TOPIC, ConnectionState::Disconnected);
        let stale = next_frame(&mut engine).await;
        assert!(stale.stale);
        assert_eq!(engine.feed_status(), FeedStatus::Stale);

        // Missed while disconnected
        query.apply(&ChangeEvent::insert(Point::new("missed", 45.2, 10.2))).await;
        feed.set_connection(TOPIC, ConnectionState::Connected);
        let fresh = next_frame(&mut engine).await;
        assert!(!fresh.stale);
        assert_eq!(fresh.total_count, 51);
        assert_eq!(engine.feed_status(), FeedStatus::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_last_good_frame() {
        let config = EngineConfig {
            mode: SourceMode::Windowed,
            ..Default::default()
        };
        let (mut engine, query, _) = engine(config, grid(200));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(10.0));
        let good = next_frame(&mut engine).await;

        query.fail_next(3);
        engine.observe_viewport(viewport(12.0));
        let mut error_reported = false;
        let frame = loop {
            match engine.next_update().await {
                EngineUpdate::State {
                    state: LifecycleState::Error,
                    error,
                } => {
                    assert!(error.is_some());
                    error_reported = true;
                }
                EngineUpdate::Frame(frame) => break frame,
                EngineUpdate::State { .. } => {}
            }
        };
        assert!(error_reported);
        assert_eq!(engine.state(), LifecycleState::Error);
        assert!(frame.stale);
        assert_eq!(frame.features, good.features);

        // Manual retry recovers
        engine.retry().await.unwrap();
        let recovered = next_frame(&mut engine).await;
        assert!(!recovered.stale);
        assert_eq!(engine.state(), LifecycleState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_rebuild_during_pan_keeps_new_fetch() {
        let config = EngineConfig {
            mode: SourceMode::Windowed,
            ..Default::default()
        };
        let mut points = grid(100);
        points.extend((0..30).map(|i| Point::new(format!("b{i:02}"), 10.0 + i as f64 * 0.01, 50.0)));
        let query = Arc::new(InMemoryPointQuery::new(points).with_latency(Duration::from_millis(1500)));
        let feed = Arc::new(ChannelFeed::new());
        let mut engine = MapEngine::from_query(
            config,
            query,
            feed.clone(),
            Arc::new(StaticToken::new("token")),
        )
        .unwrap();
        engine.initialize().await.unwrap();

        engine.observe_viewport(viewport(10.0));
        let first = next_frame(&mut engine).await;
        assert_eq!(first.total_count, 100);

        // The rebuild for this change falls due while the fetch for the pan is in flight
        feed.publish(TOPIC, ChangeEvent::insert(Point::new("new", 45.5, 10.5)));
        let panned = Viewport::new(
            BoundingBox::new(11.0, 9.0, 51.0, 49.0).unwrap(),
            10.0,
            LatLon::new(10.0, 50.0),
        );
        engine.observe_viewport(panned);

        let frame = next_frame(&mut engine).await;
        assert_eq!(frame.viewport, panned);
        assert_eq!(frame.total_count, 30);
        assert!(!frame.stale);
        assert_eq!(engine.point_count(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_is_terminal() {
        let mut engine = MapEngine::from_query(
            EngineConfig::default(),
            Arc::new(InMemoryPointQuery::new(grid(5))),
            Arc::new(ChannelFeed::new()),
            Arc::new(StaticToken::none()),
        )
        .unwrap();
        assert!(matches!(
            engine.initialize().await,
            Err(MapError::TokenUnavailable)
        ));
        assert_eq!(engine.state(), LifecycleState::Error);
        assert!(engine.retry().await.is_err());
        assert_eq!(engine.state(), LifecycleState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_and_resume() {
        let (mut engine, _, _) = engine(EngineConfig::default(), grid(50));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(10.0));
        next_frame(&mut engine).await;

        engine.set_visible(false);
        assert_eq!(engine.state(), LifecycleState::Suspended);
        assert_eq!(engine.feed_status(), FeedStatus::Stale);

        engine.set_visible(true);
        let frame = next_frame(&mut engine).await;
        assert!(!frame.diff.added.is_empty());
        assert_eq!(engine.feed_status(), FeedStatus::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_theme_change_restyles() {
        let (mut engine, _, _) = engine(EngineConfig::default(), grid(50));
        engine.initialize().await.unwrap();
        engine.observe_viewport(viewport(10.0));
        let first = next_frame(&mut engine).await;

        engine.set_theme(Theme {
            point_size: 40.0,
            ..Default::default()
        });
        let restyled = next_frame(&mut engine).await;
        assert_eq!(restyled.features, first.features);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop() {
        let (engine, _, _) = engine(EngineConfig::default(), grid(100));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(engine.run(input_rx, update_tx));

        input_tx.send(EngineInput::Camera(viewport(10.0))).unwrap();
        let frame = loop {
            match update_rx.recv().await {
                Some(EngineUpdate::Frame(frame)) => break frame,
                Some(_) => {}
                None => panic!("engine stopped"),
            }
        };
        assert_eq!(frame.total_count, 100);

        drop(input_tx);
        handle.await.unwrap().unwrap();
    }
}
