//! Synthetic workload: points, a camera path, frame times and live changes

use crate::error::Result;
use cluster_map_lib::{
    Attributes, BoundingBox, ChangeEvent, ChannelFeed, EngineConfig, EngineInput, EngineUpdate,
    InMemoryPointQuery, LatLon, LifecycleState, MapEngine, Point, RenderFrame, RenderMode,
    StaticToken, Viewport, utils::TILE_SIZE,
};
use rand::Rng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cities the synthetic points and the camera gravitate around
const HOT_SPOTS: [(f64, f64); 5] = [
    (51.507, -0.128),
    (48.857, 2.352),
    (40.417, -3.704),
    (52.520, 13.405),
    (41.903, 12.496),
];

/// Screen size the camera path simulates
const SCREEN_WIDTH: f64 = 1280.0;
const SCREEN_HEIGHT: f64 = 720.0;

/// Generate `count` points scattered around the hot spots
pub fn synthetic_points(count: usize, rng: &mut impl Rng) -> Vec<Point> {
    (0..count)
        .map(|i| random_point(format!("p{i}"), rng))
        .collect()
}

fn random_point(id: String, rng: &mut impl Rng) -> Point {
    let (lat, lon) = HOT_SPOTS[rng.gen_range(0..HOT_SPOTS.len())];
    // Sum of two uniforms gives a denser core
    let spread = 0.25;
    let lat = lat + (rng.gen_range(-spread..spread) + rng.gen_range(-spread..spread)) / 2.0;
    let lon = lon + (rng.gen_range(-spread..spread) + rng.gen_range(-spread..spread)) * 0.75;
    Point::new(id, lat, lon).with_attributes(Attributes {
        verified: rng.gen_bool(0.3),
        vote_score: rng.gen_range(-5..40),
        category: ["cafe", "park", "museum", "shop"][rng.gen_range(0..4)].to_string(),
        title: String::new(),
    })
}

/// Deterministic zoom-in/zoom-out sweep from one hot spot to the next
///
/// The camera holds every position for `hold` frames so that the debounced
/// viewport settles between moves.
pub struct CameraPath {
    frames: usize,
    hold: usize,
    min_zoom: f64,
    max_zoom: f64,
}

impl CameraPath {
    pub fn new(frames: usize, hold: usize) -> Self {
        Self {
            frames: frames.max(2),
            hold: hold.max(1),
            min_zoom: 3.0,
            max_zoom: 17.0,
        }
    }

    pub fn viewport_at(&self, frame: usize) -> Viewport {
        let frame = frame - frame % self.hold;
        let t = (frame % self.frames) as f64 / (self.frames - 1) as f64;
        // Triangle wave: zoom in during the first half, out during the second
        let phase = 1.0 - (2.0 * t - 1.0).abs();
        let zoom = self.min_zoom + (self.max_zoom - self.min_zoom) * phase;

        let leg = (t * HOT_SPOTS.len() as f64).floor() as usize % HOT_SPOTS.len();
        let (lat, lon) = HOT_SPOTS[leg];
        let center = LatLon::new(lat, lon);

        let degrees_per_pixel = 360.0 / (TILE_SIZE * 2f64.powf(zoom));
        let lon_span = SCREEN_WIDTH * degrees_per_pixel;
        let lat_span = SCREEN_HEIGHT * degrees_per_pixel * lat.to_radians().cos();
        Viewport::new(BoundingBox::around(center, lat_span, lon_span), zoom, center)
    }
}

/// Synthetic frame cost that grows with the number of drawn markers
pub struct FrameClock {
    base: Duration,
    per_marker: Duration,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(6),
            per_marker: Duration::from_micros(45),
        }
    }
}

impl FrameClock {
    pub fn frame_time(&self, markers: usize, rng: &mut impl Rng) -> Duration {
        let jitter = Duration::from_micros(rng.gen_range(0..2_000));
        self.base + self.per_marker * markers as u32 + jitter
    }
}

/// Random inserts, updates and deletes over a mirror of the live set
pub struct ChangeGenerator {
    points: Vec<Point>,
    next_id: usize,
}

impl ChangeGenerator {
    pub fn new(points: &[Point]) -> Self {
        Self {
            points: points.to_vec(),
            next_id: 0,
        }
    }

    pub fn next_event(&mut self, rng: &mut impl Rng) -> ChangeEvent {
        let roll: f64 = rng.r#gen();
        if self.points.is_empty() || roll < 0.3 {
            let point = random_point(format!("live-{}", self.next_id), rng);
            self.next_id += 1;
            self.points.push(point.clone());
            return ChangeEvent::insert(point);
        }

        let index = rng.gen_range(0..self.points.len());
        if roll < 0.8 {
            let point = &mut self.points[index];
            point.lat = (point.lat + rng.gen_range(-0.001..0.001)).clamp(-85.0, 85.0);
            point.lon = (point.lon + rng.gen_range(-0.001..0.001)).clamp(-180.0, 180.0);
            point.attributes.vote_score += rng.gen_range(-1..3);
            if rng.gen_bool(0.05) {
                point.attributes.verified = !point.attributes.verified;
            }
            ChangeEvent::update(point.clone())
        } else {
            ChangeEvent::delete(self.points.swap_remove(index))
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

/// One rendered frame as printed in JSON mode
#[derive(Debug, Serialize)]
struct FrameLine {
    version: u64,
    zoom: f64,
    mode: RenderMode,
    cap: usize,
    clusters: usize,
    points: usize,
    total_count: usize,
    added: usize,
    updated: usize,
    removed: usize,
    stale: bool,
}

impl From<&RenderFrame> for FrameLine {
    fn from(frame: &RenderFrame) -> Self {
        let clusters = frame.features.iter().filter(|f| f.is_cluster()).count();
        Self {
            version: frame.version,
            zoom: frame.viewport.zoom,
            mode: frame.plan.mode,
            cap: frame.plan.cap,
            clusters,
            points: frame.features.len() - clusters,
            total_count: frame.total_count,
            added: frame.diff.added.len(),
            updated: frame.diff.updated.len(),
            removed: frame.diff.removed.len(),
            stale: frame.stale,
        }
    }
}

/// Totals of one simulation run
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub frames_rendered: usize,
    pub stale_frames: usize,
    pub flat_frames: usize,
    pub max_features: usize,
    pub changes_published: usize,
    pub state_changes: usize,
    pub final_state: Option<LifecycleState>,
    pub last_error: Option<String>,
}

impl Summary {
    fn record(&mut self, update: &EngineUpdate, json: bool) -> Result<()> {
        match update {
            EngineUpdate::Frame(frame) => {
                self.frames_rendered += 1;
                self.stale_frames += usize::from(frame.stale);
                self.flat_frames += usize::from(frame.plan.mode == RenderMode::Flat);
                self.max_features = self.max_features.max(frame.features.len());
                let line = FrameLine::from(frame);
                if json {
                    let mut stdout = std::io::stdout().lock();
                    serde_json::to_writer(&mut stdout, &line)?;
                    // A closed stdout only loses output
                    let _ = writeln!(stdout);
                } else {
                    tracing::info!(
                        version = line.version,
                        zoom = format!("{:.2}", line.zoom),
                        mode = ?line.mode,
                        clusters = line.clusters,
                        points = line.points,
                        total = line.total_count,
                        stale = line.stale,
                        "Frame"
                    );
                }
            }
            EngineUpdate::State { state, error } => {
                self.state_changes += 1;
                self.final_state = Some(*state);
                if let Some(error) = error {
                    tracing::error!(%error, "Engine entered error state");
                    self.last_error = Some(error.clone());
                }
            }
        }
        Ok(())
    }
}

/// Send the camera and frame time of one frame; false once the engine has shut down
fn send_frame(
    inputs: &mpsc::UnboundedSender<EngineInput>,
    viewport: Viewport,
    frame_time: Duration,
) -> bool {
    inputs.send(EngineInput::Camera(viewport)).is_ok()
        && inputs.send(EngineInput::FrameTime(frame_time)).is_ok()
}

/// Run the whole workload against a fresh engine
pub async fn run(
    config: EngineConfig,
    points: Vec<Point>,
    frames: usize,
    frame_interval: Duration,
    changes_per_second: f64,
    json: bool,
    rng: &mut StdRng,
) -> Result<Summary> {
    let topic = config.merge.topic.clone();
    // Hold each camera position for twice the debounce delay
    let hold = (2 * config.viewport.debounce.as_millis() / frame_interval.as_millis().max(1)) as usize;
    let query = Arc::new(InMemoryPointQuery::new(points.clone()));
    let feed = Arc::new(ChannelFeed::new());
    let engine = MapEngine::from_query(
        config,
        query.clone(),
        feed.clone(),
        Arc::new(StaticToken::new("cluster-map-cli")),
    )?;

    let (inputs, input_rx) = mpsc::unbounded_channel();
    let (update_tx, mut updates) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(engine.run(input_rx, update_tx));

    let camera = CameraPath::new(frames, hold + 1);
    let clock = FrameClock::default();
    let mut changes = ChangeGenerator::new(&points);
    let change_probability = (changes_per_second * frame_interval.as_secs_f64()).clamp(0.0, 1.0);

    let mut summary = Summary::default();
    let mut drawn = 0;
    let mut interval = tokio::time::interval(frame_interval);
    for frame in 0..frames {
        interval.tick().await;

        let frame_time = clock.frame_time(drawn, rng);
        if !send_frame(&inputs, camera.viewport_at(frame), frame_time) {
            tracing::warn!(frame, "Engine stopped early");
            break;
        }

        if rng.gen_bool(change_probability) {
            let event = changes.next_event(rng);
            query.apply(&event).await;
            feed.publish(&topic, event);
            summary.changes_published += 1;
        }

        while let Ok(update) = updates.try_recv() {
            if let EngineUpdate::Frame(frame) = &update {
                drawn = frame.features.len();
            }
            summary.record(&update, json)?;
        }
    }

    drop(inputs);
    engine_task.await??;
    while let Some(update) = updates.recv().await {
        summary.record(&update, json)?;
    }
    tracing::info!(live_points = changes.len(), "Simulation finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_camera_path_sweeps_zoom() {
        let camera = CameraPath::new(101, 1);
        let start = camera.viewport_at(0);
        let middle = camera.viewport_at(50);
        let end = camera.viewport_at(100);
        assert!((start.zoom - 3.0).abs() < 1e-9);
        assert!((middle.zoom - 17.0).abs() < 1e-9);
        assert!((end.zoom - 3.0).abs() < 1e-9);
        assert!(middle.bbox.north - middle.bbox.south < start.bbox.north - start.bbox.south);
        assert!(start.bbox.contains(start.center.lat, start.center.lon));
    }

    #[test]
    fn test_send_frame_stops_after_shutdown() {
        let camera = CameraPath::new(10, 1);
        let (inputs, mut input_rx) = mpsc::unbounded_channel();
        assert!(send_frame(&inputs, camera.viewport_at(0), Duration::from_millis(16)));
        assert!(matches!(input_rx.try_recv(), Ok(EngineInput::Camera(_))));
        assert!(matches!(input_rx.try_recv(), Ok(EngineInput::FrameTime(_))));

        drop(input_rx);
        assert!(!send_frame(&inputs, camera.viewport_at(1), Duration::from_millis(16)));
    }

    #[test]
    fn test_camera_holds_position() {
        let camera = CameraPath::new(100, 10);
        assert_eq!(camera.viewport_at(20), camera.viewport_at(29));
        assert_ne!(camera.viewport_at(29), camera.viewport_at(30));
    }

    #[test]
    fn test_frame_time_grows_with_markers() {
        let mut rng = StdRng::seed_from_u64(1);
        let clock = FrameClock::default();
        let light = clock.frame_time(0, &mut rng);
        let heavy = clock.frame_time(500, &mut rng);
        assert!(heavy > light + Duration::from_millis(15));
    }

    #[test]
    fn test_changes_track_live_set() {
        let mut rng = StdRng::seed_from_u64(7);
        let points = synthetic_points(50, &mut rng);
        assert!(points.iter().all(|p| p.validate().is_ok()));

        let mut changes = ChangeGenerator::new(&points);
        let mut expected = points.len();
        for _ in 0..200 {
            match changes.next_event(&mut rng).kind {
                cluster_map_lib::ChangeKind::Insert => expected += 1,
                cluster_map_lib::ChangeKind::Delete => expected -= 1,
                cluster_map_lib::ChangeKind::Update => {}
            }
        }
        assert_eq!(changes.len(), expected);
    }

    #[test]
    fn test_same_seed_same_points() {
        let a = synthetic_points(20, &mut StdRng::seed_from_u64(3));
        let b = synthetic_points(20, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_short_run() {
        let mut rng = StdRng::seed_from_u64(11);
        let points = synthetic_points(500, &mut rng);
        let summary = run(
            EngineConfig::default(),
            points,
            40,
            Duration::from_millis(10),
            50.0,
            false,
            &mut rng,
        )
        .await
        .unwrap();
        assert!(summary.frames_rendered > 0);
        assert_eq!(summary.stale_frames, 0);
        assert!(summary.last_error.is_none());
    }
}
