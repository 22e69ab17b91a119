use crate::error::{CliError, Result};
use clap::{Parser, ValueEnum};
use cluster_map_lib::{EngineConfig, Point, SourceMode};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Cluster Map - Replays a camera path, frame times and live changes through the clustering engine
pub struct Settings {
    /// JSON file with an array of points (synthetic points are generated otherwise)
    #[clap(short, long, value_name = "FILE")]
    pub points: Option<PathBuf>,

    /// JSON file with an engine configuration; missing fields keep their defaults
    #[clap(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Point retrieval strategy
    #[clap(long, value_enum)]
    pub mode: Option<Mode>,

    /// Number of synthetic points when no points file is given
    #[clap(long, default_value = "20000")]
    pub synthetic_points: usize,

    /// Number of frames to simulate
    #[clap(long, default_value = "600")]
    pub frames: usize,

    /// Wall-clock time between simulated frames in milliseconds
    #[clap(long, default_value = "16")]
    pub frame_interval_ms: u64,

    /// Average number of change events published per second
    #[clap(long, default_value = "20.0")]
    pub changes_per_second: f64,

    /// Seed for synthetic points, frame times and changes
    #[clap(long, default_value = "42")]
    pub seed: u64,

    /// Cluster radius in pixels
    #[clap(long)]
    pub radius: Option<f64>,

    /// Minimum number of points that form a cluster
    #[clap(long)]
    pub min_points: Option<usize>,

    /// FPS under which the map always clusters
    #[clap(long)]
    pub low_fps: Option<f64>,

    /// Zoom from which individual points are shown
    #[clap(long)]
    pub zoom_threshold: Option<f64>,

    /// Print every rendered frame as a JSON line on stdout
    #[clap(long, default_value = "false")]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Full,
    Windowed,
}

impl From<Mode> for SourceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Full => SourceMode::Full,
            Mode::Windowed => SourceMode::Windowed,
        }
    }
}

impl Settings {
    /// Engine configuration from the config file, with command line overrides applied
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config: EngineConfig = match &self.config {
            Some(path) => read_json(path)?,
            None => EngineConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(radius) = self.radius {
            config.cluster.radius = radius;
        }
        if let Some(min_points) = self.min_points {
            config.cluster.min_points = min_points;
        }
        if let Some(low_fps) = self.low_fps {
            config.planner.low_fps_threshold = low_fps;
        }
        if let Some(zoom) = self.zoom_threshold {
            config.planner.individual_points_zoom_threshold = zoom;
        }

        config.validate()?;
        Ok(config)
    }

    /// Points from the points file, if one was given
    pub fn load_points(&self) -> Result<Option<Vec<Point>>> {
        self.points.as_deref().map(read_json).transpose()
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}
