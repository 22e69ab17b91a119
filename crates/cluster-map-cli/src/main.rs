//! Cluster Map - Headless driver for the live clustering engine
//!
//! Loads points from a JSON file (or generates them), then replays a camera path,
//! synthetic frame times and a live change feed through [`cluster_map_lib::MapEngine`].

mod error;
mod logging;
mod settings;
mod simulation;

use clap::Parser;
use error::{CliError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use settings::Settings;
use std::process::ExitCode;

fn main() -> ExitCode {
    logging::setup_logging();
    let settings = Settings::parse();

    match run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "cluster-map failed");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: Settings) -> Result<()> {
    let config = settings.engine_config()?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let points = match settings.load_points()? {
        Some(points) => points,
        None => simulation::synthetic_points(settings.synthetic_points, &mut rng),
    };
    tracing::info!(
        points = points.len(),
        mode = ?config.mode,
        frames = settings.frames,
        seed = settings.seed,
        "Starting simulation"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let summary = runtime.block_on(simulation::run(
        config,
        points,
        settings.frames,
        settings.frame_interval(),
        settings.changes_per_second,
        settings.json,
        &mut rng,
    ))?;

    if settings.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        tracing::info!(
            frames = summary.frames_rendered,
            stale = summary.stale_frames,
            flat = summary.flat_frames,
            max_features = summary.max_features,
            changes = summary.changes_published,
            state = ?summary.final_state,
            "Summary"
        );
    }

    match summary.last_error {
        Some(error) => Err(CliError::Engine(error)),
        None => Ok(()),
    }
}
