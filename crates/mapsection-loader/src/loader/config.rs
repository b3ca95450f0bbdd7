use super::job::Screen;
use anyhow::{Context, bail};
use clap::Parser;
use mapsection::{PipelineConfig, RPoint, RSize, RValue, SizeInt, SubdivisionId};
use std::time::Duration;

/// Runtime configuration for the `mapsection-loader` binary.
///
/// Describes the screen to load, the iteration targets of each pass and the
/// pipeline tuning. Every value can come from a CLI flag or an environment
/// variable (a `.env` file is honoured).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mapsection-loader",
    version,
    about = "Loads a screen of map sections through the mapsection pipeline"
)]
pub struct CliArgs {
    /// Number of block columns on screen.
    ///
    /// Environment variable: `SCREEN_COLUMNS`
    #[arg(long, env = "SCREEN_COLUMNS", default_value_t = 8)]
    pub columns: u32,

    /// Number of block rows on screen.
    ///
    /// Environment variable: `SCREEN_ROWS`
    #[arg(long, env = "SCREEN_ROWS", default_value_t = 6)]
    pub rows: u32,

    /// Edge length of a square block, in pixels.
    ///
    /// Environment variable: `BLOCK_SIZE`
    #[arg(long, env = "BLOCK_SIZE", default_value_t = 128)]
    pub block_size: u32,

    /// Real part of the screen centre.
    ///
    /// Environment variable: `CENTER_X`
    #[arg(long, env = "CENTER_X", default_value_t = -0.75, allow_hyphen_values = true)]
    pub center_x: f64,

    /// Imaginary part of the screen centre.
    ///
    /// Environment variable: `CENTER_Y`
    #[arg(long, env = "CENTER_Y", default_value_t = 0.0, allow_hyphen_values = true)]
    pub center_y: f64,

    /// Distance between adjacent samples in map coordinates.
    ///
    /// Environment variable: `SAMPLE_DELTA`
    #[arg(long, env = "SAMPLE_DELTA", default_value_t = 0.0025)]
    pub sample_delta: f64,

    /// Fractional bits kept when converting coordinates to exact values.
    ///
    /// Environment variable: `COORD_PRECISION`
    #[arg(long, env = "COORD_PRECISION", default_value_t = 40)]
    pub precision: u8,

    /// Iteration target of the first pass.
    ///
    /// Environment variable: `TARGET_ITERATIONS`
    #[arg(long, env = "TARGET_ITERATIONS", default_value_t = 400)]
    pub target_iterations: u32,

    /// Iteration target of an optional second pass over the same screen.
    ///
    /// Must exceed `TARGET_ITERATIONS`. Tiles cached by the first pass are
    /// refined rather than recomputed.
    ///
    /// Environment variable: `REFINE_ITERATIONS`
    #[arg(long, env = "REFINE_ITERATIONS")]
    pub refine_iterations: Option<u32>,

    /// Extra jobs submitted alongside each pass for the same screen.
    ///
    /// Their tiles join the in-flight generations of the first job.
    ///
    /// Environment variable: `DUPLICATE_JOBS`
    #[arg(long, env = "DUPLICATE_JOBS", default_value_t = 0)]
    pub duplicate_jobs: usize,

    /// Generator parallelism. Defaults to the number of logical cores.
    ///
    /// Environment variable: `PARALLELISM`
    #[arg(long, env = "PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Reserve one core for the rest of the process instead of running a
    /// generator worker on every core.
    ///
    /// Environment variable: `RESERVE_CORE`
    #[arg(long, env = "RESERVE_CORE", default_value_t = false)]
    pub reserve_core: bool,

    /// Skip cache lookups; every tile is generated.
    ///
    /// Environment variable: `NO_REPO`
    #[arg(long, env = "NO_REPO", default_value_t = false)]
    pub no_repo: bool,

    /// Capacity of the request queue.
    ///
    /// Environment variable: `REQUEST_QUEUE_CAPACITY`
    #[arg(
        long,
        env = "REQUEST_QUEUE_CAPACITY",
        default_value_t = PipelineConfig::DEFAULT_REQUEST_QUEUE_CAPACITY
    )]
    pub request_queue_capacity: usize,

    /// Capacity of the generator queue.
    ///
    /// Environment variable: `GENERATOR_QUEUE_CAPACITY`
    #[arg(
        long,
        env = "GENERATOR_QUEUE_CAPACITY",
        default_value_t = PipelineConfig::DEFAULT_GENERATOR_QUEUE_CAPACITY
    )]
    pub generator_queue_capacity: usize,

    /// Seconds each stage may take to drain on shutdown.
    ///
    /// Environment variable: `STOP_TIMEOUT_SECS`
    #[arg(long, env = "STOP_TIMEOUT_SECS", default_value_t = 120)]
    pub stop_timeout_secs: u64,

    /// Milliseconds between progress reports.
    ///
    /// Environment variable: `PROGRESS_INTERVAL_MS`
    #[arg(long, env = "PROGRESS_INTERVAL_MS", default_value_t = 1000)]
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub screen: Screen,
    pub targets: Vec<u32>,
    pub duplicate_jobs: usize,
    pub pipeline: PipelineConfig,
    pub progress_interval: Duration,
}

impl TryFrom<CliArgs> for LoaderConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.columns == 0 || args.rows == 0 {
            bail!("SCREEN_COLUMNS and SCREEN_ROWS must be greater than 0");
        }
        if args.block_size == 0 {
            bail!("BLOCK_SIZE must be greater than 0");
        }
        if !(args.sample_delta.is_finite() && args.sample_delta > 0.0) {
            bail!("SAMPLE_DELTA must be a positive number, got {}", args.sample_delta);
        }
        if args.target_iterations == 0 {
            bail!("TARGET_ITERATIONS must be greater than 0");
        }
        if let Some(refine) = args.refine_iterations {
            if refine <= args.target_iterations {
                bail!(
                    "REFINE_ITERATIONS ({}) must exceed TARGET_ITERATIONS ({})",
                    refine,
                    args.target_iterations
                );
            }
        }
        if args.progress_interval_ms == 0 {
            bail!("PROGRESS_INTERVAL_MS must be greater than 0");
        }

        let delta = RValue::from_f64(args.sample_delta, args.precision)
            .context("SAMPLE_DELTA is not representable")?;
        if delta.is_zero() {
            bail!(
                "SAMPLE_DELTA ({}) rounds to zero at COORD_PRECISION {}",
                args.sample_delta,
                args.precision
            );
        }
        let center_x = RValue::from_f64(args.center_x, args.precision)
            .context("CENTER_X is not representable")?;
        let center_y = RValue::from_f64(args.center_y, args.precision)
            .context("CENTER_Y is not representable")?;
        let center = RPoint::new(center_x, center_y);
        let delta = RSize::square(delta);

        let pipeline = PipelineConfig {
            request_queue_capacity: args.request_queue_capacity,
            generator_queue_capacity: args.generator_queue_capacity,
            parallelism: args.parallelism,
            use_all_cores: !args.reserve_core,
            use_repo: !args.no_repo,
            stop_timeout: Duration::from_secs(args.stop_timeout_secs),
            ..PipelineConfig::default()
        };
        pipeline.validate()?;

        let mut targets = vec![args.target_iterations];
        targets.extend(args.refine_iterations);

        Ok(Self {
            screen: Screen {
                subdivision_id: SubdivisionId::new(format!("d{}", delta.width)),
                columns: args.columns,
                rows: args.rows,
                block_size: SizeInt::new(args.block_size, args.block_size),
                center,
                delta,
            },
            targets,
            duplicate_jobs: args.duplicate_jobs,
            pipeline,
            progress_interval: Duration::from_millis(args.progress_interval_ms),
        })
    }
}
