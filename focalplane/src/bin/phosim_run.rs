//! Simulate one observation's focal plane.
//!
//! Loads an instance catalog, generates the per-observation files, expands the
//! focal plane into per-chip, per-exposure raytrace jobs and runs them on the
//! selected execution backend.
//!
//! The simulator installation is found through `$PHOSIMDIR`, or through the
//! location of `raytrace` on `PATH`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use focalplane::backend::dag::DEFAULT_SUBMIT_PROGRAM;
use focalplane::context::discover_install_root;
use focalplane::layout::ChipFilter;
use focalplane::{
    run_observation, Backend, BackendConfig, ContextOptions, ExecutionContext, RunOptions,
    Universe,
};

/// Where raytrace jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Grid {
    /// Local worker pool
    #[value(alias = "local")]
    No,
    /// One shell script per job, handed to a batch submit command
    Cluster,
    /// HTCondor DAGMan job graph
    Condor,
}

#[derive(Parser, Debug)]
#[command(
    name = "phosim_run",
    about = "Runs the raytrace and readout jobs for one instance catalog",
    long_about = None
)]
struct Args {
    /// Instance catalog describing the observation
    instance_catalog: PathBuf,

    /// Extra physics commands file
    #[arg(short = 'c', long = "command")]
    extra_commands: Option<PathBuf>,

    /// Number of local worker processes
    #[arg(short = 'p', long = "proc", default_value_t = 1)]
    processes: usize,

    /// Output root; output/, work/ and image/data/ are created below it
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Simulator installation root (default: $PHOSIMDIR or found via PATH)
    #[arg(long)]
    install_root: Option<PathBuf>,

    /// Binaries directory (default: <install root>/bin)
    #[arg(short, long = "bin")]
    bin_dir: Option<PathBuf>,

    /// Data directory (default: <install root>/data)
    #[arg(short, long = "data")]
    data_dir: Option<PathBuf>,

    /// SED directory (default: <data>/SEDs)
    #[arg(long = "sed")]
    sed_dir: Option<PathBuf>,

    /// Chips to simulate: "all" or ids separated by '|'
    #[arg(short, long = "sensor", default_value = "all")]
    sensors: ChipFilter,

    /// Instrument directory name under the data directory
    #[arg(short, long, default_value = "lsst")]
    instrument: String,

    /// Execution backend
    #[arg(short, long, value_enum, default_value_t = Grid::No)]
    grid: Grid,

    /// Condor universe
    #[arg(short, long, value_enum, default_value_t = Universe::Standard)]
    universe: Universe,

    /// Condor raytrace checkpoints per job (0 disables checkpointing)
    #[arg(long, default_value_t = 12)]
    checkpoint: u32,

    /// Skip the electrons-to-ADC readout
    #[arg(long)]
    no_e2adc: bool,

    /// Keep atmosphere screens and copy them to the output directory
    #[arg(short, long)]
    keep_screens: bool,

    /// Regenerate atmosphere screens even if they already exist
    #[arg(short, long)]
    regenerate_screens: bool,

    /// Delete each job's parameter files once it succeeds
    #[arg(long)]
    clean_job_files: bool,

    /// Empty the working directory before starting
    #[arg(long)]
    fresh: bool,

    /// Command that cluster job scripts are passed to
    #[arg(long, default_value = "sh")]
    cluster_submit: String,

    /// Program that submits the condor job graph
    #[arg(long, default_value = DEFAULT_SUBMIT_PROGRAM)]
    dag_submit: String,

    /// Write the condor job graph without submitting it
    #[arg(long)]
    no_dag_submit: bool,
}

impl Args {
    fn backend(&self) -> BackendConfig {
        match self.grid {
            Grid::No => BackendConfig::Local {
                concurrency: self.processes,
            },
            Grid::Cluster => BackendConfig::Cluster {
                submit_command: Some(self.cluster_submit.clone()),
            },
            Grid::Condor => BackendConfig::DistributedBatch {
                universe: self.universe,
                checkpoint: self.checkpoint,
                submit_program: (!self.no_dag_submit).then(|| self.dag_submit.clone()),
            },
        }
    }
}

fn run(args: Args) -> focalplane::Result<bool> {
    let install_root = match &args.install_root {
        Some(root) => root.clone(),
        None => discover_install_root()?,
    };
    log::debug!("Simulator installation at {}", install_root.display());

    let ctx = ExecutionContext::resolve(ContextOptions {
        install_root,
        output_root: args.output.clone(),
        bin_dir: args.bin_dir.clone(),
        data_dir: args.data_dir.clone(),
        sed_dir: args.sed_dir.clone(),
        instrument: args.instrument.clone(),
        chips: args.sensors.clone(),
        backend: args.backend(),
        options: RunOptions {
            run_e2adc: !args.no_e2adc,
            keep_screens: args.keep_screens,
            regenerate_screens: args.regenerate_screens,
            clean_job_files: args.clean_job_files,
        },
        fresh_work_dir: args.fresh,
    })?;

    let mut backend = Backend::from_context(&ctx)?;
    let outcome = run_observation(
        &ctx,
        &args.instance_catalog,
        args.extra_commands.as_deref(),
        &mut backend,
    )?;

    for failure in &outcome.report.failures {
        log::error!("Job {} failed: {}", failure.job, failure.error);
    }
    log::info!(
        "Observation {} finished: {} of {} jobs completed, {} handed off, {} chips skipped",
        outcome.observation_id,
        outcome.report.completed,
        outcome.report.submitted,
        outcome.report.handed_off,
        outcome.skipped.len()
    );
    Ok(outcome.is_success())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
