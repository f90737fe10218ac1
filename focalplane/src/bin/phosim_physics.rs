//! Physics trade-study recipe: simulate the example star with the major
//! physics effects and the background switched off.
//!
//! Prints the `phosim_run` command; `--run` also executes it.

use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::Parser;
use focalplane::context::discover_install_root;
use focalplane::physics::{PhysicsRecipe, PHYSICS_OVERRIDES};

#[derive(Parser, Debug)]
#[command(
    name = "phosim_physics",
    about = "Writes a physics-off extra commands file and runs phosim_run with it",
    long_about = None
)]
struct Args {
    /// Simulator installation root (default: $PHOSIMDIR or found via PATH)
    #[arg(long)]
    install_root: Option<PathBuf>,

    /// Base commands file (default: <install root>/examples/nobackground)
    #[arg(long)]
    base: Option<PathBuf>,

    /// Instance catalog (default: <install root>/examples/star)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Extra commands file to write
    #[arg(long, default_value = "my_config.pars")]
    config: PathBuf,

    /// Output root passed to phosim_run
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Orchestrator program to invoke
    #[arg(long, default_value = "phosim_run")]
    program: String,

    /// Execute the command instead of only printing it
    #[arg(long)]
    run: bool,
}

fn run(args: Args) -> focalplane::Result<ExitCode> {
    let install_root = match &args.install_root {
        Some(root) => root.clone(),
        None => discover_install_root()?,
    };
    let mut recipe = PhysicsRecipe::for_install(&install_root, args.config, args.output);
    if let Some(base) = args.base {
        recipe.base_commands = base;
    }
    if let Some(catalog) = args.catalog {
        recipe.catalog = catalog;
    }
    recipe.program = args.program;

    recipe.prepare()?;
    for (key, value) in PHYSICS_OVERRIDES {
        log::debug!("{key} {value}");
    }

    let command = recipe.command()?;
    println!("\nexecuting\n{}", command.join(" "));
    if !args.run {
        return Ok(ExitCode::SUCCESS);
    }

    let status = Command::new(&command[0])
        .args(&command[1..])
        .status()
        .map_err(|source| focalplane::OrchestratorError::ToolSpawn {
            command: command.join(" "),
            source,
        })?;
    if status.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Err(focalplane::OrchestratorError::ExternalToolFailure {
            command: command.join(" "),
            code: status.code(),
        })
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
