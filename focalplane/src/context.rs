//! Paths and options for one orchestration run.
//!
//! An [`ExecutionContext`] is resolved once at startup from user options and
//! then only read. Directory layout under the output root:
//!
//! ```text
//! <output root>/
//! ├── output/       # final images and relocated artifacts
//! ├── work/         # intermediate parameter files, cwd of every program
//! └── image/data/   # image directory handed to the simulator
//! ```

use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};
use crate::layout::ChipFilter;

/// Environment variable naming the simulator installation root.
pub const INSTALL_ROOT_ENV: &str = "PHOSIMDIR";

/// Program used to discover the installation on `PATH` when the variable is unset.
const DISCOVERY_PROGRAM: &str = "raytrace";

/// Distributed-batch universe. `Vanilla` jobs run without a shared filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Universe {
    #[default]
    Standard,
    Vanilla,
}

impl std::fmt::Display for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Universe::Standard => write!(f, "standard"),
            Universe::Vanilla => write!(f, "vanilla"),
        }
    }
}

/// Backend selection with its backend-specific options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// Local worker pool bounded by `concurrency`.
    Local { concurrency: usize },
    /// One script per job handed to `submit_command` (e.g. `sh`, `qsub`).
    Cluster { submit_command: Option<String> },
    /// A DAGMan job graph submitted once per observation.
    DistributedBatch {
        universe: Universe,
        checkpoint: u32,
        submit_program: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local { concurrency: 1 }
    }
}

/// Switches that shape what gets generated and kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Run the electrons-to-ADC readout after each raytrace.
    pub run_e2adc: bool,
    /// Keep atmosphere screens, copying them into the output directory.
    pub keep_screens: bool,
    /// Regenerate screens even if an atmosphere file already exists.
    pub regenerate_screens: bool,
    /// Delete per-job parameter files once a job succeeds.
    pub clean_job_files: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_e2adc: true,
            keep_screens: false,
            regenerate_screens: false,
            clean_job_files: false,
        }
    }
}

/// Unresolved user choices, typically straight from the command line.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub install_root: PathBuf,
    pub output_root: PathBuf,
    pub bin_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub sed_dir: Option<PathBuf>,
    pub instrument: String,
    pub chips: ChipFilter,
    pub backend: BackendConfig,
    pub options: RunOptions,
    /// Replace the working directory with an empty one before starting.
    pub fresh_work_dir: bool,
}

/// Resolved, absolute paths and options for a run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub install_root: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub image_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub data_dir: PathBuf,
    pub sed_dir: PathBuf,
    pub instr_dir: PathBuf,
    pub instrument: String,
    pub chips: ChipFilter,
    pub backend: BackendConfig,
    pub options: RunOptions,
}

impl ExecutionContext {
    /// Make paths absolute, create the output tree and check required directories.
    pub fn resolve(opts: ContextOptions) -> Result<Self> {
        let output_root = absolute(&opts.output_root)?;
        let output_dir = output_root.join("output");
        let work_dir = output_root.join("work");
        let image_dir = output_root.join("image").join("data");

        let install_root = absolute(&opts.install_root)?;
        let bin_dir = absolute(&opts.bin_dir.unwrap_or_else(|| install_root.join("bin")))?;
        let data_dir = absolute(&opts.data_dir.unwrap_or_else(|| install_root.join("data")))?;
        let sed_dir = absolute(&opts.sed_dir.unwrap_or_else(|| data_dir.join("SEDs")))?;

        for dir in [&output_dir, &image_dir] {
            shared::fs_util::ensure_dir(dir).map_err(OrchestratorError::file(dir))?;
        }
        if opts.fresh_work_dir {
            shared::fs_util::recreate_dir(&work_dir).map_err(OrchestratorError::file(&work_dir))?;
        } else {
            shared::fs_util::ensure_dir(&work_dir).map_err(OrchestratorError::file(&work_dir))?;
        }

        for dir in [&bin_dir, &data_dir] {
            require_dir(dir)?;
        }

        let instr_dir = data_dir.join(&opts.instrument);
        require_dir(&instr_dir)?;
        let instrument = instr_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(opts.instrument);

        Ok(Self {
            install_root,
            output_dir,
            work_dir,
            image_dir,
            bin_dir,
            data_dir,
            sed_dir,
            instr_dir,
            instrument,
            chips: opts.chips,
            backend: opts.backend,
            options: opts.options,
        })
    }

    /// Path of a file inside the working directory.
    pub fn work_file(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    /// Whether job inputs must be referenced by bare file name.
    pub fn flat_dir(&self) -> bool {
        matches!(
            self.backend,
            BackendConfig::DistributedBatch {
                universe: Universe::Vanilla,
                ..
            }
        )
    }
}

fn require_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(OrchestratorError::MissingDirectory(dir.to_path_buf()))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(OrchestratorError::file(path))
}

/// Locate the simulator installation root.
///
/// Uses `$PHOSIMDIR` when set, otherwise the parent of the directory on `PATH`
/// that holds the `raytrace` program.
pub fn discover_install_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os(INSTALL_ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search_path)
        .find(|dir| dir.join(DISCOVERY_PROGRAM).is_file())
        .and_then(|bin| bin.parent().map(Path::to_path_buf))
        .ok_or_else(|| {
            OrchestratorError::MissingDirectory(PathBuf::from(format!(
                "${INSTALL_ROOT_ENV} (unset, and {DISCOVERY_PROGRAM} is not on PATH)"
            )))
        })
}
