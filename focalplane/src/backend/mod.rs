//! Execution backends for raytrace/readout jobs.
//!
//! Every backend implements [`ExecutionBackend`]: jobs are handed over with
//! `submit` as the expander produces them and `drain` waits for (or hands off)
//! everything submitted during the run. The set of backends is closed and
//! chosen once at startup through [`Backend::from_context`].
//!
//! A backend also decides where the trim step runs. Local-trim backends run it
//! during preprocessing on this machine, which lets the expander skip chips
//! with too few sources; deferred-trim backends schedule trim batches as part
//! of their own job graph.

pub mod cluster;
pub mod dag;
pub mod local;
pub mod script;

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::{BackendConfig, ExecutionContext};
use crate::error::Result;
use crate::expand::TrimBatch;
use crate::job::Job;
use crate::layout::Segmentation;

pub use cluster::{ClusterBackend, CommandSubmitter, ScriptWriter, ShellScriptWriter, Submitter};
pub use dag::DagBackend;
pub use local::LocalBackend;

/// Where the trim step of a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    /// Trim runs synchronously during preprocessing.
    Local,
    /// Trim batches are submitted to the backend with the jobs.
    Deferred,
}

/// Read-only settings every job needs, shared by all workers of a run.
#[derive(Debug, Clone)]
pub struct JobEnv {
    pub bin_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub instrument: String,
    pub run_e2adc: bool,
    pub clean_job_files: bool,
    pub segmentation: Segmentation,
}

impl JobEnv {
    pub fn from_context(ctx: &ExecutionContext) -> Result<Self> {
        let segmentation = if ctx.options.run_e2adc {
            Segmentation::load(&ctx.instr_dir)?
        } else {
            Segmentation::default()
        };
        Ok(Self {
            bin_dir: ctx.bin_dir.clone(),
            work_dir: ctx.work_dir.clone(),
            output_dir: ctx.output_dir.clone(),
            instrument: ctx.instrument.clone(),
            run_e2adc: ctx.options.run_e2adc,
            clean_job_files: ctx.options.clean_job_files,
            segmentation,
        })
    }
}

/// A job that failed without affecting its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job: String,
    pub error: String,
}

/// Outcome of draining a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Jobs accepted by `submit`.
    pub submitted: usize,
    /// Jobs whose images are in the output directory.
    pub completed: usize,
    /// Jobs handed to an external scheduler whose completion is not tracked here.
    pub handed_off: usize,
    pub failures: Vec<JobFailure>,
}

impl ScheduleReport {
    /// Jobs that neither finished, failed, nor were handed off.
    pub fn unaccounted(&self) -> usize {
        self.submitted
            .saturating_sub(self.completed + self.handed_off + self.failures.len())
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.unaccounted() == 0
    }
}

/// Capability set shared by every backend.
pub trait ExecutionBackend {
    fn name(&self) -> &'static str;

    fn trim_mode(&self) -> TrimMode;

    /// Schedule a trim batch. Only called on [`TrimMode::Deferred`] backends.
    fn submit_trim(&mut self, batch: &TrimBatch) -> Result<()>;

    fn submit(&mut self, job: Job) -> Result<()>;

    /// Wait for every submitted job of this run to finish, fail, or be handed off.
    fn drain(&mut self) -> Result<ScheduleReport>;
}

/// The closed set of execution backends.
pub enum Backend {
    Local(LocalBackend),
    Cluster(ClusterBackend),
    DistributedBatch(DagBackend),
}

impl Backend {
    /// Build the backend selected in the context with its default collaborators.
    pub fn from_context(ctx: &ExecutionContext) -> Result<Self> {
        let env = Arc::new(JobEnv::from_context(ctx)?);
        let backend = match &ctx.backend {
            BackendConfig::Local { concurrency } => {
                Backend::Local(LocalBackend::new(env, *concurrency)?)
            }
            BackendConfig::Cluster { submit_command } => {
                let submitter = submit_command
                    .as_deref()
                    .map(|cmd| CommandSubmitter::parse(cmd, &ctx.work_dir))
                    .transpose()?
                    .map(|s| Box::new(s) as Box<dyn Submitter>);
                Backend::Cluster(ClusterBackend::new(
                    env,
                    Some(Box::new(ShellScriptWriter)),
                    submitter,
                )?)
            }
            BackendConfig::DistributedBatch {
                universe,
                checkpoint,
                submit_program,
            } => Backend::DistributedBatch(DagBackend::new(
                env,
                *universe,
                *checkpoint,
                submit_program.clone(),
            )),
        };
        log::info!("Using {} execution backend", backend.name());
        Ok(backend)
    }

    fn inner(&self) -> &dyn ExecutionBackend {
        match self {
            Backend::Local(b) => b,
            Backend::Cluster(b) => b,
            Backend::DistributedBatch(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ExecutionBackend {
        match self {
            Backend::Local(b) => b,
            Backend::Cluster(b) => b,
            Backend::DistributedBatch(b) => b,
        }
    }
}

impl ExecutionBackend for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn trim_mode(&self) -> TrimMode {
        self.inner().trim_mode()
    }

    fn submit_trim(&mut self, batch: &TrimBatch) -> Result<()> {
        self.inner_mut().submit_trim(batch)
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        self.inner_mut().submit(job)
    }

    fn drain(&mut self) -> Result<ScheduleReport> {
        self.inner_mut().drain()
    }
}
