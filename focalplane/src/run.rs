//! One observation, from instance catalog to cleaned working directory.
//!
//! Each stage is its own type and each transition consumes the previous stage,
//! so stages can only run forward and in order:
//!
//! ```text
//! LoadedRun ─preprocess─► PreprocessedRun ─expand─► ExpandedRun
//!     ─schedule─► ScheduledRun ─cleanup─► CleanedUpRun
//! ```

use std::fmt;
use std::path::Path;

use crate::backend::{ExecutionBackend, JobFailure, ScheduleReport, TrimMode};
use crate::catalog::{InstanceCatalog, DEFAULT_CATALOG_NAME};
use crate::cleanup::{cleanup, CleanupScope, CleanupSummary};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::expand::{expand_jobs, Expansion, JobFileWriter, SkippedChip};
use crate::layout::FocalPlane;
use crate::naming::ObservationFiles;
use crate::preprocess;
use crate::tool::ToolRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Loaded,
    Preprocessed,
    Expanded,
    Scheduled,
    CleanedUp,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Loaded => "loaded",
            RunStage::Preprocessed => "preprocessed",
            RunStage::Expanded => "expanded",
            RunStage::Scheduled => "scheduled",
            RunStage::CleanedUp => "cleaned up",
        };
        f.write_str(name)
    }
}

fn enter(stage: RunStage, files: &ObservationFiles) {
    log::info!("Observation {}: {stage}", files.observation_id());
}

pub struct LoadedRun<'a> {
    ctx: &'a ExecutionContext,
    catalog: InstanceCatalog,
    files: ObservationFiles,
}

impl<'a> LoadedRun<'a> {
    /// Load an instance catalog over the installation's default catalog.
    pub fn load(
        ctx: &'a ExecutionContext,
        instance_catalog: &Path,
        extra_commands: Option<&Path>,
    ) -> Result<Self> {
        let defaults = ctx.install_root.join(DEFAULT_CATALOG_NAME);
        let catalog = InstanceCatalog::load(&defaults, instance_catalog, extra_commands)?;
        let files = ObservationFiles::new(catalog.observation_id());
        enter(RunStage::Loaded, &files);
        Ok(Self {
            ctx,
            catalog,
            files,
        })
    }

    /// Generate the per-observation files and trim the catalog.
    pub fn preprocess(self, backend: &mut dyn ExecutionBackend) -> Result<PreprocessedRun<'a>> {
        let Self {
            ctx,
            catalog,
            files,
        } = self;
        let runner = ToolRunner::new(&ctx.bin_dir, &ctx.work_dir);

        preprocess::write_observation_params(ctx, &catalog, &files)?;
        preprocess::write_catalog_list(ctx, &catalog, &files)?;
        preprocess::generate_atmosphere(ctx, &runner, &catalog, &files)?;
        preprocess::generate_instrument_config(&runner, &files)?;

        let plane = FocalPlane::load(&ctx.instr_dir, &catalog.header.camera, &ctx.chips)?;
        log::info!(
            "{} chips in active groups, {} enabled",
            plane.chips.len(),
            plane.enabled().count()
        );
        preprocess::trim_objects(ctx, &runner, &files, &plane, backend)?;

        enter(RunStage::Preprocessed, &files);
        Ok(PreprocessedRun {
            ctx,
            catalog,
            files,
            plane,
            trim_mode: backend.trim_mode(),
        })
    }
}

pub struct PreprocessedRun<'a> {
    ctx: &'a ExecutionContext,
    catalog: InstanceCatalog,
    files: ObservationFiles,
    plane: FocalPlane,
    trim_mode: TrimMode,
}

impl<'a> PreprocessedRun<'a> {
    pub fn expand(self) -> Result<ExpandedRun<'a>> {
        let expansion = expand_jobs(
            self.ctx,
            &self.catalog.header,
            &self.files,
            &self.plane,
            self.trim_mode,
        )?;
        enter(RunStage::Expanded, &self.files);
        Ok(ExpandedRun {
            ctx: self.ctx,
            catalog: self.catalog,
            files: self.files,
            plane: self.plane,
            trim_mode: self.trim_mode,
            expansion,
        })
    }
}

pub struct ExpandedRun<'a> {
    ctx: &'a ExecutionContext,
    catalog: InstanceCatalog,
    files: ObservationFiles,
    plane: FocalPlane,
    trim_mode: TrimMode,
    expansion: Expansion,
}

impl<'a> ExpandedRun<'a> {
    /// Write each job's parameter files, submit it, and drain the backend.
    ///
    /// A job whose inputs cannot be written or that the backend refuses is
    /// recorded as failed; its siblings are still submitted and drained.
    pub fn schedule(self, backend: &mut dyn ExecutionBackend) -> Result<ScheduledRun<'a>> {
        let writer = JobFileWriter::new(self.ctx, &self.files, &self.catalog.extra, self.trim_mode)?;
        let mut refused = Vec::new();
        for job in self.expansion.jobs {
            let file_id = job.file_id();
            if let Err(e) = writer.write(&job).and_then(|()| backend.submit(job)) {
                log::warn!("Job {file_id} was not scheduled: {e}");
                refused.push(JobFailure {
                    job: file_id,
                    error: e.to_string(),
                });
            }
        }
        let mut report = backend.drain()?;
        report.submitted += refused.len();
        report.failures.extend(refused);
        log::info!(
            "{} jobs submitted: {} completed, {} handed off, {} failed",
            report.submitted,
            report.completed,
            report.handed_off,
            report.failures.len()
        );

        enter(RunStage::Scheduled, &self.files);
        Ok(ScheduledRun {
            ctx: self.ctx,
            catalog: self.catalog,
            files: self.files,
            plane: self.plane,
            trim_mode: self.trim_mode,
            skipped: self.expansion.skipped,
            report,
        })
    }
}

pub struct ScheduledRun<'a> {
    ctx: &'a ExecutionContext,
    catalog: InstanceCatalog,
    files: ObservationFiles,
    plane: FocalPlane,
    trim_mode: TrimMode,
    skipped: Vec<SkippedChip>,
    report: ScheduleReport,
}

impl ScheduledRun<'_> {
    /// Clean up as far as the scheduled jobs allow.
    pub fn cleanup(self) -> Result<CleanedUpRun> {
        let scope = cleanup_scope(self.trim_mode, &self.report);
        let summary = cleanup(
            self.ctx,
            &self.files,
            &self.plane,
            &self.catalog.extra,
            scope,
        )?;
        enter(RunStage::CleanedUp, &self.files);
        Ok(CleanedUpRun {
            observation_id: self.files.observation_id().to_string(),
            report: self.report,
            skipped: self.skipped,
            cleanup: summary,
        })
    }
}

/// Jobs handed to a scheduler still need the screens and have not produced
/// their outputs yet, so only a run whose jobs all ended here is fully cleaned.
fn cleanup_scope(trim_mode: TrimMode, report: &ScheduleReport) -> CleanupScope {
    if trim_mode == TrimMode::Deferred || report.handed_off > 0 {
        CleanupScope::ParametersOnly
    } else {
        CleanupScope::Full
    }
}

/// Final outcome of an observation.
#[derive(Debug, Clone)]
pub struct CleanedUpRun {
    pub observation_id: String,
    pub report: ScheduleReport,
    pub skipped: Vec<SkippedChip>,
    pub cleanup: CleanupSummary,
}

impl CleanedUpRun {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// Run every stage for one instance catalog.
pub fn run_observation(
    ctx: &ExecutionContext,
    instance_catalog: &Path,
    extra_commands: Option<&Path>,
    backend: &mut dyn ExecutionBackend,
) -> Result<CleanedUpRun> {
    LoadedRun::load(ctx, instance_catalog, extra_commands)?
        .preprocess(backend)?
        .expand()?
        .schedule(backend)?
        .cleanup()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(RunStage::CleanedUp.to_string(), "cleaned up");
        assert_eq!(RunStage::Loaded.to_string(), "loaded");
    }

    #[test]
    fn test_handed_off_jobs_limit_cleanup() {
        let finished_here = ScheduleReport {
            submitted: 2,
            completed: 2,
            ..ScheduleReport::default()
        };
        let handed_off = ScheduleReport {
            submitted: 2,
            handed_off: 2,
            ..ScheduleReport::default()
        };
        assert_eq!(cleanup_scope(TrimMode::Local, &finished_here), CleanupScope::Full);
        assert_eq!(
            cleanup_scope(TrimMode::Local, &handed_off),
            CleanupScope::ParametersOnly
        );
        assert_eq!(
            cleanup_scope(TrimMode::Deferred, &ScheduleReport::default()),
            CleanupScope::ParametersOnly
        );
    }
}
