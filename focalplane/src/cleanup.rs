//! End-of-run removal and relocation of intermediate files.
//!
//! Every step tolerates files that are already gone, so running cleanup twice,
//! or after an earlier run cleaned up, succeeds.

use std::path::Path;

use shared::fs_util::{copy_into, glob_in, move_into, remove_if_exists};

use crate::catalog::ExtraCommands;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::layout::FocalPlane;
use crate::naming::{ObservationFiles, EVENT_FILE, OPD_FILE};

/// How much of the working directory a run may clean up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupScope {
    /// All jobs finished here: remove intermediates, handle screens, relocate outputs.
    Full,
    /// Jobs still run elsewhere: only remove parameter files already folded into job files.
    ParametersOnly,
}

/// What cleanup did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub removed: usize,
    pub copied: usize,
    pub relocated: usize,
}

struct Cleaner<'a> {
    work_dir: &'a Path,
    output_dir: &'a Path,
    summary: CleanupSummary,
}

impl Cleaner<'_> {
    fn remove(&mut self, name: &str) -> Result<()> {
        let path = self.work_dir.join(name);
        self.remove_path(&path)
    }

    fn remove_path(&mut self, path: &Path) -> Result<()> {
        if remove_if_exists(path).map_err(OrchestratorError::file(path))? {
            self.summary.removed += 1;
        }
        Ok(())
    }

    fn copy_out(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        copy_into(path, self.output_dir).map_err(OrchestratorError::file(path))?;
        self.summary.copied += 1;
        Ok(())
    }

    fn move_out(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            log::warn!("Expected output {} was not produced", path.display());
            return Ok(());
        }
        move_into(path, self.output_dir).map_err(OrchestratorError::file(path))?;
        self.summary.relocated += 1;
        Ok(())
    }

    fn matching(&self, pattern: &str) -> Result<Vec<std::path::PathBuf>> {
        Ok(glob_in(self.work_dir, pattern)?)
    }
}

/// Clean the working directory after scheduling.
pub fn cleanup(
    ctx: &ExecutionContext,
    files: &ObservationFiles,
    plane: &FocalPlane,
    extra: &ExtraCommands,
    scope: CleanupScope,
) -> Result<CleanupSummary> {
    let keep_screens = ctx.options.keep_screens;
    let mut cleaner = Cleaner {
        work_dir: &ctx.work_dir,
        output_dir: &ctx.output_dir,
        summary: CleanupSummary::default(),
    };

    for chip in &plane.chips {
        cleaner.remove(&files.chip_params(&chip.id))?;
        cleaner.remove(&files.readout_params(&chip.id))?;
        if scope == CleanupScope::Full {
            cleaner.remove(&files.trimmed_catalog(&chip.id))?;
        }
    }
    cleaner.remove(&files.obs_params())?;
    cleaner.remove(&files.optics_params())?;
    cleaner.remove(&files.catalog_list())?;

    if scope == CleanupScope::ParametersOnly {
        if !keep_screens {
            cleaner.remove(&files.atmosphere_params())?;
        }
        log::info!(
            "Left screens and outputs of observation {} to the scheduled jobs",
            files.observation_id()
        );
        return Ok(cleaner.summary);
    }

    cleaner.remove(&files.object_catalog())?;
    cleaner.remove(&files.tracking_params())?;

    let mut screens = vec![ctx.work_file(&files.airglow_screen())];
    for pattern in files.screen_patterns() {
        screens.extend(cleaner.matching(&pattern)?);
    }
    if keep_screens {
        cleaner.copy_out(&ctx.work_file(&files.atmosphere_params()))?;
        for screen in &screens {
            cleaner.copy_out(screen)?;
        }
    } else {
        cleaner.remove(&files.atmosphere_params())?;
        for screen in &screens {
            cleaner.remove_path(screen)?;
        }
    }

    if extra.event_file {
        cleaner.move_out(&ctx.work_file(EVENT_FILE))?;
    }
    if extra.throughput_file {
        for log_file in cleaner.matching(&files.throughput_pattern())? {
            cleaner.move_out(&log_file)?;
        }
    }
    if extra.centroid_file {
        for log_file in cleaner.matching(&files.centroid_pattern())? {
            cleaner.move_out(&log_file)?;
        }
    }
    if extra.opd_file {
        cleaner.move_out(&ctx.work_file(OPD_FILE))?;
    }

    let summary = cleaner.summary;
    log::info!(
        "Cleanup removed {} files, kept {} screen files, relocated {} outputs",
        summary.removed,
        summary.copied,
        summary.relocated
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BackendConfig;
    use crate::expand::tests::scratch_context;
    use crate::layout::{ChipRecord, DeviceKind};
    use tempfile::TempDir;

    fn plane() -> FocalPlane {
        FocalPlane {
            chips: vec![ChipRecord {
                id: "R22_S11".to_string(),
                kind: DeviceKind::Ccd,
                device_value: 3.0,
                enabled: true,
            }],
        }
    }

    fn populate(ctx: &ExecutionContext, files: &ObservationFiles) {
        for name in [
            files.obs_params(),
            files.optics_params(),
            files.catalog_list(),
            files.object_catalog(),
            files.tracking_params(),
            files.atmosphere_params(),
            files.airglow_screen(),
            files.chip_params("R22_S11"),
            files.readout_params("R22_S11"),
            files.trimmed_catalog("R22_S11"),
            "atmospherescreen_42_0_coarsep.fits".to_string(),
            "cloudscreen_42_1.fits".to_string(),
            "centroid_lsst_e_42_R22_S11_E000.txt".to_string(),
            "output.fits".to_string(),
        ] {
            std::fs::write(ctx.work_file(&name), "x").unwrap();
        }
    }

    fn leftovers(ctx: &ExecutionContext) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&ctx.work_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_full_cleanup_discards_screens_and_moves_outputs() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let files = ObservationFiles::new("42");
        populate(&ctx, &files);
        let extra = ExtraCommands {
            centroid_file: true,
            ..ExtraCommands::default()
        };

        let summary = cleanup(&ctx, &files, &plane(), &extra, CleanupScope::Full).unwrap();

        // The event file was not requested, so it stays where the simulator left it
        assert_eq!(leftovers(&ctx), vec!["output.fits".to_string()]);
        assert_eq!(summary.removed, 12);
        assert_eq!(summary.relocated, 1);
        assert!(ctx
            .output_dir
            .join("centroid_lsst_e_42_R22_S11_E000.txt")
            .is_file());
    }

    #[test]
    fn test_kept_screens_are_copied_to_output() {
        let root = TempDir::new().unwrap();
        let mut ctx = scratch_context(&root, BackendConfig::default());
        ctx.options.keep_screens = true;
        let files = ObservationFiles::new("42");
        populate(&ctx, &files);

        let summary =
            cleanup(&ctx, &files, &plane(), &ExtraCommands::default(), CleanupScope::Full)
                .unwrap();

        assert_eq!(summary.copied, 4);
        assert!(ctx.work_file("atmosphere_42.pars").is_file());
        assert!(ctx.output_dir.join("atmosphere_42.pars").is_file());
        assert!(ctx.output_dir.join("cloudscreen_42_1.fits").is_file());
        assert!(ctx.work_file("cloudscreen_42_1.fits").is_file());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let files = ObservationFiles::new("42");
        populate(&ctx, &files);
        let extra = ExtraCommands {
            event_file: true,
            opd_file: true,
            ..ExtraCommands::default()
        };

        cleanup(&ctx, &files, &plane(), &extra, CleanupScope::Full).unwrap();
        let again = cleanup(&ctx, &files, &plane(), &extra, CleanupScope::Full).unwrap();
        assert_eq!(again, CleanupSummary::default());
    }

    #[test]
    fn test_parameters_only_scope_leaves_job_inputs() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let files = ObservationFiles::new("42");
        populate(&ctx, &files);

        cleanup(
            &ctx,
            &files,
            &plane(),
            &ExtraCommands::default(),
            CleanupScope::ParametersOnly,
        )
        .unwrap();

        let left = leftovers(&ctx);
        assert!(left.contains(&"trimcatalog_42_R22_S11.pars".to_string()));
        assert!(left.contains(&"cloudscreen_42_1.fits".to_string()));
        assert!(left.contains(&"objectcatalog_42.pars".to_string()));
        assert!(!left.contains(&"obs_42.pars".to_string()));
        assert!(!left.contains(&"chip_42_R22_S11.pars".to_string()));
    }
}
