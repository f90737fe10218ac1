//! Fan-out of one observation into per-chip trim batches and (chip, exposure) jobs.
//!
//! Chips of the active geometry groups are taken in layout order and grouped
//! into batches of [`TRIM_BATCH_SIZE`], each trimmed with one `trim` run, which
//! bounds how often the full catalog list is shipped around. Every enabled chip
//! then yields one job per exposure.

use std::fmt::Write as _;

use shared::fs_util::remove_if_exists;
use shared::params::write_atomic;

use crate::backend::TrimMode;
use crate::catalog::{ExtraCommands, ObservationHeader};
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::job::Job;
use crate::layout::FocalPlane;
use crate::naming::ObservationFiles;

/// Chips per trim batch.
pub const TRIM_BATCH_SIZE: usize = 9;

/// Header lines the trim program writes before the object lines.
const TRIMMED_CATALOG_HEADER_LINES: usize = 2;

/// Consecutive chips trimmed together from one parameter file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimBatch {
    pub observation_id: String,
    pub index: usize,
    pub chips: Vec<String>,
    /// How many of `chips` are enabled for this run.
    pub enabled: usize,
    /// Parameter file name inside the working directory.
    pub param_file: String,
}

impl TrimBatch {
    pub fn has_enabled(&self) -> bool {
        self.enabled > 0
    }
}

/// Group the chips of `plane` into trim batches, in layout order.
pub fn plan_trim_batches(files: &ObservationFiles, plane: &FocalPlane) -> Vec<TrimBatch> {
    plane
        .chips
        .chunks(TRIM_BATCH_SIZE)
        .enumerate()
        .map(|(index, chunk)| TrimBatch {
            observation_id: files.observation_id().to_string(),
            index,
            chips: chunk.iter().map(|c| c.id.clone()).collect(),
            enabled: chunk.iter().filter(|c| c.enabled).count(),
            param_file: files.trim_params(index),
        })
        .collect()
}

/// Write the batch's parameter file: its `chipid` lines, the observation
/// parameters once, then the catalog list.
pub fn write_trim_batch(
    ctx: &ExecutionContext,
    files: &ObservationFiles,
    batch: &TrimBatch,
) -> Result<()> {
    let mut text = String::new();
    for (slot, chip) in batch.chips.iter().enumerate() {
        let _ = writeln!(text, "chipid {slot} {chip}");
    }
    text.push_str(&read_work_file(ctx, &files.obs_params())?);

    let catalogs = read_work_file(ctx, &files.catalog_list())?;
    if ctx.flat_dir() {
        text.push_str(&flatten_catalog_list(&catalogs));
    } else {
        text.push_str(&catalogs);
    }

    write_atomic(&ctx.work_file(&batch.param_file), text.as_bytes())?;
    Ok(())
}

/// Reduce `catalog <n> <path>` lines to bare file names.
fn flatten_catalog_list(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [directive, number, path, ..] => {
                let name = path.rsplit('/').next().unwrap_or(path);
                let _ = writeln!(out, "{directive} {number} {name}");
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// An enabled chip left out because trimming found too few sources on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChip {
    pub chip_id: String,
    pub sources: i64,
}

/// Jobs of one observation, in chip then exposure order.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub jobs: Vec<Job>,
    pub skipped: Vec<SkippedChip>,
}

/// Count sources in a trimmed catalog; a missing catalog has none.
pub fn trimmed_source_count(ctx: &ExecutionContext, files: &ObservationFiles, chip: &str) -> Result<i64> {
    let path = ctx.work_file(&files.trimmed_catalog(chip));
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(text.lines().count() as i64 - TRIMMED_CATALOG_HEADER_LINES as i64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(OrchestratorError::file(&path)(e)),
    }
}

/// Enumerate the jobs of every enabled chip.
///
/// With [`TrimMode::Local`] the trimmed catalogs already exist, and chips with
/// fewer sources than the catalog's minimum are skipped with a warning.
pub fn expand_jobs(
    ctx: &ExecutionContext,
    header: &ObservationHeader,
    files: &ObservationFiles,
    plane: &FocalPlane,
    trim_mode: TrimMode,
) -> Result<Expansion> {
    let mut expansion = Expansion::default();
    for (position, chip) in plane.chips.iter().enumerate() {
        if !chip.enabled {
            continue;
        }
        if trim_mode == TrimMode::Local {
            let sources = trimmed_source_count(ctx, files, &chip.id)?;
            if sources < header.min_sources {
                log::warn!(
                    "Skipping chip {}: {sources} sources, {} required",
                    chip.id,
                    header.min_sources
                );
                expansion.skipped.push(SkippedChip {
                    chip_id: chip.id.clone(),
                    sources,
                });
                continue;
            }
        }

        let exposure_count = chip.exposures_for(header);
        for exposure in 0..exposure_count {
            expansion.jobs.push(Job {
                observation_id: header.observation_id.clone(),
                chip_id: chip.id.clone(),
                exposure,
                exposure_count,
                trim_batch: position / TRIM_BATCH_SIZE,
                filter: header.filter.clone(),
            });
        }
    }
    log::info!(
        "Expanded observation {} into {} jobs ({} chips skipped)",
        header.observation_id,
        expansion.jobs.len(),
        expansion.skipped.len()
    );
    Ok(expansion)
}

/// Writes the parameter files a job reads on standard input.
pub struct JobFileWriter<'a> {
    ctx: &'a ExecutionContext,
    files: &'a ObservationFiles,
    extra: String,
    trim_mode: TrimMode,
}

impl<'a> JobFileWriter<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        files: &'a ObservationFiles,
        extra: &ExtraCommands,
        trim_mode: TrimMode,
    ) -> Result<Self> {
        Ok(Self {
            ctx,
            files,
            extra: extra.contents()?,
            trim_mode,
        })
    }

    /// Write `raytrace_<fid>.pars` and, with readout enabled, `e2adc_<fid>.pars`.
    pub fn write(&self, job: &Job) -> Result<()> {
        let image = format!(
            "chipid {}\nexposureid {}\nnsnap {}\n",
            job.chip_id, job.exposure, job.exposure_count
        );
        let image_path = self.ctx.work_file(&job.image_params());
        write_atomic(&image_path, image.as_bytes())?;

        let observation = read_work_file(self.ctx, &self.files.obs_params())?;

        let mut raytrace = observation.clone();
        raytrace.push_str(&read_work_file(self.ctx, &self.files.atmosphere_params())?);
        raytrace.push_str(&read_work_file(self.ctx, &self.files.optics_params())?);
        raytrace.push_str(&read_work_file(self.ctx, &self.files.chip_params(&job.chip_id))?);
        raytrace.push_str(&image);
        raytrace.push_str(&self.extra);
        if self.trim_mode == TrimMode::Local {
            raytrace.push_str(&read_work_file(
                self.ctx,
                &self.files.trimmed_catalog(&job.chip_id),
            )?);
        }
        write_atomic(&self.ctx.work_file(&job.raytrace_params()), raytrace.as_bytes())?;

        if self.ctx.options.run_e2adc {
            let mut e2adc = observation;
            e2adc.push_str(&read_work_file(
                self.ctx,
                &self.files.readout_params(&job.chip_id),
            )?);
            e2adc.push_str(&image);
            write_atomic(&self.ctx.work_file(&job.e2adc_params()), e2adc.as_bytes())?;
        }

        remove_if_exists(&image_path).map_err(OrchestratorError::file(&image_path))?;
        Ok(())
    }
}

pub(crate) fn read_work_file(ctx: &ExecutionContext, name: &str) -> Result<String> {
    let path = ctx.work_file(name);
    std::fs::read_to_string(&path).map_err(OrchestratorError::file(&path))
}
