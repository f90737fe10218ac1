//! Local worker pool.
//!
//! A fixed number of worker threads pull jobs from a queue; each job runs
//! `raytrace` and optionally `e2adc` as child processes, one after the other,
//! and moves its gzipped images into the output directory. Workers share
//! nothing but the read-only [`JobEnv`] and the filesystem, where every job's
//! files are uniquely named.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use shared::fs_util::{gzip_file, move_file, remove_if_exists};

use super::{ExecutionBackend, JobEnv, JobFailure, ScheduleReport, TrimMode};
use crate::error::{OrchestratorError, Result};
use crate::expand::TrimBatch;
use crate::job::Job;
use crate::tool::ToolRunner;

const RAYTRACE: &str = "raytrace";
const E2ADC: &str = "e2adc";

type JobOutcome = (String, Result<()>);

pub struct LocalBackend {
    sender: Option<Sender<Job>>,
    results: Receiver<JobOutcome>,
    workers: Vec<JoinHandle<()>>,
    submitted: usize,
    progress: ProgressBar,
}

impl LocalBackend {
    /// Start `concurrency` workers (at least one).
    pub fn new(env: Arc<JobEnv>, concurrency: usize) -> Result<Self> {
        let concurrency = concurrency.max(1);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<JobOutcome>();

        let progress = ProgressBar::new(0);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} jobs {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut workers = Vec::with_capacity(concurrency);
        for worker in 0..concurrency {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let env = Arc::clone(&env);
            let progress = progress.clone();
            let handle = std::thread::Builder::new()
                .name(format!("job-worker-{worker}"))
                .spawn(move || {
                    for job in jobs.iter() {
                        let outcome = catch_unwind(AssertUnwindSafe(|| run_job(&env, &job)))
                            .unwrap_or_else(|_| {
                                Err(OrchestratorError::WorkerPanic(job.file_id()))
                            });
                        progress.inc(1);
                        if results.send((job.file_id(), outcome)).is_err() {
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }
        log::info!("Started {concurrency} local job worker(s)");

        Ok(Self {
            sender: Some(job_tx),
            results: result_rx,
            workers,
            submitted: 0,
            progress,
        })
    }

    /// Close the queue and wait for the workers to finish what is left.
    fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("A job worker panicked");
            }
        }
        self.progress.finish_and_clear();
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn trim_mode(&self) -> TrimMode {
        TrimMode::Local
    }

    fn submit_trim(&mut self, _batch: &TrimBatch) -> Result<()> {
        Err(OrchestratorError::Configuration(
            "the local backend trims during preprocessing".to_string(),
        ))
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(|| {
            OrchestratorError::Configuration("job submitted after the pool was drained".to_string())
        })?;
        log::debug!("Queueing job {}", job.file_id());
        sender.send(job).map_err(|_| {
            OrchestratorError::Configuration("local job workers have stopped".to_string())
        })?;
        self.submitted += 1;
        self.progress.inc_length(1);
        Ok(())
    }

    fn drain(&mut self) -> Result<ScheduleReport> {
        self.shutdown();

        let mut report = ScheduleReport {
            submitted: self.submitted,
            ..ScheduleReport::default()
        };
        for (job, outcome) in self.results.try_iter() {
            match outcome {
                Ok(()) => {
                    log::debug!("Job {job} complete");
                    report.completed += 1;
                }
                Err(e) => {
                    log::warn!("Job {job} failed: {e}");
                    report.failures.push(JobFailure {
                        job,
                        error: e.to_string(),
                    });
                }
            }
        }
        if report.unaccounted() > 0 {
            log::error!("{} jobs ended without reporting an outcome", report.unaccounted());
        }
        Ok(report)
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one job: raytrace, optional readout, then relocate its images.
pub fn run_job(env: &JobEnv, job: &Job) -> Result<()> {
    let runner = ToolRunner::new(&env.bin_dir, &env.work_dir);

    runner.run_with_params(RAYTRACE, &job.raytrace_params())?;
    let electron = gzip(&env.work_dir.join(job.electron_image(&env.instrument)))?;
    if env.clean_job_files {
        remove(&env.work_dir.join(job.raytrace_params()))?;
    }

    if env.run_e2adc {
        runner.run_with_params(E2ADC, &job.e2adc_params())?;
        if env.clean_job_files {
            remove(&env.work_dir.join(job.e2adc_params()))?;
        }
        for amplifier in env.segmentation.amplifiers_of(&job.chip_id) {
            let raw = gzip(
                &env
                    .work_dir
                    .join(job.amplifier_image(&env.instrument, amplifier)),
            )?;
            relocate(
                &raw,
                &env.output_dir
                    .join(job.output_amplifier_image(&env.instrument, amplifier)),
            )?;
        }
    }

    relocate(
        &electron,
        &env.output_dir.join(job.output_electron_image(&env.instrument)),
    )
}

fn gzip(path: &Path) -> Result<std::path::PathBuf> {
    gzip_file(path).map_err(OrchestratorError::file(path))
}

fn relocate(from: &Path, to: &Path) -> Result<()> {
    move_file(from, to).map_err(OrchestratorError::file(from))
}

fn remove(path: &Path) -> Result<()> {
    remove_if_exists(path)
        .map(|_| ())
        .map_err(OrchestratorError::file(path))
}
