//! Cluster batch backend.
//!
//! Each job becomes a shell script produced by a [`ScriptWriter`] and is handed
//! to an optional [`Submitter`] (`qsub`, `sbatch`, plain `sh`, ...). Without a
//! submitter the scripts are only written, for the user to submit by hand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use shared::params::write_atomic;

use super::script::job_script;
use super::{ExecutionBackend, JobEnv, JobFailure, ScheduleReport, TrimMode};
use crate::error::{OrchestratorError, Result};
use crate::expand::TrimBatch;
use crate::job::Job;
use crate::tool::ToolRunner;

/// Produces the script that runs one job on a cluster node.
pub trait ScriptWriter: Send + Sync {
    fn write_script(&self, job: &Job, env: &JobEnv) -> Result<PathBuf>;
}

/// Hands a written script to the batch system.
pub trait Submitter: Send + Sync {
    fn submit(&self, job: &Job, script: &Path) -> Result<()>;
}

/// Writes `job_<id>.sh` into the working directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellScriptWriter;

impl ShellScriptWriter {
    pub fn script_name(job: &Job) -> String {
        format!("job_{}.sh", job.file_id())
    }
}

impl ScriptWriter for ShellScriptWriter {
    fn write_script(&self, job: &Job, env: &JobEnv) -> Result<PathBuf> {
        let path = env.work_dir.join(Self::script_name(job));
        write_atomic(&path, job_script(env, job).as_bytes())?;
        make_executable(&path)?;
        Ok(path)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(OrchestratorError::file(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Submits scripts by running `<program> [args...] <script>`.
#[derive(Debug, Clone)]
pub struct CommandSubmitter {
    program: String,
    args: Vec<String>,
    runner: ToolRunner,
}

impl CommandSubmitter {
    /// Split a command line such as `qsub -q long` into program and arguments.
    pub fn parse(command: &str, work_dir: &Path) -> Result<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next().ok_or_else(|| {
            OrchestratorError::Configuration("cluster submit command is empty".to_string())
        })?;
        Ok(Self {
            program,
            args: words.collect(),
            runner: ToolRunner::new(PathBuf::new(), work_dir),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Submitter for CommandSubmitter {
    fn submit(&self, _job: &Job, script: &Path) -> Result<()> {
        let script = script.to_string_lossy();
        let mut args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        args.push(&script);
        self.runner.run_external(&self.program, &args)
    }
}

pub struct ClusterBackend {
    env: Arc<JobEnv>,
    writer: Box<dyn ScriptWriter>,
    submitter: Option<Box<dyn Submitter>>,
    report: ScheduleReport,
}

impl ClusterBackend {
    /// A cluster backend needs a script writer; a submitter is optional.
    pub fn new(
        env: Arc<JobEnv>,
        writer: Option<Box<dyn ScriptWriter>>,
        submitter: Option<Box<dyn Submitter>>,
    ) -> Result<Self> {
        let writer = writer.ok_or_else(|| {
            OrchestratorError::Configuration(
                "the cluster backend requires a script writer".to_string(),
            )
        })?;
        if submitter.is_none() {
            log::warn!("No cluster submitter configured; job scripts will only be written");
        }
        Ok(Self {
            env,
            writer,
            submitter,
            report: ScheduleReport::default(),
        })
    }

    fn hand_over(&self, job: &Job) -> Result<()> {
        let script = self.writer.write_script(job, &self.env)?;
        match &self.submitter {
            Some(submitter) => submitter.submit(job, &script),
            None => {
                log::info!("Wrote {}", script.display());
                Ok(())
            }
        }
    }
}

impl ExecutionBackend for ClusterBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn trim_mode(&self) -> TrimMode {
        TrimMode::Local
    }

    fn submit_trim(&mut self, _batch: &TrimBatch) -> Result<()> {
        Err(OrchestratorError::Configuration(
            "the cluster backend trims during preprocessing".to_string(),
        ))
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        self.report.submitted += 1;
        match self.hand_over(&job) {
            Ok(()) => self.report.handed_off += 1,
            Err(e) => {
                log::warn!("Job {} was not submitted: {e}", job.file_id());
                self.report.failures.push(JobFailure {
                    job: job.file_id(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<ScheduleReport> {
        Ok(std::mem::take(&mut self.report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::script::tests::{env, job};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Submitter for Recorder {
        fn submit(&self, job: &Job, script: &Path) -> Result<()> {
            assert!(script.is_file());
            self.0.lock().unwrap().push(job.file_id());
            Ok(())
        }
    }

    struct Refuser;

    impl Submitter for Refuser {
        fn submit(&self, _job: &Job, _script: &Path) -> Result<()> {
            Err(OrchestratorError::ExternalToolFailure {
                command: "qsub".to_string(),
                code: Some(1),
            })
        }
    }

    fn env_in(dir: &Path) -> Arc<JobEnv> {
        let mut env = env();
        env.work_dir = dir.to_path_buf();
        Arc::new(env)
    }

    #[test]
    fn test_missing_script_writer_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let result = ClusterBackend::new(env_in(dir.path()), None, None);
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }

    #[test]
    fn test_scripts_are_written_and_submitted() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut backend = ClusterBackend::new(
            env_in(dir.path()),
            Some(Box::new(ShellScriptWriter)),
            Some(Box::new(Recorder(Arc::clone(&seen)))),
        )
        .unwrap();

        backend.submit(job()).unwrap();
        let report = backend.drain().unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.handed_off, 1);
        assert!(report.is_success());
        assert_eq!(*seen.lock().unwrap(), vec!["42_R22_S11_E000".to_string()]);
        let script = std::fs::read_to_string(dir.path().join("job_42_R22_S11_E000.sh")).unwrap();
        assert!(script.contains("raytrace"));
    }

    #[test]
    fn test_refused_submission_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut backend = ClusterBackend::new(
            env_in(dir.path()),
            Some(Box::new(ShellScriptWriter)),
            Some(Box::new(Refuser)),
        )
        .unwrap();

        backend.submit(job()).unwrap();
        let report = backend.drain().unwrap();
        assert_eq!(report.handed_off, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("qsub"));
    }

    #[test]
    fn test_submit_command_parsing() {
        let submitter = CommandSubmitter::parse("qsub -q long", Path::new("/tmp")).unwrap();
        assert_eq!(submitter.program(), "qsub");
        assert_eq!(submitter.args, vec!["-q", "long"]);
        assert!(CommandSubmitter::parse("  ", Path::new("/tmp")).is_err());
    }
}
