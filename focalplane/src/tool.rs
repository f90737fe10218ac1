//! Launching the external simulation programs.
//!
//! Every program reads its parameters on standard input from a file in the
//! working directory (`raytrace < raytrace_<id>.pars`). Programs are resolved
//! in the binaries directory and run with the working directory as cwd. A
//! non-zero exit becomes [`OrchestratorError::ExternalToolFailure`]; nothing
//! is retried.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::{OrchestratorError, Result};

/// Runs programs from a binaries directory inside a working directory.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    bin_dir: PathBuf,
    work_dir: PathBuf,
}

impl ToolRunner {
    pub fn new(bin_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Run `program` with `param_file` (relative to the working directory) on stdin.
    pub fn run_with_params(&self, program: &str, param_file: &str) -> Result<()> {
        let executable = self.bin_dir.join(program);
        let description = format!("{} < {}", executable.display(), param_file);

        let input_path = self.work_dir.join(param_file);
        let input = File::open(&input_path).map_err(OrchestratorError::file(&input_path))?;

        let mut command = Command::new(&executable);
        command
            .current_dir(&self.work_dir)
            .stdin(Stdio::from(input));
        run_command(command, description)
    }

    /// Run an arbitrary program (not resolved in the binaries directory) with arguments.
    pub fn run_external(&self, program: &str, args: &[&str]) -> Result<()> {
        let description = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let mut command = Command::new(program);
        command.args(args).current_dir(&self.work_dir);
        run_command(command, description)
    }
}

fn run_command(mut command: Command, description: String) -> Result<()> {
    log::info!("Running {description}");
    let status = command.status().map_err(|source| OrchestratorError::ToolSpawn {
        command: description.clone(),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(OrchestratorError::ExternalToolFailure {
            command: description,
            code: status.code(),
        })
    }
}
