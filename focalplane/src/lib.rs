//! Job orchestration for focal-plane image simulations.
//!
//! A run takes one instance catalog through a fixed sequence of stages:
//! load the catalog, generate per-observation files with the external
//! `atmosphere`/`instrument`/`trim` programs, expand the focal plane into
//! (chip, exposure) jobs, run them on an execution backend and clean up the
//! working directory. The physics itself happens entirely inside the external
//! programs; this crate only prepares their inputs and moves their outputs.
//!
//! # Modules
//!
//! - [`catalog`] - instance catalog and extra-commands loading
//! - [`context`] - resolved paths and run options
//! - [`preprocess`] - per-observation parameter files and tool invocations
//! - [`layout`] - focal plane geometry and amplifier segmentation
//! - [`expand`] - trim batches, jobs and per-job parameter files
//! - [`backend`] - local, cluster and DAGMan execution
//! - [`cleanup`] - end-of-run removal and relocation
//! - [`run`] - the stage sequence
//! - [`physics`] - physics trade-study recipe

pub mod backend;
pub mod catalog;
pub mod cleanup;
pub mod context;
pub mod error;
pub mod expand;
pub mod job;
pub mod layout;
pub mod naming;
pub mod physics;
pub mod preprocess;
pub mod run;
pub mod tool;

pub use backend::{Backend, ExecutionBackend, ScheduleReport};
pub use context::{BackendConfig, ContextOptions, ExecutionContext, RunOptions, Universe};
pub use error::{OrchestratorError, Result};
pub use run::{run_observation, CleanedUpRun};
