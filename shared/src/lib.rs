//! Shared components and utilities for the focal-plane simulation tools.
//!
//! - [`params`]: ordered `key value` parameter files with typed value coercion
//! - [`fs_util`]: delete-if-exists, move/copy helpers and gzip for result images

pub mod fs_util;
pub mod params;

pub use params::{ParamError, ParamValue, ParameterSet, WriteMode};
