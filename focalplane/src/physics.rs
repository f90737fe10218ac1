//! Physics trade-study recipe.
//!
//! Starts from a base extra-commands file (normally the installation's
//! `examples/nobackground`), switches off the major physics effects, writes the
//! result as an extra-commands file and builds the `phosim_run` invocation that
//! simulates the example star with it.

use std::path::{Path, PathBuf};

use shared::{ParameterSet, WriteMode};

use crate::error::{OrchestratorError, Result};

/// Physics switches applied over the base commands, in output order.
pub const PHYSICS_OVERRIDES: [(&str, i64); 9] = [
    ("telescopemode", 0),      // ideal telescope
    ("detectormode", 0),       // no charge diffusion
    ("diffractionmode", 0),
    ("exptime", 15),           // seconds
    ("blooming", 0),
    ("clearperturbations", 0),
    ("cleartracking", 0),
    ("clearopacity", 0),       // every form of atmospheric opacity
    ("clearturbulence", 0),    // seeing in every layer
];

pub const NO_BACKGROUND_FILE: &str = "examples/nobackground";
pub const EXAMPLE_CATALOG: &str = "examples/star";

/// Inputs of one physics-recipe run.
#[derive(Debug, Clone)]
pub struct PhysicsRecipe {
    pub base_commands: PathBuf,
    pub catalog: PathBuf,
    pub config_file: PathBuf,
    pub output_root: PathBuf,
    pub program: String,
}

impl PhysicsRecipe {
    /// Recipe using the example files of an installation.
    pub fn for_install(install_root: &Path, config_file: PathBuf, output_root: PathBuf) -> Self {
        Self {
            base_commands: install_root.join(NO_BACKGROUND_FILE),
            catalog: install_root.join(EXAMPLE_CATALOG),
            config_file,
            output_root,
            program: "phosim_run".to_string(),
        }
    }

    /// Base commands with the physics overrides applied.
    pub fn parameters(&self) -> Result<ParameterSet> {
        let mut params = ParameterSet::from_file(&self.base_commands)?;
        for (key, value) in PHYSICS_OVERRIDES {
            params.insert(key, value);
        }
        Ok(params)
    }

    /// Write the extra-commands file and create the output root.
    pub fn prepare(&self) -> Result<ParameterSet> {
        let params = self.parameters()?;
        params.write(&self.config_file, WriteMode::Clobber)?;
        shared::fs_util::ensure_dir(&self.output_root)
            .map_err(OrchestratorError::file(&self.output_root))?;
        log::info!("Wrote physics configuration {}", self.config_file.display());
        Ok(params)
    }

    /// The `phosim_run` command line, with absolute paths.
    pub fn command(&self) -> Result<Vec<String>> {
        let absolute = |path: &Path| -> Result<String> {
            std::path::absolute(path)
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(OrchestratorError::file(path))
        };
        Ok(vec![
            self.program.clone(),
            absolute(&self.catalog)?,
            "-c".to_string(),
            absolute(&self.config_file)?,
            "-o".to_string(),
            absolute(&self.output_root)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ParamValue;
    use tempfile::TempDir;

    fn recipe(root: &TempDir) -> PhysicsRecipe {
        let examples = root.path().join("examples");
        std::fs::create_dir_all(&examples).unwrap();
        std::fs::write(
            examples.join("nobackground"),
            "zodiacalLightMagnitude 100\nexptime 30\ntelescopemode 1\n",
        )
        .unwrap();
        PhysicsRecipe::for_install(
            root.path(),
            root.path().join("my_config.pars"),
            root.path().join("output"),
        )
    }

    #[test]
    fn test_overrides_replace_base_values() {
        let root = TempDir::new().unwrap();
        let params = recipe(&root).parameters().unwrap();

        let keys: Vec<&str> = params.keys().collect();
        assert_eq!(keys[..3], ["zodiacalLightMagnitude", "exptime", "telescopemode"]);
        assert_eq!(params.get("exptime"), Some(&ParamValue::Int(15)));
        assert_eq!(params.get("telescopemode"), Some(&ParamValue::Int(0)));
        assert_eq!(params.get("clearperturbations"), Some(&ParamValue::Int(0)));
        assert_eq!(params.len(), 10);
    }

    #[test]
    fn test_prepare_writes_config_and_command() {
        let root = TempDir::new().unwrap();
        let recipe = recipe(&root);
        recipe.prepare().unwrap();

        let written = std::fs::read_to_string(&recipe.config_file).unwrap();
        assert!(written.contains("clearturbulence 0\n"));
        assert!(recipe.output_root.is_dir());

        let command = recipe.command().unwrap();
        assert_eq!(command[0], "phosim_run");
        assert!(command[1].ends_with("examples/star"));
        assert_eq!(command[2], "-c");
        assert!(command[3].ends_with("my_config.pars"));
    }

    #[test]
    fn test_missing_base_commands() {
        let root = TempDir::new().unwrap();
        let recipe = PhysicsRecipe::for_install(
            root.path(),
            root.path().join("cfg.pars"),
            root.path().join("out"),
        );
        assert!(matches!(
            recipe.parameters(),
            Err(OrchestratorError::Params(_))
        ));
    }
}
