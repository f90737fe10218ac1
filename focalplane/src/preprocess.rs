//! Per-observation preprocessing.
//!
//! Steps run strictly in order, each leaving files in the working directory for
//! the next one:
//!
//! 1. `obs_<obs>.pars` with the catalog's settings under the simulator's names
//! 2. `objectcatalog_<obs>.pars` and `catlist_<obs>.pars`
//! 3. `atmosphere` (writes `atmosphere_<obs>.pars` and the screens)
//! 4. `instrument` (writes `optics_<obs>.pars`, `chip_*`, `readout_*`)
//! 5. `trim` per batch of chips, here or as part of the backend's job graph
//!
//! A failing program stops the pipeline; nothing is retried.

use std::fmt::Write as _;

use shared::fs_util::remove_if_exists;
use shared::params::write_atomic;
use shared::{ParameterSet, WriteMode};

use crate::backend::{ExecutionBackend, TrimMode};
use crate::catalog::InstanceCatalog;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::expand::{plan_trim_batches, read_work_file, write_trim_batch, TrimBatch};
use crate::layout::FocalPlane;
use crate::naming::ObservationFiles;
use crate::tool::ToolRunner;

/// Instance catalog keys and the names the simulator expects for them, in output order.
pub const OPSIM_KEY_MAP: [(&str, &str); 31] = [
    ("Opsim_moonra", "moonra"),
    ("Opsim_moondec", "moondec"),
    ("Opsim_sunalt", "solaralt"),
    ("Opsim_moonalt", "moonalt"),
    ("Opsim_dist2moon", "moondist"),
    ("Opsim_moonphase", "phaseang"),
    ("Opsim_expmjd", "tai"),
    ("Opsim_rawseeing", "constrainseeing"),
    ("Opsim_rottelpos", "spiderangle"),
    ("Unrefracted_Azimuth", "azimuth"),
    ("Unrefracted_Altitude", "altitude"),
    ("Opsim_rotskypos", "rotationangle"),
    ("Unrefracted_RA_deg", "pointingra"),
    ("Unrefracted_Dec_deg", "pointingdec"),
    ("SIM_SEED", "obsseed"),
    ("Opsim_filter", "filter"),
    ("SIM_VISTIME", "vistime"),
    ("SIM_MINSOURCE", "minNumSources"),
    ("SIM_CAMCONFIG", "camconfig"),
    ("SIM_DOMEINT", "domelight"),
    ("SIM_DOMEWAV", "domewave"),
    ("SIM_TELCONFIG", "telconfig"),
    ("SIM_TEMPERATURE", "temperature"),
    ("SIM_TEMPVAR", "tempvar"),
    ("SIM_PRESSURE", "pressure"),
    ("SIM_PRESSVAR", "pressvar"),
    ("SIM_OVERDEPBIAS", "overdepbias"),
    ("SIM_CCDTEMP", "ccdtemp"),
    ("SIM_ALTVAR", "altvar"),
    ("SIM_CONTROL", "control"),
    ("SIM_ACTUATOR", "actuator"),
];

const ATMOSPHERE: &str = "atmosphere";
const INSTRUMENT: &str = "instrument";
const TRIM: &str = "trim";

/// Write `obs_<obs>.pars`: translated catalog keys plus run paths.
pub fn write_observation_params(
    ctx: &ExecutionContext,
    catalog: &InstanceCatalog,
    files: &ObservationFiles,
) -> Result<()> {
    let mut params = ParameterSet::new();
    for (catalog_key, simulator_key) in OPSIM_KEY_MAP {
        params.insert(simulator_key, catalog.required(catalog_key)?.clone());
    }
    params.insert("obshistid", catalog.observation_id());
    params.insert("monthnum", catalog.header.month.as_str());
    for (key, dir) in [
        ("seddir", &ctx.sed_dir),
        ("imagedir", &ctx.image_dir),
        ("datadir", &ctx.data_dir),
        ("instrdir", &ctx.instr_dir),
        ("bindir", &ctx.bin_dir),
    ] {
        params.insert(key, dir.to_string_lossy().into_owned());
    }
    if ctx.flat_dir() {
        params.insert("flatdir", 1);
    }

    params.write(&ctx.work_file(&files.obs_params()), WriteMode::Clobber)?;
    Ok(())
}

/// Write the inline object list and the catalog manifest. Returns the number
/// of catalog fragments listed.
pub fn write_catalog_list(
    ctx: &ExecutionContext,
    catalog: &InstanceCatalog,
    files: &ObservationFiles,
) -> Result<usize> {
    let object_path = ctx.work_file(&files.object_catalog());
    let mut objects = String::new();
    for line in catalog.object_lines() {
        objects.push_str(line);
        objects.push('\n');
    }

    let mut fragments = Vec::new();
    if objects.is_empty() {
        remove_if_exists(&object_path).map_err(OrchestratorError::file(&object_path))?;
    } else {
        write_atomic(&object_path, objects.as_bytes())?;
        fragments.push(files.object_catalog());
    }
    for path in catalog.included_catalogs()? {
        fragments.push(path.to_string_lossy().into_owned());
    }

    let mut manifest = String::new();
    for (number, fragment) in fragments.iter().enumerate() {
        let _ = writeln!(manifest, "catalog {number} {fragment}");
    }
    write_atomic(&ctx.work_file(&files.catalog_list()), manifest.as_bytes())?;
    log::debug!("Listed {} catalog fragments", fragments.len());
    Ok(fragments.len())
}

/// Run `atmosphere` on the observation parameters plus extra commands.
///
/// Existing screens are reused unless regeneration was requested. Returns
/// whether the program ran.
pub fn generate_atmosphere(
    ctx: &ExecutionContext,
    runner: &ToolRunner,
    catalog: &InstanceCatalog,
    files: &ObservationFiles,
) -> Result<bool> {
    if !ctx.options.regenerate_screens && ctx.work_file(&files.atmosphere_params()).exists() {
        log::info!(
            "Reusing atmosphere screens of observation {}",
            files.observation_id()
        );
        return Ok(false);
    }

    let mut input = read_work_file(ctx, &files.obs_params())?;
    input.push_str(&catalog.extra.contents()?);
    let input_path = ctx.work_file(&files.obs_extra_params());
    write_atomic(&input_path, input.as_bytes())?;

    let outcome = runner.run_with_params(ATMOSPHERE, &files.obs_extra_params());
    if let Err(e) = remove_if_exists(&input_path) {
        log::warn!("Could not remove {}: {e}", input_path.display());
    }
    outcome.map(|()| true)
}

/// Run `instrument` on the observation parameters.
pub fn generate_instrument_config(runner: &ToolRunner, files: &ObservationFiles) -> Result<()> {
    runner.run_with_params(INSTRUMENT, &files.obs_params())
}

/// Write every trim batch and trim it here or hand it to the backend.
///
/// Batches without an enabled chip are dropped, as are the parameter files of
/// batches trimmed here.
pub fn trim_objects(
    ctx: &ExecutionContext,
    runner: &ToolRunner,
    files: &ObservationFiles,
    plane: &FocalPlane,
    backend: &mut dyn ExecutionBackend,
) -> Result<Vec<TrimBatch>> {
    let batches = plan_trim_batches(files, plane);
    for batch in &batches {
        write_trim_batch(ctx, files, batch)?;
        let path = ctx.work_file(&batch.param_file);

        if !batch.has_enabled() {
            log::debug!("Trim batch {} has no enabled chips", batch.index);
            remove_if_exists(&path).map_err(OrchestratorError::file(&path))?;
            continue;
        }

        match backend.trim_mode() {
            TrimMode::Local => {
                runner.run_with_params(TRIM, &batch.param_file)?;
                remove_if_exists(&path).map_err(OrchestratorError::file(&path))?;
            }
            TrimMode::Deferred => backend.submit_trim(batch)?,
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::write_defaults;
    use crate::context::{BackendConfig, Universe};
    use crate::expand::tests::scratch_context;
    use tempfile::TempDir;

    fn load_catalog(dir: &TempDir, body: &str) -> InstanceCatalog {
        let defaults = write_defaults(dir.path());
        let path = dir.path().join("instcat.txt");
        std::fs::write(&path, body).unwrap();
        InstanceCatalog::load(&defaults, &path, None).unwrap()
    }

    #[test]
    fn test_observation_params_translate_keys() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let catalog = load_catalog(&root, "Opsim_obshistid 1234\nOpsim_filter 3\n");
        let files = ObservationFiles::new(catalog.observation_id());

        write_observation_params(&ctx, &catalog, &files).unwrap();

        let params = ParameterSet::from_file(&ctx.work_file("obs_1234.pars")).unwrap();
        let keys: Vec<&str> = params.keys().collect();
        assert_eq!(keys[0], "moonra");
        assert_eq!(keys[30], "actuator");
        assert_eq!(keys[31], "obshistid");
        assert_eq!(params.get("filter").unwrap().to_string(), "3");
        assert_eq!(params.get("monthnum").unwrap().to_string(), "7");
        assert_eq!(params.get("vistime").unwrap().to_string(), "33.0");
        assert!(params.get("bindir").unwrap().to_string().ends_with("bin"));
        assert!(!params.contains_key("flatdir"));
        assert!(!params.contains_key("Opsim_filter"));
    }

    #[test]
    fn test_vanilla_universe_writes_flatdir() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(
            &root,
            BackendConfig::DistributedBatch {
                universe: Universe::Vanilla,
                checkpoint: 0,
                submit_program: None,
            },
        );
        let catalog = load_catalog(&root, "Opsim_obshistid 1234\n");
        let files = ObservationFiles::new(catalog.observation_id());

        write_observation_params(&ctx, &catalog, &files).unwrap();
        let text = std::fs::read_to_string(ctx.work_file("obs_1234.pars")).unwrap();
        assert!(text.ends_with("flatdir 1\n"));
    }

    #[test]
    fn test_catalog_list_with_objects_and_includes() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let catalog = load_catalog(
            &root,
            "Opsim_obshistid 1234\nobject 1 0.0 0.0 20 sed.txt 0 0 0 0 0 0 point none none\nincludeobj galaxies.txt\n",
        );
        let files = ObservationFiles::new(catalog.observation_id());

        assert_eq!(write_catalog_list(&ctx, &catalog, &files).unwrap(), 2);

        let manifest = std::fs::read_to_string(ctx.work_file("catlist_1234.pars")).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines[0], "catalog 0 objectcatalog_1234.pars");
        assert!(lines[1].starts_with("catalog 1 /"));
        assert!(lines[1].ends_with("galaxies.txt"));
        let objects = std::fs::read_to_string(ctx.work_file("objectcatalog_1234.pars")).unwrap();
        assert!(objects.starts_with("object 1 "));
    }

    #[test]
    fn test_catalog_list_without_inline_objects() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let catalog = load_catalog(&root, "Opsim_obshistid 1234\nincludeobj stars.txt\n");
        let files = ObservationFiles::new(catalog.observation_id());

        assert_eq!(write_catalog_list(&ctx, &catalog, &files).unwrap(), 1);
        assert!(!ctx.work_file("objectcatalog_1234.pars").exists());
        let manifest = std::fs::read_to_string(ctx.work_file("catlist_1234.pars")).unwrap();
        assert!(manifest.starts_with("catalog 0 /"));
    }

    #[test]
    fn test_existing_screens_are_reused() {
        let root = TempDir::new().unwrap();
        let ctx = scratch_context(&root, BackendConfig::default());
        let catalog = load_catalog(&root, "Opsim_obshistid 1234\n");
        let files = ObservationFiles::new(catalog.observation_id());
        std::fs::write(ctx.work_file(&files.atmosphere_params()), "seeing 0.7\n").unwrap();

        // No atmosphere program is installed, so running it would fail
        let runner = ToolRunner::new(&ctx.bin_dir, &ctx.work_dir);
        assert!(!generate_atmosphere(&ctx, &runner, &catalog, &files).unwrap());
    }

    #[cfg(unix)]
    mod programs {
        use super::*;
        use crate::layout::{ChipRecord, DeviceKind};
        use crate::backend::{Backend, ExecutionBackend};
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn install(bin: &Path, name: &str, body: &str) {
            let path = bin.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[test]
        fn test_failed_atmosphere_removes_temporary_input() {
            let root = TempDir::new().unwrap();
            let ctx = scratch_context(&root, BackendConfig::default());
            install(&ctx.bin_dir, "atmosphere", "cat > /dev/null\nexit 2");
            let catalog = load_catalog(&root, "Opsim_obshistid 1234\n");
            let files = ObservationFiles::new(catalog.observation_id());
            write_observation_params(&ctx, &catalog, &files).unwrap();

            let runner = ToolRunner::new(&ctx.bin_dir, &ctx.work_dir);
            let err = generate_atmosphere(&ctx, &runner, &catalog, &files).unwrap_err();

            assert!(matches!(
                err,
                OrchestratorError::ExternalToolFailure { code: Some(2), .. }
            ));
            assert!(!ctx.work_file("obsExtra_1234.pars").exists());
        }

        #[test]
        fn test_local_trim_runs_enabled_batches_only() {
            let root = TempDir::new().unwrap();
            let ctx = scratch_context(&root, BackendConfig::default());
            install(&ctx.bin_dir, "trim", "cat >> trim_inputs.log");
            let files = ObservationFiles::new("1234");
            std::fs::write(ctx.work_file(&files.obs_params()), "obshistid 1234\n").unwrap();
            std::fs::write(ctx.work_file(&files.catalog_list()), "").unwrap();

            let plane = FocalPlane {
                chips: (0..10)
                    .map(|i| ChipRecord {
                        id: format!("R22_S{i:02}"),
                        kind: DeviceKind::Ccd,
                        device_value: 3.0,
                        enabled: i < 9,
                    })
                    .collect(),
            };
            let mut backend = Backend::from_context(&ctx).unwrap();
            assert_eq!(backend.trim_mode(), TrimMode::Local);

            let runner = ToolRunner::new(&ctx.bin_dir, &ctx.work_dir);
            let batches = trim_objects(&ctx, &runner, &files, &plane, &mut backend).unwrap();
            backend.drain().unwrap();

            assert_eq!(batches.len(), 2);
            let inputs = std::fs::read_to_string(ctx.work_file("trim_inputs.log")).unwrap();
            assert_eq!(inputs.matches("obshistid 1234").count(), 1);
            assert!(!ctx.work_file("trim_1234_0.pars").exists());
            assert!(!ctx.work_file("trim_1234_1.pars").exists());
        }
    }
}
