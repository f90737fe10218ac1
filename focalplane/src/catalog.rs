//! Instance catalog loading.
//!
//! An instance catalog describes one observation: scalar `key value` settings,
//! inline `object ...` definitions and `includeobj <path>` references to
//! sub-catalogs. Scalars are merged over the installation's default catalog
//! (last write wins); object lines are kept verbatim since they cannot be
//! flattened into a parameter set.

use std::path::{Path, PathBuf};

use shared::{ParamValue, ParameterSet};

use crate::error::{OrchestratorError, Result};

/// Default catalog shipped in the installation root.
pub const DEFAULT_CATALOG_NAME: &str = "default_instcat";

pub const OBSERVATION_ID_KEY: &str = "Opsim_obshistid";
pub const DATE_KEY: &str = "Slalib_date";
pub const NSNAP_KEY: &str = "SIM_NSNAP";
pub const CAMCONFIG_KEY: &str = "SIM_CAMCONFIG";
pub const MIN_SOURCE_KEY: &str = "SIM_MINSOURCE";
pub const FILTER_KEY: &str = "Opsim_filter";
pub const VISIT_TIME_KEY: &str = "SIM_VISTIME";

const OBJECT_DIRECTIVE: &str = "object";
const INCLUDE_DIRECTIVE: &str = "includeobj";

/// A raw catalog body line that is not a scalar parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEntry {
    /// An inline object definition, stored as the full original line.
    Object(String),
    /// A reference to a sub-catalog, relative to the instance catalog's directory.
    Include(PathBuf),
}

/// Optional flags read from an extra-commands file. All switches default to off.
#[derive(Debug, Clone, Default)]
pub struct ExtraCommands {
    pub path: Option<PathBuf>,
    pub extra_id: Option<ParamValue>,
    pub event_file: bool,
    pub throughput_file: bool,
    pub centroid_file: bool,
    pub opd_file: bool,
}

impl ExtraCommands {
    /// Read the known flags from `path`; absent flags leave the defaults in place.
    pub fn load(path: &Path) -> Result<Self> {
        let params = ParameterSet::from_file(path)?;
        let switch = |key: &str| params.get(key).is_some_and(ParamValue::is_switched_on);
        Ok(Self {
            path: Some(path.to_path_buf()),
            extra_id: params.get("extraid").cloned(),
            event_file: switch("eventfile"),
            throughput_file: switch("throughputfile"),
            centroid_file: switch("centroidfile"),
            opd_file: switch("opdfile"),
        })
    }

    /// Raw text of the extra-commands file, empty when none was supplied.
    pub fn contents(&self) -> Result<String> {
        match &self.path {
            Some(path) => std::fs::read_to_string(path).map_err(OrchestratorError::file(path)),
            None => Ok(String::new()),
        }
    }
}

/// Camera configuration selecting which focal plane groups are active.
///
/// The configuration is written as a three digit string: the last digit
/// controls `Group0`, the middle one `Group1` and the first one `Group2`. A
/// digit enables its group only if it is exactly `1`. Zero enables everything,
/// and values above `111` are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    digits: String,
}

impl CameraConfig {
    pub fn from_value(value: &ParamValue) -> Result<Self> {
        let invalid = |reason: &str| OrchestratorError::InvalidField {
            key: CAMCONFIG_KEY.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let digits = match value {
            ParamValue::Int(0) => "111".to_string(),
            ParamValue::Int(v @ 1..=111) => format!("{v:03}"),
            ParamValue::Int(_) => return Err(invalid("camera configuration must be 0 to 111")),
            ParamValue::Str(s) => {
                let s = s.trim();
                if s.is_empty() || s.len() > 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("camera configuration must be up to three digits"));
                }
                format!("{s:0>3}")
            }
            _ => return Err(invalid("camera configuration must be an integer")),
        };
        Ok(Self { digits })
    }

    /// Whether `GroupN` chips take part in the run.
    pub fn group_enabled(&self, group: usize) -> bool {
        let bytes = self.digits.as_bytes();
        group < 3 && bytes.len() >= 3 && bytes[bytes.len() - 1 - group] == b'1'
    }
}

/// Identifiers derived once at load time.
#[derive(Debug, Clone)]
pub struct ObservationHeader {
    pub observation_id: String,
    pub month: String,
    pub nsnap: i64,
    pub camera: CameraConfig,
    pub min_sources: i64,
    pub filter: String,
    pub visit_time: f64,
}

/// A parsed instance catalog merged over the defaults.
#[derive(Debug, Clone)]
pub struct InstanceCatalog {
    pub path: PathBuf,
    pub params: ParameterSet,
    pub entries: Vec<CatalogEntry>,
    pub header: ObservationHeader,
    pub extra: ExtraCommands,
}

impl InstanceCatalog {
    /// Load the default catalog, then the user catalog, then optional extra commands.
    ///
    /// Fails with [`OrchestratorError::MissingField`] before any program runs if a
    /// required key is absent from the merged parameters.
    pub fn load(
        default_catalog: &Path,
        instance_catalog: &Path,
        extra_commands: Option<&Path>,
    ) -> Result<Self> {
        let mut params = ParameterSet::from_file(default_catalog)?;

        let text = std::fs::read_to_string(instance_catalog)
            .map_err(OrchestratorError::file(instance_catalog))?;
        let mut entries = Vec::new();
        for line in text.lines() {
            match line.split_whitespace().next() {
                Some(OBJECT_DIRECTIVE) => entries.push(CatalogEntry::Object(line.to_string())),
                Some(INCLUDE_DIRECTIVE) => {
                    let target = line.split_whitespace().nth(1).ok_or_else(|| {
                        OrchestratorError::InvalidField {
                            key: INCLUDE_DIRECTIVE.to_string(),
                            value: line.to_string(),
                            reason: "missing sub-catalog path".to_string(),
                        }
                    })?;
                    entries.push(CatalogEntry::Include(PathBuf::from(target)));
                }
                _ => params.merge_lines([line]),
            }
        }

        let header = derive_header(&params)?;
        let extra = match extra_commands {
            Some(path) => ExtraCommands::load(path)?,
            None => ExtraCommands::default(),
        };

        log::info!(
            "Loaded observation {} ({} inline objects, {} sub-catalogs)",
            header.observation_id,
            entries
                .iter()
                .filter(|e| matches!(e, CatalogEntry::Object(_)))
                .count(),
            entries
                .iter()
                .filter(|e| matches!(e, CatalogEntry::Include(_)))
                .count()
        );
        if let Some(extra_id) = &extra.extra_id {
            log::debug!("Extra commands carry extraid {extra_id}");
        }

        Ok(Self {
            path: instance_catalog.to_path_buf(),
            params,
            entries,
            header,
            extra,
        })
    }

    pub fn observation_id(&self) -> &str {
        &self.header.observation_id
    }

    /// Inline object definitions in catalog order.
    pub fn object_lines(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            CatalogEntry::Object(line) => Some(line.as_str()),
            CatalogEntry::Include(_) => None,
        })
    }

    /// Sub-catalog references resolved against the instance catalog's directory.
    pub fn included_catalogs(&self) -> Result<Vec<PathBuf>> {
        let base = std::path::absolute(&self.path).map_err(OrchestratorError::file(&self.path))?;
        let dir = base.parent().unwrap_or(Path::new("/")).to_path_buf();
        Ok(self
            .entries
            .iter()
            .filter_map(|e| match e {
                CatalogEntry::Include(rel) => Some(dir.join(rel)),
                CatalogEntry::Object(_) => None,
            })
            .collect())
    }

    /// Look up a merged parameter that must be present.
    pub fn required(&self, key: &str) -> Result<&ParamValue> {
        required(&self.params, key)
    }
}

fn required<'a>(params: &'a ParameterSet, key: &str) -> Result<&'a ParamValue> {
    params
        .get(key)
        .ok_or_else(|| OrchestratorError::MissingField(key.to_string()))
}

fn invalid(key: &str, value: &ParamValue, reason: &str) -> OrchestratorError {
    OrchestratorError::InvalidField {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn required_int(params: &ParameterSet, key: &str) -> Result<i64> {
    let value = required(params, key)?;
    value
        .as_i64()
        .ok_or_else(|| invalid(key, value, "expected an integer"))
}

fn derive_header(params: &ParameterSet) -> Result<ObservationHeader> {
    let observation_id = required(params, OBSERVATION_ID_KEY)?.to_string();

    let date = required(params, DATE_KEY)?;
    let month = date
        .to_string()
        .split('/')
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| invalid(DATE_KEY, date, "expected a '/' separated date"))?;

    let nsnap = required_int(params, NSNAP_KEY)?;
    let camera = CameraConfig::from_value(required(params, CAMCONFIG_KEY)?)?;
    let min_sources = required_int(params, MIN_SOURCE_KEY)?;
    let filter = required(params, FILTER_KEY)?.to_string();

    let vistime = required(params, VISIT_TIME_KEY)?;
    let visit_time = vistime
        .as_f64()
        .ok_or_else(|| invalid(VISIT_TIME_KEY, vistime, "expected a number"))?;

    Ok(ObservationHeader {
        observation_id,
        month,
        nsnap,
        camera,
        min_sources,
        filter,
        visit_time,
    })
}
