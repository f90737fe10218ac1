//! Instrument geometry: which chips exist, which run, and how many exposures each takes.

use std::path::Path;
use std::str::FromStr;

use crate::catalog::{CameraConfig, ObservationHeader};
use crate::error::{OrchestratorError, Result};

pub const FOCAL_PLANE_LAYOUT_FILE: &str = "focalplanelayout.txt";
pub const SEGMENTATION_FILE: &str = "segmentation.txt";

const GROUP_LABELS: [&str; 3] = ["Group0", "Group1", "Group2"];
const DEVICE_TYPE_COLUMN: usize = 6;
const DEVICE_VALUE_COLUMN: usize = 7;

/// Optional restriction of the run to a set of chip ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChipFilter {
    #[default]
    All,
    Only(Vec<String>),
}

impl ChipFilter {
    pub fn allows(&self, chip_id: &str) -> bool {
        match self {
            ChipFilter::All => true,
            ChipFilter::Only(ids) => ids.iter().any(|id| id == chip_id),
        }
    }
}

impl FromStr for ChipFilter {
    type Err = String;

    /// Parse `all` or a `|` separated list of chip ids.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s == "all" {
            return Ok(ChipFilter::All);
        }
        let ids: Vec<String> = s
            .split('|')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err("Chip filter must be 'all' or chip ids separated by '|'".to_string());
        }
        Ok(ChipFilter::Only(ids))
    }
}

/// Kind of imaging device, which decides the exposure count policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Area-based sensor, exposes once per snap.
    Ccd,
    /// Time-based sensor; the device value is its frame time.
    TimeBased(String),
}

impl DeviceKind {
    fn parse(token: &str) -> Self {
        if token == "CCD" {
            DeviceKind::Ccd
        } else {
            DeviceKind::TimeBased(token.to_string())
        }
    }
}

/// One chip of the focal plane for this run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipRecord {
    pub id: String,
    pub kind: DeviceKind,
    pub device_value: f64,
    pub enabled: bool,
}

impl ChipRecord {
    /// Number of exposures this chip takes during the visit.
    ///
    /// CCDs take `nsnap` exposures; time-based devices take
    /// `floor(visit_time / device_value)`, truncated rather than rounded.
    pub fn exposure_count(&self, nsnap: i64, visit_time: f64) -> i64 {
        match self.kind {
            DeviceKind::Ccd => nsnap,
            DeviceKind::TimeBased(_) => (visit_time / self.device_value).trunc() as i64,
        }
    }

    pub fn exposures_for(&self, header: &ObservationHeader) -> i64 {
        self.exposure_count(header.nsnap, header.visit_time)
    }
}

/// The chips of the active geometry groups, in layout file order.
#[derive(Debug, Clone, Default)]
pub struct FocalPlane {
    pub chips: Vec<ChipRecord>,
}

impl FocalPlane {
    /// Read `focalplanelayout.txt` from the instrument directory.
    ///
    /// Enabled flags are computed fresh from the camera configuration and filter.
    pub fn load(instr_dir: &Path, camera: &CameraConfig, filter: &ChipFilter) -> Result<Self> {
        let path = instr_dir.join(FOCAL_PLANE_LAYOUT_FILE);
        let text = std::fs::read_to_string(&path).map_err(OrchestratorError::file(&path))?;
        Self::parse(&text, camera, filter).map_err(|message| OrchestratorError::Layout {
            path: path.clone(),
            message,
        })
    }

    pub fn parse(
        text: &str,
        camera: &CameraConfig,
        filter: &ChipFilter,
    ) -> std::result::Result<Self, String> {
        let mut chips = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let Some(group) = GROUP_LABELS.iter().position(|label| line.contains(label)) else {
                continue;
            };
            if !camera.group_enabled(group) {
                continue;
            }

            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() <= DEVICE_VALUE_COLUMN {
                return Err(format!(
                    "line {}: expected at least {} columns",
                    lineno + 1,
                    DEVICE_VALUE_COLUMN + 1
                ));
            }
            let device_value: f64 = columns[DEVICE_VALUE_COLUMN].parse().map_err(|_| {
                format!(
                    "line {}: invalid device value '{}'",
                    lineno + 1,
                    columns[DEVICE_VALUE_COLUMN]
                )
            })?;
            let kind = DeviceKind::parse(columns[DEVICE_TYPE_COLUMN]);
            // The device value divides the visit time for time-based sensors
            if matches!(kind, DeviceKind::TimeBased(_))
                && !(device_value.is_finite() && device_value > 0.0)
            {
                return Err(format!(
                    "line {}: time-based device needs a positive frame time, got {device_value}",
                    lineno + 1
                ));
            }
            let id = columns[0].to_string();
            chips.push(ChipRecord {
                enabled: filter.allows(&id),
                kind,
                device_value,
                id,
            });
        }
        Ok(Self { chips })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ChipRecord> {
        self.chips.iter().filter(|chip| chip.enabled)
    }
}

/// Amplifier ids per chip, from `segmentation.txt`.
#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    amplifiers: Vec<String>,
}

impl Segmentation {
    pub fn load(instr_dir: &Path) -> Result<Self> {
        let path = instr_dir.join(SEGMENTATION_FILE);
        let text = std::fs::read_to_string(&path).map_err(OrchestratorError::file(&path))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let amplifiers = text
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|id| !id.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { amplifiers }
    }

    /// Amplifiers read out from `chip_id`, in file order.
    pub fn amplifiers_of<'a>(&'a self, chip_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.amplifiers.iter().filter_map(move |amp| {
            let belongs = amp
                .strip_prefix(chip_id)
                .is_some_and(|rest| rest.starts_with('_'));
            belongs.then_some(amp.as_str())
        })
    }
}
