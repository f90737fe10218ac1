//! File names used inside the working and output directories.
//!
//! Every intermediate file carries the observation id, and per-chip or per-job
//! files add the chip and exposure ids, so jobs of one run never collide.

/// Names of the per-observation and per-chip intermediate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationFiles {
    obs: String,
}

impl ObservationFiles {
    pub fn new(observation_id: impl Into<String>) -> Self {
        Self {
            obs: observation_id.into(),
        }
    }

    pub fn observation_id(&self) -> &str {
        &self.obs
    }

    pub fn obs_params(&self) -> String {
        format!("obs_{}.pars", self.obs)
    }

    pub fn obs_extra_params(&self) -> String {
        format!("obsExtra_{}.pars", self.obs)
    }

    pub fn object_catalog(&self) -> String {
        format!("objectcatalog_{}.pars", self.obs)
    }

    pub fn catalog_list(&self) -> String {
        format!("catlist_{}.pars", self.obs)
    }

    pub fn atmosphere_params(&self) -> String {
        format!("atmosphere_{}.pars", self.obs)
    }

    pub fn optics_params(&self) -> String {
        format!("optics_{}.pars", self.obs)
    }

    pub fn tracking_params(&self) -> String {
        format!("tracking_{}.pars", self.obs)
    }

    pub fn chip_params(&self, chip: &str) -> String {
        format!("chip_{}_{chip}.pars", self.obs)
    }

    pub fn readout_params(&self, chip: &str) -> String {
        format!("readout_{}_{chip}.pars", self.obs)
    }

    pub fn trim_params(&self, batch: usize) -> String {
        format!("trim_{}_{batch}.pars", self.obs)
    }

    pub fn trimmed_catalog(&self, chip: &str) -> String {
        format!("trimcatalog_{}_{chip}.pars", self.obs)
    }

    pub fn airglow_screen(&self) -> String {
        format!("airglowscreen_{}.fits", self.obs)
    }

    /// Glob patterns of the loop-generated screen files.
    pub fn screen_patterns(&self) -> [String; 2] {
        [
            format!("atmospherescreen_{}_*", self.obs),
            format!("cloudscreen_{}_*", self.obs),
        ]
    }

    pub fn throughput_pattern(&self) -> String {
        format!("throughput_*{}_*", self.obs)
    }

    pub fn centroid_pattern(&self) -> String {
        format!("centroid_*{}_*", self.obs)
    }

    pub fn dag_file(&self) -> String {
        format!("{}.dag", self.obs)
    }
}

/// Fixed names of optional whole-run artifacts.
pub const EVENT_FILE: &str = "output.fits";
pub const OPD_FILE: &str = "opd.fits";

/// Exposure id as used in file names, `E000`, `E001`, ...
pub fn exposure_id(index: i64) -> String {
    format!("E{index:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_carry_observation_and_chip() {
        let files = ObservationFiles::new("9006");
        assert_eq!(files.obs_params(), "obs_9006.pars");
        assert_eq!(files.chip_params("R22_S11"), "chip_9006_R22_S11.pars");
        assert_eq!(files.trim_params(3), "trim_9006_3.pars");
        assert_eq!(files.screen_patterns()[1], "cloudscreen_9006_*");
        assert_eq!(exposure_id(7), "E007");
    }
}
