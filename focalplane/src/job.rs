//! A single (chip, exposure) unit of raytrace and readout work.

use crate::naming::exposure_id;

/// One raytrace/readout job, identified by observation, chip and exposure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub observation_id: String,
    pub chip_id: String,
    /// Zero-based exposure index within the chip's visit.
    pub exposure: i64,
    /// Total exposures the chip takes during the visit.
    pub exposure_count: i64,
    /// Index of the trim batch holding this chip.
    pub trim_batch: usize,
    pub filter: String,
}

impl Job {
    pub fn exposure_id(&self) -> String {
        exposure_id(self.exposure)
    }

    /// `{observation}_{chip}_{exposure}`, unique within a run.
    pub fn file_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.observation_id,
            self.chip_id,
            self.exposure_id()
        )
    }

    pub fn image_params(&self) -> String {
        format!("image_{}.pars", self.file_id())
    }

    pub fn raytrace_params(&self) -> String {
        format!("raytrace_{}.pars", self.file_id())
    }

    pub fn e2adc_params(&self) -> String {
        format!("e2adc_{}.pars", self.file_id())
    }

    /// Electron image written by raytrace into the working directory.
    pub fn electron_image(&self, instrument: &str) -> String {
        format!("{instrument}_e_{}.fits", self.file_id())
    }

    /// ADC image for one amplifier written by the readout step.
    pub fn amplifier_image(&self, instrument: &str, amplifier: &str) -> String {
        format!(
            "{instrument}_a_{}_{amplifier}_{}.fits",
            self.observation_id,
            self.exposure_id()
        )
    }

    /// Final electron image name in the output directory.
    pub fn output_electron_image(&self, instrument: &str) -> String {
        output_image_name(instrument, 'e', self, &self.chip_id)
    }

    /// Final amplifier image name in the output directory.
    pub fn output_amplifier_image(&self, instrument: &str, amplifier: &str) -> String {
        output_image_name(instrument, 'a', self, amplifier)
    }
}

/// `{instrument}_{e|a}_{obsId}_f{filter}_{device}_{expId}.fits.gz`
fn output_image_name(instrument: &str, kind: char, job: &Job, device: &str) -> String {
    format!(
        "{instrument}_{kind}_{}_f{}_{device}_{}.fits.gz",
        job.observation_id,
        job.filter,
        job.exposure_id()
    )
}
