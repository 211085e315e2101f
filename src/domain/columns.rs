//! Well-known column names shared by the orchestrators and pipeline steps

pub use crate::pad::ANALYSIS_COLUMN;

pub const REPLICATE_ID: &str = "Replicate ID";
pub const REPLICATE_TYPE: &str = "Replicate Type";
pub const USER: &str = "User";
pub const MASS_SPEC_ID: &str = "Mass Spec ID";
pub const SAMPLE_ID: &str = "Sample ID";
pub const SCAN_ID: &str = "Scan ID";
pub const STATUS: &str = "Status";

/// Message of a calculation error a step attached to a pad
pub const CALCULATION_ERROR: &str = "Calculation Error";
/// Name of the step that attached [`CALCULATION_ERROR`]
pub const ERROR_STEP: &str = "Error Step";

/// Column of the `index`-th calibration coefficient of a scan channel
pub fn scan_coefficient(channel: &str, index: usize) -> String {
    format!("{} Coefficient {}", channel, index)
}

pub const REPLICATE_TYPE_STANDARD: &str = "STANDARD";
pub const REPLICATE_TYPE_SAMPLE: &str = "SAMPLE";
pub const REPLICATE_TYPE_SCAN: &str = "SCAN";
