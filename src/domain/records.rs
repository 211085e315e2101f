//! Source-data records read through the relational query façade

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::columns;
use crate::error::Result;
use crate::pad::{Pad, PadKind, Status};

/// Time-bounded calibration context of one mass spectrometer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrInterval {
    pub id: i64,
    pub mass_spec_id: i64,
    pub valid_from: DateTime<Utc>,
    /// Exclusive upper bound, `None` while the interval is still open
    pub valid_until: Option<DateTime<Utc>>,
    /// Replicate analyses declared for this interval, in declaration order
    pub replicate_analysis_ids: Vec<i64>,
}

impl CorrInterval {
    /// Whether `date` lies in `[valid_from, valid_until)`
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        date >= self.valid_from && self.valid_until.map_or(true, |until| date < until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicateType {
    Standard,
    Sample,
}

impl ReplicateType {
    pub fn label(self) -> &'static str {
        match self {
            ReplicateType::Standard => columns::REPLICATE_TYPE_STANDARD,
            ReplicateType::Sample => columns::REPLICATE_TYPE_SAMPLE,
        }
    }
}

/// One physical measurement run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRecord {
    pub id: i64,
    pub sample_id: Option<i64>,
    pub mass_spec_id: i64,
    pub date: DateTime<Utc>,
    pub user_name: String,
    pub analysis: String,
    pub replicate_type: ReplicateType,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub number: i32,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    pub number: i32,
    pub values: BTreeMap<String, f64>,
    pub cycles: Vec<CycleRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    pub channel: String,
    pub coefficients: Vec<f64>,
}

/// Calibration scan of a mass spectrometer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub mass_spec_id: i64,
    pub date: DateTime<Utc>,
    pub user_name: String,
    pub channels: Vec<ChannelCalibration>,
}

/// One configured step of a calculation pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Step input name → pad column
    pub inputs: BTreeMap<String, String>,
    /// Step output name → pad column
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>, column: impl Into<String>) -> Self {
        self.outputs.insert(output.into(), column.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>, column: impl Into<String>) -> Self {
        self.inputs.insert(input.into(), column.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Replicate-level data analysis: correction-interval and replicate steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateAnalysis {
    pub id: i64,
    pub name: String,
    pub corr_interval_steps: Vec<StepConfig>,
    pub replicate_steps: Vec<StepConfig>,
}

/// Sample-level data analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleAnalysis {
    pub id: i64,
    pub name: String,
    pub steps: Vec<StepConfig>,
    /// Replicate analyses whose results this sample analysis accepts
    pub accepted_replicate_analysis_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: i64,
    pub name: String,
}

fn numeric_pad(kind: PadKind, values: &BTreeMap<String, f64>) -> Result<Pad> {
    let mut pad = Pad::new(kind);
    for (column, value) in values {
        pad.set_value(column.as_str(), *value)?;
    }
    Ok(pad)
}

impl ReplicateRecord {
    /// Replicate pad with nested acquisition and cycle pads
    pub fn to_pad(&self, acquisitions: &[AcquisitionRecord]) -> Result<Pad> {
        let mut pad = Pad::new(PadKind::Replicate { date: self.date });
        pad.set_value(columns::REPLICATE_ID, self.id)?;
        pad.set_value(columns::ANALYSIS_COLUMN, self.analysis.as_str())?;
        pad.set_value(columns::USER, self.user_name.as_str())?;
        pad.set_value(columns::MASS_SPEC_ID, self.mass_spec_id)?;
        pad.set_value(columns::REPLICATE_TYPE, self.replicate_type.label())?;
        if let Some(sample_id) = self.sample_id {
            pad.set_value(columns::SAMPLE_ID, sample_id)?;
        }

        for acquisition in acquisitions {
            let mut acquisition_pad = numeric_pad(
                PadKind::Acquisition {
                    number: acquisition.number,
                },
                &acquisition.values,
            )?;
            for cycle in &acquisition.cycles {
                acquisition_pad.add_child(numeric_pad(
                    PadKind::Cycle {
                        number: cycle.number,
                    },
                    &cycle.values,
                )?)?;
            }
            pad.add_child(acquisition_pad)?;
        }
        Ok(pad)
    }
}

impl ScanRecord {
    /// Synthetic SCAN replicate pad carrying per-channel coefficients
    pub fn to_pad(&self) -> Result<Pad> {
        let mut pad = Pad::new(PadKind::Replicate { date: self.date });
        pad.set_value(columns::SCAN_ID, self.id)?;
        pad.set_value(columns::USER, self.user_name.as_str())?;
        pad.set_value(columns::MASS_SPEC_ID, self.mass_spec_id)?;
        pad.set_value(columns::REPLICATE_TYPE, columns::REPLICATE_TYPE_SCAN)?;
        pad.set_value(columns::STATUS, Status::Ok)?;
        for calibration in &self.channels {
            for (index, coefficient) in calibration.coefficients.iter().enumerate() {
                pad.set_value(
                    columns::scan_coefficient(&calibration.channel, index),
                    *coefficient,
                )?;
            }
        }
        Ok(pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::{PadLevel, Value};

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    #[test]
    fn test_interval_is_half_open() {
        let interval = CorrInterval {
            id: 1,
            mass_spec_id: 1,
            valid_from: at(100),
            valid_until: Some(at(200)),
            replicate_analysis_ids: vec![],
        };
        assert!(!interval.contains(at(99)));
        assert!(interval.contains(at(100)));
        assert!(interval.contains(at(199)));
        assert!(!interval.contains(at(200)));

        let open = CorrInterval {
            valid_until: None,
            ..interval
        };
        assert!(open.contains(at(10_000)));
    }

    #[test]
    fn test_replicate_pad_nests_acquisitions_and_cycles() {
        let replicate = ReplicateRecord {
            id: 7,
            sample_id: Some(3),
            mass_spec_id: 1,
            date: at(500),
            user_name: "kim".to_string(),
            analysis: "Pb".to_string(),
            replicate_type: ReplicateType::Sample,
            disabled: false,
        };
        let acquisitions = vec![AcquisitionRecord {
            number: 1,
            values: BTreeMap::from([("Baseline".to_string(), 0.1)]),
            cycles: vec![
                CycleRecord {
                    number: 2,
                    values: BTreeMap::from([("206/204".to_string(), 17.9)]),
                },
                CycleRecord {
                    number: 1,
                    values: BTreeMap::from([("206/204".to_string(), 18.1)]),
                },
            ],
        }];

        let pad = replicate.to_pad(&acquisitions).unwrap();
        assert_eq!(pad.get_value(columns::REPLICATE_ID), Some(&Value::Integer(7)));
        assert_eq!(pad.child_level(), Some(PadLevel::Acquisition));
        let cycles = pad.children()[0].children();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].kind(), &PadKind::Cycle { number: 1 });
    }

    #[test]
    fn test_scan_pad_carries_coefficients() {
        let scan = ScanRecord {
            id: 11,
            mass_spec_id: 1,
            date: at(50),
            user_name: "lab".to_string(),
            channels: vec![ChannelCalibration {
                channel: "H1".to_string(),
                coefficients: vec![1.0, 0.002],
            }],
        };
        let pad = scan.to_pad().unwrap();
        assert_eq!(
            pad.get_value(&columns::scan_coefficient("H1", 1)),
            Some(&Value::Double(0.002))
        );
        assert_eq!(
            pad.get_value(columns::REPLICATE_TYPE),
            Some(&Value::String("SCAN".to_string()))
        );
    }
}
