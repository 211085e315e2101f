//! Domain layer - measurement records and column vocabulary

pub mod columns;
pub mod records;

pub use records::{
    AcquisitionRecord, ChannelCalibration, CorrInterval, CycleRecord, ReplicateAnalysis,
    ReplicateRecord, ReplicateType, SampleAnalysis, SampleRecord, ScanRecord, StepConfig,
};
