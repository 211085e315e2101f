//! Lazy and frozen statistics cells
//!
//! A dynamic accumulator is bound to the pad whose column map holds it and
//! aggregates that column across the pad's children when asked. A frozen
//! accumulator is an immutable `(mean, sd, se, ci)` tuple with no owner.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use statrs::distribution::{ContinuousCDF, StudentsT};

use super::value::Value;
use super::Pad;

/// Default two-sided confidence level for confidence intervals
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

static CONFIDENCE_LEVEL: Lazy<RwLock<f64>> =
    Lazy::new(|| RwLock::new(DEFAULT_CONFIDENCE_LEVEL));

/// Process-wide confidence level used by every accumulator
pub fn confidence_level() -> f64 {
    *CONFIDENCE_LEVEL.read()
}

/// Replace the process-wide confidence level
///
/// Values outside the open interval (0, 1) are ignored.
pub fn set_confidence_level(level: f64) {
    if level > 0.0 && level < 1.0 {
        *CONFIDENCE_LEVEL.write() = level;
    } else {
        tracing::warn!(level, "Ignoring out-of-range confidence level");
    }
}

/// `(mean, sample std-dev, sample std-err, confidence interval)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatedValues {
    pub mean: f64,
    pub std_dev: f64,
    pub std_err: f64,
    pub confidence_interval: f64,
}

impl AccumulatedValues {
    pub fn new(mean: f64, std_dev: f64, std_err: f64, confidence_interval: f64) -> Self {
        Self {
            mean,
            std_dev,
            std_err,
            confidence_interval,
        }
    }

    /// Statistics of nothing
    pub fn empty() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    }

    /// Tuple access by index (0 = mean, 1 = sd, 2 = se, 3 = ci)
    pub fn get(&self, index: usize) -> Option<f64> {
        match index {
            0 => Some(self.mean),
            1 => Some(self.std_dev),
            2 => Some(self.std_err),
            3 => Some(self.confidence_interval),
            _ => None,
        }
    }

    /// Sample statistics with a Student-t confidence interval
    pub fn from_samples(samples: &[f64], confidence_level: f64) -> Self {
        let n = samples.len();
        if n == 0 {
            return Self::empty();
        }

        let mean = samples.iter().sum::<f64>() / n as f64;
        if n == 1 {
            return Self::new(mean, 0.0, 0.0, 0.0);
        }

        let variance = samples
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let std_dev = variance.sqrt();
        let std_err = std_dev / (n as f64).sqrt();

        let degrees_of_freedom = (n - 1) as f64;
        let confidence_interval = match StudentsT::new(0.0, 1.0, degrees_of_freedom) {
            Ok(distribution) => {
                distribution.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0) * std_err
            }
            Err(_) => f64::NAN,
        };

        Self::new(mean, std_dev, std_err, confidence_interval)
    }

    /// Component-wise comparison, NaN equal to NaN
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        (0..4).all(|index| {
            let (a, b) = (self.get(index), other.get(index));
            match (a, b) {
                (Some(a), Some(b)) if a.is_nan() && b.is_nan() => true,
                (Some(a), Some(b)) => (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0),
                _ => false,
            }
        })
    }
}

/// Statistics cell stored as a column value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Accumulator {
    /// Evaluated on demand over the owning pad's children
    Dynamic { recursive: bool },
    /// Immutable snapshot
    Frozen(AccumulatedValues),
}

impl Accumulator {
    pub fn dynamic(recursive: bool) -> Self {
        Accumulator::Dynamic { recursive }
    }

    pub fn frozen(values: AccumulatedValues) -> Self {
        Accumulator::Frozen(values)
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Accumulator::Frozen(_))
    }

    pub fn is_recursive(&self) -> bool {
        matches!(self, Accumulator::Dynamic { recursive: true })
    }
}

impl Pad {
    /// Statistics of the accumulator stored in `column`, if it holds one
    pub fn accumulated_values(&self, column: &str) -> Option<AccumulatedValues> {
        match self.get_value(column)? {
            Value::Accumulator(accumulator) => Some(self.evaluate_accumulator(column, accumulator)),
            _ => None,
        }
    }

    pub(crate) fn evaluate_accumulator(
        &self,
        column: &str,
        accumulator: &Accumulator,
    ) -> AccumulatedValues {
        let recursive = match accumulator {
            Accumulator::Frozen(values) => return *values,
            Accumulator::Dynamic { recursive } => *recursive,
        };

        // a singleton is forwarded, not re-aggregated
        if let [only_child] = self.children.as_slice() {
            if let Some(Value::Accumulator(child_accumulator)) = only_child.get_value(column) {
                return only_child.evaluate_accumulator(column, child_accumulator);
            }
        }

        let mut samples = Vec::with_capacity(self.children.len());
        for child in &self.children {
            collect_contributions(child, column, recursive, &mut samples);
        }

        AccumulatedValues::from_samples(&samples, confidence_level())
    }

    /// Numeric reading of a column, resolving accumulator projections lazily
    ///
    /// Accumulators resolve to their mean; `AccumulatorStdErr` and
    /// `AccumulatorStdDevSample` look up their source column on this pad at
    /// call time.
    pub fn resolve_f64(&self, column: &str) -> Option<f64> {
        match self.get_value(column)? {
            Value::Accumulator(accumulator) => {
                Some(self.evaluate_accumulator(column, accumulator).mean)
            }
            Value::AccumulatorStdErr { source } => {
                self.accumulated_values(source).map(|values| values.std_err)
            }
            Value::AccumulatorStdDevSample { source } => {
                self.accumulated_values(source).map(|values| values.std_dev)
            }
            other => other.as_f64(),
        }
    }

    /// Replace every dynamic accumulator in this subtree with its frozen tuple
    ///
    /// Each pad is evaluated before its children are touched, so parents see
    /// the subtree exactly as it was.
    pub fn freeze_accumulators(&mut self) {
        let frozen: Vec<(String, AccumulatedValues)> = self
            .columns
            .iter()
            .filter_map(|(name, value)| match value {
                Value::Accumulator(accumulator @ Accumulator::Dynamic { .. }) => {
                    Some((name.clone(), self.evaluate_accumulator(name, accumulator)))
                }
                _ => None,
            })
            .collect();

        for (name, values) in frozen {
            self.columns
                .insert(name, Value::Accumulator(Accumulator::Frozen(values)));
        }

        for child in &mut self.children {
            child.freeze_accumulators();
        }
    }
}

fn collect_contributions(child: &Pad, column: &str, recursive: bool, samples: &mut Vec<f64>) {
    let contribution = match child.get_value(column) {
        Some(Value::Accumulator(Accumulator::Dynamic { .. })) if recursive => {
            for grandchild in &child.children {
                collect_contributions(grandchild, column, recursive, samples);
            }
            return;
        }
        Some(Value::Accumulator(accumulator)) => {
            Some(child.evaluate_accumulator(column, accumulator).mean)
        }
        Some(value) => value.as_f64(),
        None => None,
    };

    if let Some(value) = contribution.filter(|value| value.is_finite()) {
        samples.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::PadKind;
    use rstest::rstest;

    const C: &str = "C";

    fn leaf(number: i32, value: f64) -> Pad {
        let mut pad = Pad::new(PadKind::Cycle { number });
        pad.set_value(C, value).unwrap();
        pad
    }

    fn acquisition(number: i32, values: &[f64]) -> Pad {
        let mut pad = Pad::new(PadKind::Acquisition { number });
        pad.set_value(C, Accumulator::dynamic(false)).unwrap();
        for (index, value) in values.iter().enumerate() {
            pad.add_child(leaf(index as i32 + 1, *value)).unwrap();
        }
        pad
    }

    fn replicate_over(recursive: bool) -> Pad {
        let mut pad = Pad::new(PadKind::Replicate {
            date: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
        pad.set_value(C, Accumulator::dynamic(recursive)).unwrap();
        pad.add_child(acquisition(1, &[1.0, 2.0])).unwrap();
        pad.add_child(acquisition(2, &[3.0, 4.0])).unwrap();
        pad
    }

    #[test]
    fn test_singleton_forwarding() {
        let mut child = Pad::new(PadKind::Acquisition { number: 1 });
        child
            .set_value(
                C,
                Accumulator::frozen(AccumulatedValues::new(5.0, 0.0, 0.0, 0.0)),
            )
            .unwrap();
        let mut parent = Pad::new(PadKind::Sample {
            name: "S".to_string(),
        });
        parent.set_value(C, Accumulator::dynamic(false)).unwrap();
        parent.add_child(child).unwrap();

        let values = parent.accumulated_values(C).unwrap();
        assert_eq!(values, AccumulatedValues::new(5.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_recursive_accumulator_uses_all_leaves() {
        let pad = replicate_over(true);
        let expected = AccumulatedValues::from_samples(&[1.0, 2.0, 3.0, 4.0], confidence_level());
        let values = pad.accumulated_values(C).unwrap();

        assert!(values.approx_eq(&expected, 1e-12));
        assert!((values.mean - 2.5).abs() < 1e-12);
        assert!((values.std_dev - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_non_recursive_accumulator_uses_child_means() {
        let pad = replicate_over(false);
        let expected = AccumulatedValues::from_samples(&[1.5, 3.5], confidence_level());
        let values = pad.accumulated_values(C).unwrap();

        assert!(values.approx_eq(&expected, 1e-12));
        assert!((values.std_dev - 2.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_frozen_child_contributes_mean_even_when_recursive() {
        let mut pad = replicate_over(true);
        pad.children[0].freeze_accumulators();

        let values = pad.accumulated_values(C).unwrap();
        let expected = AccumulatedValues::from_samples(&[1.5, 3.0, 4.0], confidence_level());
        assert!(values.approx_eq(&expected, 1e-12));
    }

    #[rstest]
    #[case(&[], true)]
    #[case(&[7.0], false)]
    fn test_degenerate_sample_sizes(#[case] samples: &[f64], #[case] nan: bool) {
        let values = AccumulatedValues::from_samples(samples, 0.95);
        assert_eq!(values.mean.is_nan(), nan);
        if !nan {
            assert_eq!(values, AccumulatedValues::new(7.0, 0.0, 0.0, 0.0));
        }
    }

    #[test]
    fn test_confidence_interval_uses_students_t() {
        let values = AccumulatedValues::from_samples(&[1.0, 3.0], 0.95);
        // t(0.975, 1) = 12.7062..., se = 1
        assert!((values.std_err - 1.0).abs() < 1e-12);
        assert!((values.confidence_interval - 12.706_204_736).abs() < 1e-6);
    }

    #[test]
    fn test_projections_resolve_lazily() {
        let mut pad = Pad::new(PadKind::Acquisition { number: 1 });
        // the projection is attached before its source accumulator exists
        pad.set_value(
            "C SE",
            Value::AccumulatorStdErr {
                source: C.to_string(),
            },
        )
        .unwrap();
        assert_eq!(pad.resolve_f64("C SE"), None);

        pad.set_value(C, Accumulator::dynamic(false)).unwrap();
        pad.set_value(
            "C SD",
            Value::AccumulatorStdDevSample {
                source: C.to_string(),
            },
        )
        .unwrap();
        pad.add_child(leaf(1, 1.0)).unwrap();
        pad.add_child(leaf(2, 3.0)).unwrap();

        assert!((pad.resolve_f64("C SE").unwrap() - 1.0).abs() < 1e-12);
        assert!((pad.resolve_f64("C SD").unwrap() - 2.0f64.sqrt()).abs() < 1e-12);
        assert!((pad.resolve_f64(C).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_freeze_preserves_parent_statistics() {
        let mut pad = replicate_over(true);
        let before = pad.accumulated_values(C).unwrap();

        pad.freeze_accumulators();

        assert!(pad.get_value(C).unwrap().as_accumulator().unwrap().is_frozen());
        assert!(pad.children[0]
            .get_value(C)
            .unwrap()
            .as_accumulator()
            .unwrap()
            .is_frozen());
        assert!(pad.accumulated_values(C).unwrap().approx_eq(&before, 1e-12));
    }
}
