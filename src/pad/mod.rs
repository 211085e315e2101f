//! Hierarchical scratch-pad data model
//!
//! A pad is one node of the measurement/result tree. The raw-data view is
//! `User → Project → Sample → Replicate → Acquisition → Cycle`; calculation
//! views are flattened (`Replicate → Acquisition → Cycle` for a correction
//! interval, `Sample → Replicate` for a sample). Which view a tree is depends
//! only on the kind of pad attached at its root.
//!
//! ## Ordering
//!
//! Children of a pad are homogeneous and always kept sorted:
//!
//! - named pads (user, project, sample) by name
//! - dated pads (replicate) by date, then by the `Analysis` column
//! - numbered pads (acquisition, cycle) by number, then by the `Analysis` column

pub mod accumulator;
pub mod codec;
pub mod scratch_pad;
pub mod value;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AppError, Result};

pub use accumulator::{AccumulatedValues, Accumulator};
pub use scratch_pad::ScratchPad;
pub use value::{Status, Value};

/// Column used to break ties between equally dated/numbered siblings
pub const ANALYSIS_COLUMN: &str = "Analysis";

/// Level of a pad in the hierarchy, also its serialized node-type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadLevel {
    Cycle,
    Acquisition,
    Replicate,
    Sample,
    Project,
    User,
}

impl PadLevel {
    pub fn tag(self) -> u8 {
        match self {
            PadLevel::Cycle => 0,
            PadLevel::Acquisition => 1,
            PadLevel::Replicate => 2,
            PadLevel::Sample => 3,
            PadLevel::Project => 4,
            PadLevel::User => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PadLevel::Cycle),
            1 => Some(PadLevel::Acquisition),
            2 => Some(PadLevel::Replicate),
            3 => Some(PadLevel::Sample),
            4 => Some(PadLevel::Project),
            5 => Some(PadLevel::User),
            _ => None,
        }
    }
}

impl fmt::Display for PadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Concrete kind of a pad together with its identity key
#[derive(Debug, Clone, PartialEq)]
pub enum PadKind {
    /// Scratch-pad root, no identity and never ordered
    Root,
    User { name: String },
    Project { name: String },
    Sample { name: String },
    Replicate { date: DateTime<Utc> },
    Acquisition { number: i32 },
    Cycle { number: i32 },
}

impl PadKind {
    pub fn level(&self) -> Option<PadLevel> {
        match self {
            PadKind::Root => None,
            PadKind::User { .. } => Some(PadLevel::User),
            PadKind::Project { .. } => Some(PadLevel::Project),
            PadKind::Sample { .. } => Some(PadLevel::Sample),
            PadKind::Replicate { .. } => Some(PadLevel::Replicate),
            PadKind::Acquisition { .. } => Some(PadLevel::Acquisition),
            PadKind::Cycle { .. } => Some(PadLevel::Cycle),
        }
    }

    /// Order of two same-level identity keys, without the analysis tiebreak
    fn compare_identity(&self, other: &PadKind) -> Ordering {
        match (self, other) {
            (PadKind::User { name: a }, PadKind::User { name: b })
            | (PadKind::Project { name: a }, PadKind::Project { name: b })
            | (PadKind::Sample { name: a }, PadKind::Sample { name: b }) => a.cmp(b),
            (PadKind::Replicate { date: a }, PadKind::Replicate { date: b }) => a.cmp(b),
            (PadKind::Acquisition { number: a }, PadKind::Acquisition { number: b })
            | (PadKind::Cycle { number: a }, PadKind::Cycle { number: b }) => a.cmp(b),
            _ => self.level().cmp(&other.level()),
        }
    }

    fn uses_analysis_tiebreak(&self) -> bool {
        matches!(
            self,
            PadKind::Replicate { .. } | PadKind::Acquisition { .. } | PadKind::Cycle { .. }
        )
    }
}

impl fmt::Display for PadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PadKind::Root => write!(f, "ScratchPad"),
            PadKind::User { name } => write!(f, "User {}", name),
            PadKind::Project { name } => write!(f, "Project {}", name),
            PadKind::Sample { name } => write!(f, "Sample {}", name),
            PadKind::Replicate { date } => write!(f, "Replicate {}", date.to_rfc3339()),
            PadKind::Acquisition { number } => write!(f, "Acquisition {}", number),
            PadKind::Cycle { number } => write!(f, "Cycle {}", number),
        }
    }
}

/// One node of the measurement/result tree
#[derive(Debug, Clone, PartialEq)]
pub struct Pad {
    kind: PadKind,
    columns: BTreeMap<String, Value>,
    children: Vec<Pad>,
    /// Temporarily attached to a shared tree, never serialized
    grafted: bool,
}

impl Pad {
    /// Replicate dates are truncated to the millisecond precision the
    /// codec stores
    pub fn new(kind: PadKind) -> Self {
        let kind = match kind {
            PadKind::Replicate { date } => PadKind::Replicate {
                date: date.trunc_subsecs(3),
            },
            other => other,
        };
        Self {
            kind,
            columns: BTreeMap::new(),
            children: Vec::new(),
            grafted: false,
        }
    }

    pub fn kind(&self) -> &PadKind {
        &self.kind
    }

    pub fn level(&self) -> Option<PadLevel> {
        self.kind.level()
    }

    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Set a column; each column may be set once per pad
    pub fn set_value(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let column = column.into();
        if self.columns.contains_key(&column) {
            return Err(AppError::ColumnAlreadySet {
                column,
                node: self.kind.to_string(),
            });
        }
        self.columns.insert(column, value.into());
        Ok(())
    }

    pub fn has_value(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn children(&self) -> &[Pad] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Pad] {
        &mut self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Level shared by all children, if any
    pub fn child_level(&self) -> Option<PadLevel> {
        self.children.first().and_then(Pad::level)
    }

    /// Insert a child at its sorted position
    ///
    /// Equal keys keep insertion order. Returns the index the child landed at.
    pub fn add_child(&mut self, child: Pad) -> Result<usize> {
        let Some(level) = child.level() else {
            return Err(AppError::MixedChildLevel {
                child: "root".to_string(),
                existing: self.kind.to_string(),
            });
        };
        if let Some(existing) = self.child_level() {
            if existing != level {
                return Err(AppError::MixedChildLevel {
                    child: level.to_string(),
                    existing: existing.to_string(),
                });
            }
        }

        let index = self
            .children
            .partition_point(|sibling| compare_siblings(sibling, &child) != Ordering::Greater);
        self.children.insert(index, child);
        Ok(index)
    }

    pub fn remove_child(&mut self, index: usize) -> Option<Pad> {
        (index < self.children.len()).then(|| self.children.remove(index))
    }

    pub fn retain_children(&mut self, keep: impl FnMut(&Pad) -> bool) {
        self.children.retain(keep);
    }

    /// Drop every child, keeping identity and columns
    pub fn clear_children(&mut self) {
        self.children.clear();
    }

    /// Index of the first child whose integer `column` equals `value`
    pub fn find_child_by_integer(&self, column: &str, value: i64) -> Option<usize> {
        self.children
            .iter()
            .position(|child| child.get_value(column).and_then(Value::as_i64) == Some(value))
    }

    /// Pre-order visit of this pad and every descendant
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Pad)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Number of pads in this subtree, this pad included
    pub fn subtree_size(&self) -> usize {
        1 + self.children.iter().map(Pad::subtree_size).sum::<usize>()
    }

    /// Drop every descendant whose level is below `level`
    ///
    /// Dynamic accumulators are frozen first so the kept pads report the
    /// statistics they had over the full tree.
    pub fn truncate_below(&mut self, level: PadLevel) {
        let needs_cut = {
            let mut found = false;
            self.walk(&mut |pad| {
                if pad.level().is_some_and(|l| l < level) {
                    found = true;
                }
            });
            found
        };
        if !needs_cut {
            return;
        }

        self.freeze_accumulators();
        self.cut_below(level);
    }

    fn cut_below(&mut self, level: PadLevel) {
        self.children
            .retain(|child| child.level().is_some_and(|l| l >= level));
        for child in &mut self.children {
            child.cut_below(level);
        }
    }

    pub(crate) fn is_grafted(&self) -> bool {
        self.grafted
    }

    pub(crate) fn set_grafted(&mut self, grafted: bool) {
        self.grafted = grafted;
    }
}

fn analysis_of(pad: &Pad) -> Option<&str> {
    pad.get_value(ANALYSIS_COLUMN).and_then(Value::as_str)
}

/// Sibling comparator: identity key, then `Analysis` for dated/numbered pads
pub fn compare_siblings(a: &Pad, b: &Pad) -> Ordering {
    a.kind.compare_identity(&b.kind).then_with(|| {
        if a.kind.uses_analysis_tiebreak() {
            analysis_of(a).cmp(&analysis_of(b))
        } else {
            Ordering::Equal
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cycle(number: i32, analysis: Option<&str>) -> Pad {
        let mut pad = Pad::new(PadKind::Cycle { number });
        if let Some(analysis) = analysis {
            pad.set_value(ANALYSIS_COLUMN, analysis).unwrap();
        }
        pad
    }

    #[test]
    fn test_set_value_only_once() {
        let mut pad = cycle(1, None);
        pad.set_value("Ratio", 1.25).unwrap();

        let err = pad.set_value("Ratio", 2.5).unwrap_err();
        assert!(matches!(err, AppError::ColumnAlreadySet { .. }));
        assert_eq!(pad.get_value("Ratio"), Some(&Value::Double(1.25)));
    }

    #[test]
    fn test_children_must_be_homogeneous() {
        let mut acquisition = Pad::new(PadKind::Acquisition { number: 1 });
        acquisition.add_child(cycle(1, None)).unwrap();

        let err = acquisition
            .add_child(Pad::new(PadKind::Acquisition { number: 2 }))
            .unwrap_err();
        assert!(matches!(err, AppError::MixedChildLevel { .. }));

        let err = acquisition.add_child(Pad::new(PadKind::Root)).unwrap_err();
        assert!(matches!(err, AppError::MixedChildLevel { .. }));
    }

    #[test]
    fn test_analysis_breaks_ties() {
        let mut acquisition = Pad::new(PadKind::Acquisition { number: 1 });
        acquisition.add_child(cycle(2, Some("b"))).unwrap();
        acquisition.add_child(cycle(2, Some("a"))).unwrap();
        acquisition.add_child(cycle(1, Some("z"))).unwrap();
        acquisition.add_child(cycle(2, None)).unwrap();

        let keys: Vec<(i32, Option<&str>)> = acquisition
            .children()
            .iter()
            .map(|child| match child.kind() {
                PadKind::Cycle { number } => (*number, analysis_of(child)),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            keys,
            vec![(1, Some("z")), (2, None), (2, Some("a")), (2, Some("b"))]
        );
    }

    #[test]
    fn test_named_pads_sort_by_name() {
        let mut project = Pad::new(PadKind::Project {
            name: "P".to_string(),
        });
        for name in ["delta", "alpha", "charlie"] {
            project
                .add_child(Pad::new(PadKind::Sample {
                    name: name.to_string(),
                }))
                .unwrap();
        }
        let names: Vec<String> = project.children().iter().map(|c| c.kind().to_string()).collect();
        assert_eq!(names, vec!["Sample alpha", "Sample charlie", "Sample delta"]);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut acquisition = Pad::new(PadKind::Acquisition { number: 1 });
        acquisition
            .set_value("Ratio", Accumulator::dynamic(true))
            .unwrap();
        let mut first = cycle(1, None);
        first.set_value("Ratio", 1.0).unwrap();
        acquisition.add_child(first).unwrap();

        let mut copy = acquisition.clone();
        let mut second = cycle(2, None);
        second.set_value("Ratio", 3.0).unwrap();
        copy.add_child(second).unwrap();

        assert_eq!(acquisition.child_count(), 1);
        assert!((acquisition.resolve_f64("Ratio").unwrap() - 1.0).abs() < 1e-12);
        assert!((copy.resolve_f64("Ratio").unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_truncate_below_freezes_and_cuts() {
        let mut replicate = Pad::new(PadKind::Replicate {
            date: DateTime::from_timestamp(1_000, 0).unwrap(),
        });
        replicate
            .set_value("Ratio", Accumulator::dynamic(true))
            .unwrap();
        let mut acquisition = Pad::new(PadKind::Acquisition { number: 1 });
        acquisition
            .set_value("Ratio", Accumulator::dynamic(false))
            .unwrap();
        for (number, value) in [(1, 2.0), (2, 4.0)] {
            let mut c = cycle(number, None);
            c.set_value("Ratio", value).unwrap();
            acquisition.add_child(c).unwrap();
        }
        replicate.add_child(acquisition).unwrap();

        replicate.truncate_below(PadLevel::Acquisition);

        assert_eq!(replicate.child_count(), 1);
        assert_eq!(replicate.children()[0].child_count(), 0);
        assert!((replicate.resolve_f64("Ratio").unwrap() - 3.0).abs() < 1e-12);
        assert!(replicate.children()[0]
            .get_value("Ratio")
            .and_then(Value::as_accumulator)
            .is_some_and(Accumulator::is_frozen));
    }

    #[test]
    fn test_replicate_dates_keep_milliseconds() {
        let date = DateTime::from_timestamp(1_700_000_000, 987_654_321).unwrap();
        let mut pad = Pad::new(PadKind::Replicate { date });
        pad.set_value("Measured", date).unwrap();

        let millis = DateTime::from_timestamp(1_700_000_000, 987_000_000).unwrap();
        assert_eq!(pad.kind(), &PadKind::Replicate { date: millis });
        assert_eq!(pad.get_value("Measured"), Some(&Value::Date(millis)));
    }

    fn dated(seconds: i64, analysis: Option<&str>) -> Pad {
        let mut pad = Pad::new(PadKind::Replicate {
            date: DateTime::from_timestamp(seconds, 0).unwrap(),
        });
        if let Some(analysis) = analysis {
            pad.set_value(ANALYSIS_COLUMN, analysis).unwrap();
        }
        pad
    }

    proptest! {
        #[test]
        fn prop_children_stay_sorted(
            keys in prop::collection::vec((0i32..20, prop::option::of("[a-c]")), 0..40)
        ) {
            let mut acquisition = Pad::new(PadKind::Acquisition { number: 1 });
            for (number, analysis) in &keys {
                acquisition.add_child(cycle(*number, analysis.as_deref())).unwrap();
            }

            prop_assert_eq!(acquisition.child_count(), keys.len());
            for pair in acquisition.children().windows(2) {
                prop_assert_ne!(compare_siblings(&pair[0], &pair[1]), Ordering::Greater);
            }
        }

        #[test]
        fn prop_replicates_sort_by_date_then_analysis(
            keys in prop::collection::vec((0i64..10, prop::option::of("[a-c]")), 0..40)
        ) {
            let mut sample = Pad::new(PadKind::Sample { name: "S".to_string() });
            for (seconds, analysis) in &keys {
                sample.add_child(dated(*seconds, analysis.as_deref())).unwrap();
            }

            let mut expected: Vec<(i64, Option<String>)> = keys.clone();
            expected.sort();
            let actual: Vec<(i64, Option<String>)> = sample
                .children()
                .iter()
                .map(|child| match child.kind() {
                    PadKind::Replicate { date } => {
                        (date.timestamp(), analysis_of(child).map(str::to_string))
                    }
                    _ => unreachable!(),
                })
                .collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn prop_named_children_sort_by_name(
            names in prop::collection::vec("[a-e]{1,3}", 0..30)
        ) {
            let mut project = Pad::new(PadKind::Project { name: "P".to_string() });
            for name in &names {
                project.add_child(Pad::new(PadKind::Sample { name: name.clone() })).unwrap();
            }

            let mut expected = names.clone();
            expected.sort();
            let actual: Vec<String> = project
                .children()
                .iter()
                .map(|child| match child.kind() {
                    PadKind::Sample { name } => name.clone(),
                    _ => unreachable!(),
                })
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
