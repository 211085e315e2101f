//! Root container of a pad tree

use std::collections::BTreeSet;

use super::codec;
use super::{Pad, PadKind, PadLevel, Value};
use crate::error::Result;

/// Root of a pad tree and entry point of its binary serialization
///
/// The root carries no identity key. Its own columns hold tree-wide values,
/// its children determine the shape of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchPad {
    root: Pad,
    natural_column_order: Option<Vec<String>>,
}

impl Default for ScratchPad {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchPad {
    pub fn new() -> Self {
        Self {
            root: Pad::new(PadKind::Root),
            natural_column_order: None,
        }
    }

    pub(crate) fn from_parts(root: Pad, natural_column_order: Option<Vec<String>>) -> Self {
        Self {
            root,
            natural_column_order,
        }
    }

    /// Column order hint for display, persisted alongside the tree
    pub fn natural_column_order(&self) -> Option<&[String]> {
        self.natural_column_order.as_deref()
    }

    pub fn set_natural_column_order(&mut self, order: Vec<String>) {
        self.natural_column_order = Some(order);
    }

    pub fn root(&self) -> &Pad {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Pad {
        &mut self.root
    }

    pub fn children(&self) -> &[Pad] {
        self.root.children()
    }

    pub fn child_count(&self) -> usize {
        self.root.child_count()
    }

    pub fn child_level(&self) -> Option<PadLevel> {
        self.root.child_level()
    }

    pub fn add_child(&mut self, child: Pad) -> Result<usize> {
        self.root.add_child(child)
    }

    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.root.get_value(column)
    }

    pub fn set_value(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.root.set_value(column, value)
    }

    /// Sorted union of every column name in the tree
    pub fn column_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        self.root.walk(&mut |pad| {
            for (name, _) in pad.columns() {
                if !names.contains(name) {
                    names.insert(name.to_string());
                }
            }
        });
        names.into_iter().collect()
    }

    /// Attach `pad` as a temporary child of the root
    ///
    /// At most one grafted child exists at a time; a previous one is dropped.
    pub fn graft_temporary(&mut self, mut pad: Pad) -> Result<usize> {
        self.remove_grafted();
        pad.set_grafted(true);
        self.root.add_child(pad)
    }

    pub fn grafted(&self) -> Option<&Pad> {
        self.root.children().iter().find(|child| child.is_grafted())
    }

    pub fn grafted_mut(&mut self) -> Option<&mut Pad> {
        self.root
            .children_mut()
            .iter_mut()
            .find(|child| child.is_grafted())
    }

    /// Detach the grafted child, returning it as an ordinary pad
    pub fn take_grafted(&mut self) -> Option<Pad> {
        let index = self
            .root
            .children()
            .iter()
            .position(|child| child.is_grafted())?;
        let mut pad = self.root.remove_child(index)?;
        pad.set_grafted(false);
        Some(pad)
    }

    /// Discard the grafted child; returns whether one was present
    pub fn remove_grafted(&mut self) -> bool {
        let before = self.root.child_count();
        self.root.retain_children(|child| !child.is_grafted());
        before != self.root.child_count()
    }

    /// Trim every root child's descendants below `level`
    pub fn truncate_below(&mut self, level: PadLevel) {
        for child in self.root.children_mut() {
            child.truncate_below(level);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        codec::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::deserialize(bytes)
    }
}
