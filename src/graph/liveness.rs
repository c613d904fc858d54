//! Liveness and in-place alias analysis over a subgraph.
//!
//! Two facts drive temporary buffer reuse: how many consumer slots still
//! read each value, and which values are declared to overwrite another
//! value in place and must therefore land in the same buffer.

use std::collections::HashMap;

use log::trace;

use crate::error::{Error, Result};
use crate::model::{Subgraph, ValueId};

/// Number of consumer slots per value, indexed by `ValueId`
///
/// A value read twice by the same op counts twice.
pub fn consumer_counts(subgraph: &Subgraph) -> Vec<usize> {
    subgraph
        .values()
        .iter()
        .map(|value| value.consumers.len())
        .collect()
}

/// Bidirectional map between in-place outputs and the inputs they overwrite
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    /// output -> overwritten input
    alias_map: HashMap<ValueId, ValueId>,
    /// overwritten input -> output
    reverse_alias_map: HashMap<ValueId, ValueId>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the in-place pairs declared on every op of the subgraph
    pub fn resolve(subgraph: &Subgraph) -> Result<Self> {
        let mut map = Self::new();

        for op in subgraph.ops_in_order() {
            for &(input_slot, output_slot) in &op.inplace {
                let (input, output) = match (op.inputs.get(input_slot), op.outputs.get(output_slot)) {
                    (Some(&input), Some(&output)) => (input, output),
                    _ => {
                        return Err(Error::InvalidGraph(format!(
                            "In-place pair ({}, {}) out of range for op '{}'",
                            input_slot, output_slot, op.name
                        )))
                    }
                };

                // Both ids were validated by the builder
                let input_size = subgraph.value(input).map(|v| v.size_bytes).unwrap_or(0);
                let output_size = subgraph.value(output).map(|v| v.size_bytes).unwrap_or(0);
                if input_size != output_size {
                    return Err(Error::InvalidGraph(format!(
                        "Op '{}' computes {} in place of {} but sizes differ ({} vs {} bytes)",
                        op.name, output, input, output_size, input_size
                    )));
                }

                if input == output || map.alias_map.contains_key(&output) {
                    return Err(Error::InvalidGraph(format!(
                        "Value {} of op '{}' is declared in place more than once",
                        output, op.name
                    )));
                }
                if map.reverse_alias_map.contains_key(&input) {
                    return Err(Error::InvalidGraph(format!(
                        "Value {} is overwritten in place by more than one output",
                        input
                    )));
                }

                trace!("{} aliases {} through op '{}'", output, input, op.name);
                map.alias_map.insert(output, input);
                map.reverse_alias_map.insert(input, output);
            }
        }

        Ok(map)
    }

    /// The input overwritten by `output`, if any
    pub fn alias_of(&self, output: ValueId) -> Option<ValueId> {
        self.alias_map.get(&output).copied()
    }

    /// The output overwriting `input`, if any
    pub fn aliased_by(&self, input: ValueId) -> Option<ValueId> {
        self.reverse_alias_map.get(&input).copied()
    }

    /// All values sharing storage with `value`, root first, `value` included
    ///
    /// In-place chains (`c` overwrites `b` which overwrites `a`) form a single
    /// group, so every member resolves to the same assignment.
    pub fn group(&self, value: ValueId) -> Vec<ValueId> {
        let mut root = value;
        while let Some(parent) = self.alias_of(root) {
            root = parent;
        }

        let mut members = vec![root];
        let mut current = root;
        while let Some(child) = self.aliased_by(current) {
            members.push(child);
            current = child;
        }
        members
    }

    pub fn len(&self) -> usize {
        self.alias_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alias_map.is_empty()
    }

    pub fn clear(&mut self) {
        self.alias_map.clear();
        self.reverse_alias_map.clear();
    }
}
