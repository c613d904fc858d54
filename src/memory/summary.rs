use serde::Serialize;

use crate::error::Result;
use crate::memory::planner::BufferKind;
use crate::model::ValueId;

/// Placement of a single value in a finished plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValuePlacement {
    pub value: ValueId,
    pub name: String,
    pub size_bytes: usize,
    pub kind: BufferKind,
    /// External position or buffer id, depending on `kind`
    pub index: usize,
    /// Same string as `MemoryPlanner::memory_info`
    pub tag: String,
}

/// Report of a finished memory plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub num_ops: usize,
    pub num_values: usize,
    pub memory_sharing: bool,
    /// Bytes the caller must allocate for the temporary arena
    pub temporary_size: usize,
    /// Bytes the caller must allocate for the persistent arena
    pub persistent_size: usize,
    pub temporary_buffers: usize,
    pub persistent_buffers: usize,
    pub external_inputs: usize,
    pub external_outputs: usize,
    /// Sum of temporary value sizes if nothing were shared
    pub naive_temporary_bytes: usize,
    /// Sum of temporary buffer sizes after sharing, before alignment
    pub planned_temporary_bytes: usize,
    pub values: Vec<ValuePlacement>,
}

impl PlanSummary {
    /// Fraction of naive temporary bytes saved by sharing
    pub fn savings_ratio(&self) -> f64 {
        if self.naive_temporary_bytes == 0 {
            return 0.0;
        }
        1.0 - self.planned_temporary_bytes as f64 / self.naive_temporary_bytes as f64
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
