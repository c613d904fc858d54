//! Static memory planning for a compiled subgraph.
//!
//! Every value the subgraph touches is placed in one of four kinds of buffer:
//!
//! - external inputs and outputs, provided by the caller at execution time
//!   and identified by their position in the subgraph's declared lists;
//! - internal persistent buffers, holding outputs of constant ops that may be
//!   cached between executions;
//! - internal temporary buffers, living only for the duration of a single
//!   execution and shared between values whose lifetimes do not overlap.
//!
//! Values computed in place share the assignment of the value they overwrite.
//! Internal buffers are booked into two registries whose total sizes tell the
//! caller how much memory to allocate; each execution context then binds real
//! addresses into its own replica of the [`ExecutionArgsSet`].

use std::collections::HashMap;

use log::{debug, trace, warn};
use serde::Serialize;
use strum_macros::Display;

use crate::error::{Error, Result};
use crate::execution::args::{ExecArgs, ExecutionArgsSet, MemId, MemoryArg, MemoryObject};
use crate::graph::liveness::{consumer_counts, AliasMap};
use crate::memory::assigner::{BufferAssigner, BufferId};
use crate::memory::options::PlannerOptions;
use crate::memory::prepare::bind_slots;
use crate::memory::registry::{Grantor, Registry};
use crate::memory::summary::{PlanSummary, ValuePlacement};
use crate::model::{Subgraph, ValueId};

/// Kind of buffer a value is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    ExternalInput,
    ExternalOutput,
    InternalPersistent,
    InternalTemporary,
}

/// Buffer assignment of one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignInfo {
    pub kind: BufferKind,
    /// Position in the external list for external kinds, buffer id otherwise
    pub index: usize,
}

impl AssignInfo {
    pub fn new(kind: BufferKind, index: usize) -> Self {
        Self { kind, index }
    }

    /// Human readable tag, e.g. `temporary_2`
    ///
    /// Zero-sized internal values render as `temporary_none`.
    pub fn tag(&self) -> String {
        match self.kind {
            BufferKind::ExternalInput => format!("external_in_{}", self.index),
            BufferKind::ExternalOutput => format!("external_out_{}", self.index),
            BufferKind::InternalPersistent => format!("persistent_{}", BufferId::new(self.index)),
            BufferKind::InternalTemporary => format!("temporary_{}", BufferId::new(self.index)),
        }
    }
}

/// Memory planner for one compiled subgraph
///
/// Run once per subgraph with [`run`](MemoryPlanner::run). The resulting
/// [`ExecutionArgsSet`] is a template: execution contexts take replicas of it
/// and bind addresses obtained from the grantors.
#[derive(Debug)]
pub struct MemoryPlanner {
    options: PlannerOptions,
    persistent_assigner: BufferAssigner,
    temporary_assigner: BufferAssigner,
    persistent_registry: Registry,
    temporary_registry: Registry,
    /// Assignment per value, indexed by `ValueId`
    buffer_assignments: Vec<Option<AssignInfo>>,
    aliases: AliasMap,
    /// Outstanding reads per temporary buffer
    temporary_buffer_ref_count: HashMap<BufferId, usize>,
    exec_args_set: ExecutionArgsSet,
    planned: bool,
}

impl MemoryPlanner {
    /// Create a planner, validating `options`
    pub fn new(options: PlannerOptions) -> Result<Self> {
        options.validate()?;
        if !options.enable_memory_sharing {
            warn!("Memory sharing is disabled, every internal value gets its own buffer");
        }

        let match_range = options.effective_match_range();
        Ok(Self {
            persistent_assigner: BufferAssigner::new(match_range),
            temporary_assigner: BufferAssigner::new(match_range),
            persistent_registry: Registry::with_alignment(options.alignment)?,
            temporary_registry: Registry::with_alignment(options.alignment)?,
            buffer_assignments: Vec::new(),
            aliases: AliasMap::new(),
            temporary_buffer_ref_count: HashMap::new(),
            exec_args_set: ExecutionArgsSet::new(),
            planned: false,
            options,
        })
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    /// Whether a successful `run` has not been cleared yet
    pub fn is_planned(&self) -> bool {
        self.planned
    }

    /// Plan memory for `subgraph`
    ///
    /// On failure every partial result is discarded, leaving the planner as
    /// if freshly cleared.
    pub fn run(&mut self, subgraph: &Subgraph) -> Result<()> {
        if self.planned {
            return Err(Error::InvalidState(
                "Memory planner already holds a plan, call clear() first".to_string(),
            ));
        }

        match self.plan(subgraph) {
            Ok(()) => {
                self.planned = true;
                Ok(())
            }
            Err(e) => {
                debug!("Memory planning failed: {}", e);
                self.clear();
                Err(e)
            }
        }
    }

    fn plan(&mut self, subgraph: &Subgraph) -> Result<()> {
        debug!(
            "Planning memory for {} ops and {} values",
            subgraph.num_ops(),
            subgraph.values().len()
        );
        self.buffer_assignments = vec![None; subgraph.values().len()];

        self.aliases = AliasMap::resolve(subgraph)?;
        debug!("Resolved {} in-place pairs", self.aliases.len());

        let counts = consumer_counts(subgraph);

        self.assign_external_inputs(subgraph)?;
        self.assign_external_outputs(subgraph);
        self.assign_internal_persistent(subgraph);
        self.assign_internal_temporary(subgraph, &counts)?;
        self.book_buffers()?;
        self.prepare_execution_args_set(subgraph)?;

        debug!(
            "Planned {} temporary bytes in {} buffers, {} persistent bytes in {} buffers",
            self.temporary_registry.size(),
            self.temporary_assigner.allocated(),
            self.persistent_registry.size(),
            self.persistent_assigner.allocated()
        );
        Ok(())
    }

    /// Assign `value` and every in-place partner that is still unassigned
    fn assign(&mut self, value: ValueId, info: AssignInfo) {
        for member in self.aliases.group(value) {
            if let Some(slot) = self.buffer_assignments.get_mut(member.index()) {
                if slot.is_none() {
                    trace!("{} -> {}", member, info.tag());
                    *slot = Some(info);
                }
            }
        }
    }

    fn is_assigned(&self, value: ValueId) -> bool {
        self.assignment(value).is_some()
    }

    fn assign_external_inputs(&mut self, subgraph: &Subgraph) -> Result<()> {
        let positions: HashMap<ValueId, usize> = subgraph
            .inputs()
            .iter()
            .enumerate()
            .map(|(pos, &value)| (value, pos))
            .collect();

        let mut assigned = 0;
        for op in subgraph.ops_in_order() {
            for &input in &op.inputs {
                let value = subgraph.value(input).ok_or_else(|| {
                    Error::InvalidGraph(format!("Op '{}' reads unknown value {}", op.name, input))
                })?;
                if value.producer.is_some() || self.is_assigned(input) {
                    continue;
                }
                let position = positions.get(&input).copied().ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "Value '{}' ({}) read by op '{}' has no producer and is not a declared input",
                        value.name, input, op.name
                    ))
                })?;
                self.assign(input, AssignInfo::new(BufferKind::ExternalInput, position));
                assigned += 1;
            }
        }
        debug!("Assigned {} external input values", assigned);
        Ok(())
    }

    fn assign_external_outputs(&mut self, subgraph: &Subgraph) {
        let positions: HashMap<ValueId, usize> = subgraph
            .outputs()
            .iter()
            .enumerate()
            .map(|(pos, &value)| (value, pos))
            .collect();

        let mut assigned = 0;
        for op in subgraph.ops_in_order() {
            for &output in &op.outputs {
                if let Some(&position) = positions.get(&output) {
                    self.assign(output, AssignInfo::new(BufferKind::ExternalOutput, position));
                    assigned += 1;
                }
            }
        }
        debug!("Assigned {} external output values", assigned);
    }

    fn assign_internal_persistent(&mut self, subgraph: &Subgraph) {
        let mut assigned = 0;
        for op in subgraph.ops_in_order() {
            if !op.is_constant() {
                continue;
            }
            for &output in &op.outputs {
                if self.is_assigned(output) {
                    continue;
                }
                let size = subgraph.value(output).map_or(0, |v| v.size_bytes);
                let id = self.persistent_assigner.request(size);
                self.assign(output, AssignInfo::new(BufferKind::InternalPersistent, id.index()));
                assigned += 1;
            }
        }
        debug!(
            "Assigned {} persistent values to {} buffers",
            assigned,
            self.persistent_assigner.allocated()
        );
    }

    /// Liveness-driven assignment of everything still unplaced
    ///
    /// A buffer's reference count is the number of consumer slots over every
    /// value placed in it, alias partners included. A buffer goes back to the
    /// free set once its last reader has run, or right after its producer if
    /// nothing reads it.
    fn assign_internal_temporary(&mut self, subgraph: &Subgraph, counts: &[usize]) -> Result<()> {
        for op in subgraph.ops_in_order() {
            let mut fresh = Vec::new();

            for &output in &op.outputs {
                if self.is_assigned(output) {
                    continue;
                }
                let size = subgraph.value(output).map_or(0, |v| v.size_bytes);
                let id = self.temporary_assigner.request(size);
                self.assign(output, AssignInfo::new(BufferKind::InternalTemporary, id.index()));
                if id.is_none() {
                    continue;
                }

                let reads: usize = self
                    .aliases
                    .group(output)
                    .iter()
                    .map(|member| counts.get(member.index()).copied().unwrap_or(0))
                    .sum();
                *self.temporary_buffer_ref_count.entry(id).or_insert(0) += reads;
                fresh.push(id);
            }

            for &input in &op.inputs {
                let info = match self.assignment(input) {
                    Some(info) if info.kind == BufferKind::InternalTemporary => info,
                    _ => continue,
                };
                let id = BufferId::new(info.index);
                if id.is_none() {
                    continue;
                }
                let count = self.temporary_buffer_ref_count.get_mut(&id).ok_or_else(|| {
                    Error::InvalidState(format!("Temporary buffer {} has no reference count", id))
                })?;
                *count = count.checked_sub(1).ok_or_else(|| {
                    Error::InvalidState(format!(
                        "Temporary buffer {} read more often than counted",
                        id
                    ))
                })?;
                if *count == 0 {
                    self.temporary_assigner.release(id)?;
                }
            }

            for id in fresh {
                if self.temporary_buffer_ref_count.get(&id).copied() == Some(0) {
                    self.temporary_assigner.release(id)?;
                }
            }
        }

        debug!(
            "Temporary assigner created {} buffers ({} bytes)",
            self.temporary_assigner.allocated(),
            self.temporary_assigner.total_bytes()
        );
        Ok(())
    }

    fn book_buffers(&mut self) -> Result<()> {
        for info in self.temporary_assigner.buffers() {
            self.temporary_registry.book(info.id.index(), info.max_bytes)?;
        }
        for info in self.persistent_assigner.buffers() {
            self.persistent_registry.book(info.id.index(), info.max_bytes)?;
        }
        debug!(
            "Booked registries: temporary {} bytes, persistent {} bytes",
            self.temporary_registry.size(),
            self.persistent_registry.size()
        );
        Ok(())
    }

    fn prepare_execution_args_set(&mut self, subgraph: &Subgraph) -> Result<()> {
        for op in subgraph.ops_in_order() {
            let mut args = ExecArgs::new();
            for binding in bind_slots(op)? {
                let mem = self.bind_value(subgraph, binding.value)?;
                args.insert(binding.arg, MemoryArg::new(mem, binding.is_const));
            }
            self.exec_args_set.add_exec_args(args);
        }
        debug!(
            "Prepared arguments for {} ops using {} memory objects",
            self.exec_args_set.exec_args().len(),
            self.exec_args_set.memories().len()
        );
        Ok(())
    }

    /// Memory object of `value`, created and classified on first use
    fn bind_value(&mut self, subgraph: &Subgraph, value: ValueId) -> Result<MemId> {
        if let Some(mem) = self.exec_args_set.find_value_mem(value) {
            return Ok(mem);
        }

        let info = self.assignment(value).ok_or_else(|| {
            Error::InvalidState(format!("No buffer assigned to value {}", value))
        })?;
        let node = subgraph
            .value(value)
            .ok_or_else(|| Error::InvalidGraph(format!("Unknown value {}", value)))?;

        let set = &mut self.exec_args_set;
        let mem = set.add_memory(MemoryObject::new(
            node.desc.clone(),
            subgraph.engine(),
            node.size_bytes,
        ));
        set.add_value_mem_map(value, mem);
        match info.kind {
            BufferKind::ExternalInput => set.add_mem_use_external_input(mem, info.index),
            BufferKind::ExternalOutput => set.add_mem_use_external_output(mem, info.index),
            BufferKind::InternalPersistent => set.add_mem_use_internal_persistent(mem, info.index),
            BufferKind::InternalTemporary => set.add_mem_use_internal_temporary(mem, info.index),
        }
        Ok(mem)
    }

    // accessors

    /// Master argument set, replicate it per execution context
    pub fn exec_args_set(&self) -> &ExecutionArgsSet {
        &self.exec_args_set
    }

    /// Bytes the caller must allocate for temporary buffers per execution
    pub fn total_internal_temporary_size(&self) -> usize {
        self.temporary_registry.size()
    }

    /// Bytes the caller must allocate for cached persistent buffers
    pub fn total_internal_persistent_size(&self) -> usize {
        self.persistent_registry.size()
    }

    pub fn temporary_registry(&self) -> &Registry {
        &self.temporary_registry
    }

    pub fn persistent_registry(&self) -> &Registry {
        &self.persistent_registry
    }

    pub fn internal_temporary_grantor(&self, base_ptr: *mut u8) -> Grantor<'_> {
        self.temporary_registry.grantor(base_ptr)
    }

    pub fn internal_persistent_grantor(&self, base_ptr: *mut u8) -> Grantor<'_> {
        self.persistent_registry.grantor(base_ptr)
    }

    pub fn assignment(&self, value: ValueId) -> Option<AssignInfo> {
        self.buffer_assignments.get(value.index()).copied().flatten()
    }

    /// Placement tag of `value`, empty if it was never assigned
    pub fn memory_info(&self, value: ValueId) -> String {
        self.assignment(value).map(|info| info.tag()).unwrap_or_default()
    }

    /// Report on the current plan
    pub fn summary(&self, subgraph: &Subgraph) -> PlanSummary {
        let mut values = Vec::new();
        let mut naive_temporary_bytes = 0;

        for value in subgraph.values() {
            let info = match self.assignment(value.id) {
                Some(info) => info,
                None => continue,
            };
            if info.kind == BufferKind::InternalTemporary && self.aliases.alias_of(value.id).is_none() {
                naive_temporary_bytes += value.size_bytes;
            }
            values.push(ValuePlacement {
                value: value.id,
                name: value.name.clone(),
                size_bytes: value.size_bytes,
                kind: info.kind,
                index: info.index,
                tag: info.tag(),
            });
        }

        PlanSummary {
            num_ops: subgraph.num_ops(),
            num_values: subgraph.values().len(),
            memory_sharing: self.options.enable_memory_sharing,
            temporary_size: self.total_internal_temporary_size(),
            persistent_size: self.total_internal_persistent_size(),
            temporary_buffers: self.temporary_assigner.allocated(),
            persistent_buffers: self.persistent_assigner.allocated(),
            external_inputs: self.exec_args_set.mems_use_external_inputs().len(),
            external_outputs: self.exec_args_set.mems_use_external_outputs().len(),
            naive_temporary_bytes,
            planned_temporary_bytes: self.temporary_assigner.total_bytes(),
            values,
        }
    }

    /// Forget the current plan, keeping the options
    pub fn clear(&mut self) {
        self.persistent_assigner.clear();
        self.temporary_assigner.clear();
        self.persistent_registry.clear();
        self.temporary_registry.clear();
        self.buffer_assignments.clear();
        self.aliases.clear();
        self.temporary_buffer_ref_count.clear();
        self.exec_args_set.clear();
        self.planned = false;
    }
}
