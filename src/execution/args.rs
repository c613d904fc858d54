use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::memory::assigner::BufferId;
use crate::memory::registry::Grantor;
use crate::model::{Engine, MemoryDesc, ValueId};

/// Index of a memory object inside one [`ExecutionArgsSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(usize);

impl MemId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Argument slot a memory object is bound to when a primitive executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecArg {
    Src,
    Src1,
    Weights,
    Bias,
    Dst,
    Dst1,
    Scratchpad,
    Workspace,
    DiffDst,
    DiffSrc,
    Scale,
    Shift,
    Mean,
    Variance,
    /// i-th source of a multi-input op
    MultipleSrc(usize),
    /// Extra source of the i-th fused binary post-op
    PostOpSrc(usize),
}

impl fmt::Display for ExecArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecArg::Src => write!(f, "src"),
            ExecArg::Src1 => write!(f, "src1"),
            ExecArg::Weights => write!(f, "weights"),
            ExecArg::Bias => write!(f, "bias"),
            ExecArg::Dst => write!(f, "dst"),
            ExecArg::Dst1 => write!(f, "dst1"),
            ExecArg::Scratchpad => write!(f, "scratchpad"),
            ExecArg::Workspace => write!(f, "workspace"),
            ExecArg::DiffDst => write!(f, "diff_dst"),
            ExecArg::DiffSrc => write!(f, "diff_src"),
            ExecArg::Scale => write!(f, "scale"),
            ExecArg::Shift => write!(f, "shift"),
            ExecArg::Mean => write!(f, "mean"),
            ExecArg::Variance => write!(f, "variance"),
            ExecArg::MultipleSrc(i) => write!(f, "multiple_src_{}", i),
            ExecArg::PostOpSrc(i) => write!(f, "post_op_src_{}", i),
        }
    }
}

/// Memory object bound to one argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryArg {
    pub mem: MemId,
    /// The primitive only reads this memory
    pub is_const: bool,
}

impl MemoryArg {
    pub fn new(mem: MemId, is_const: bool) -> Self {
        Self { mem, is_const }
    }
}

/// Argument bindings of one op
pub type ExecArgs = BTreeMap<ExecArg, MemoryArg>;

/// Memory object handed to a primitive
///
/// Carries the descriptor and engine fixed at plan time and a data handle
/// attached per execution context.
#[derive(Debug)]
pub struct MemoryObject {
    desc: MemoryDesc,
    engine: Engine,
    size_bytes: usize,
    data_handle: Option<NonNull<u8>>,
}

// SAFETY: the data handle is an opaque address for the executor; it is never
// dereferenced by this crate.
unsafe impl Send for MemoryObject {}
unsafe impl Sync for MemoryObject {}

impl MemoryObject {
    pub fn new(desc: MemoryDesc, engine: Engine, size_bytes: usize) -> Self {
        Self {
            desc,
            engine,
            size_bytes,
            data_handle: None,
        }
    }

    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn size(&self) -> usize {
        self.size_bytes
    }

    pub fn data_handle(&self) -> Option<NonNull<u8>> {
        self.data_handle
    }

    /// Attach a data handle, a null pointer detaches it
    pub fn set_data_handle(&mut self, ptr: *mut u8) {
        self.data_handle = NonNull::new(ptr);
    }

    /// New instance with the same descriptor and no data attached
    fn fresh_copy(&self) -> Self {
        Self::new(self.desc.clone(), self.engine, self.size_bytes)
    }
}

/// Memory objects used when executing a compiled subgraph in one thread
///
/// Only the memory planner fills this set. When a subgraph runs on several
/// threads each one works on its own replica obtained from [`clone_set`];
/// the type deliberately does not implement `Clone` so replicas are never
/// made by accident.
///
/// [`clone_set`]: ExecutionArgsSet::clone_set
#[derive(Debug, Default)]
pub struct ExecutionArgsSet {
    /// Memory objects indexed by `MemId`
    memories: Vec<MemoryObject>,
    /// memory <-> index of the buffer in the external inputs list
    mems_use_external_inputs: Vec<(MemId, usize)>,
    /// memory <-> index of the buffer in the external outputs list
    mems_use_external_outputs: Vec<(MemId, usize)>,
    /// memory <-> offset key in the internal temporary registry
    mems_use_internal_temporary: Vec<(MemId, usize)>,
    /// memory <-> offset key in the internal persistent registry
    mems_use_internal_persistent: Vec<(MemId, usize)>,
    value_mem_map: HashMap<ValueId, MemId>,
    /// Execution args for each op in topological order
    topo_ordered_exec_args: Vec<ExecArgs>,
}

impl ExecutionArgsSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural deep copy
    ///
    /// Every memory object is recreated without a data handle, while all
    /// bindings, indices and offset keys are kept. Replicas therefore address
    /// the same layout without sharing any in-flight memory object state.
    pub fn clone_set(&self) -> ExecutionArgsSet {
        ExecutionArgsSet {
            memories: self.memories.iter().map(MemoryObject::fresh_copy).collect(),
            mems_use_external_inputs: self.mems_use_external_inputs.clone(),
            mems_use_external_outputs: self.mems_use_external_outputs.clone(),
            mems_use_internal_temporary: self.mems_use_internal_temporary.clone(),
            mems_use_internal_persistent: self.mems_use_internal_persistent.clone(),
            value_mem_map: self.value_mem_map.clone(),
            topo_ordered_exec_args: self.topo_ordered_exec_args.clone(),
        }
    }

    /// `count` independent replicas, built in parallel
    pub fn replicate(&self, count: usize) -> Vec<ExecutionArgsSet> {
        (0..count).into_par_iter().map(|_| self.clone_set()).collect()
    }

    pub fn clear(&mut self) {
        self.memories.clear();
        self.mems_use_external_inputs.clear();
        self.mems_use_external_outputs.clear();
        self.mems_use_internal_temporary.clear();
        self.mems_use_internal_persistent.clear();
        self.value_mem_map.clear();
        self.topo_ordered_exec_args.clear();
    }

    // getters

    pub fn exec_args(&self) -> &[ExecArgs] {
        &self.topo_ordered_exec_args
    }

    pub fn value_mem_map(&self) -> &HashMap<ValueId, MemId> {
        &self.value_mem_map
    }

    pub fn memory(&self, id: MemId) -> Option<&MemoryObject> {
        self.memories.get(id.index())
    }

    pub fn memory_mut(&mut self, id: MemId) -> Option<&mut MemoryObject> {
        self.memories.get_mut(id.index())
    }

    pub fn memories(&self) -> &[MemoryObject] {
        &self.memories
    }

    pub fn mems_use_external_inputs(&self) -> &[(MemId, usize)] {
        &self.mems_use_external_inputs
    }

    pub fn mems_use_external_outputs(&self) -> &[(MemId, usize)] {
        &self.mems_use_external_outputs
    }

    pub fn mems_use_internal_temporary(&self) -> &[(MemId, usize)] {
        &self.mems_use_internal_temporary
    }

    pub fn mems_use_internal_persistent(&self) -> &[(MemId, usize)] {
        &self.mems_use_internal_persistent
    }

    // adders

    pub fn add_memory(&mut self, memory: MemoryObject) -> MemId {
        let id = MemId(self.memories.len());
        self.memories.push(memory);
        id
    }

    pub fn add_exec_args(&mut self, args: ExecArgs) {
        self.topo_ordered_exec_args.push(args);
    }

    pub fn add_value_mem_map(&mut self, value: ValueId, mem: MemId) {
        self.value_mem_map.insert(value, mem);
    }

    pub fn add_mem_use_external_input(&mut self, mem: MemId, index: usize) {
        self.mems_use_external_inputs.push((mem, index));
    }

    pub fn add_mem_use_external_output(&mut self, mem: MemId, index: usize) {
        self.mems_use_external_outputs.push((mem, index));
    }

    pub fn add_mem_use_internal_temporary(&mut self, mem: MemId, offset_key: usize) {
        self.mems_use_internal_temporary.push((mem, offset_key));
    }

    pub fn add_mem_use_internal_persistent(&mut self, mem: MemId, offset_key: usize) {
        self.mems_use_internal_persistent.push((mem, offset_key));
    }

    // finders

    pub fn find_value_mem(&self, value: ValueId) -> Option<MemId> {
        self.value_mem_map.get(&value).copied()
    }

    /// Attach real addresses to every memory object of this replica
    ///
    /// External memories take the pointer at their recorded position in
    /// `inputs` / `outputs`; internal ones resolve their offset key through
    /// the grantor of their arena.
    pub fn bind_addresses(
        &mut self,
        inputs: &[*mut u8],
        outputs: &[*mut u8],
        temporary: &Grantor<'_>,
        persistent: &Grantor<'_>,
    ) -> Result<()> {
        let mut updates = Vec::with_capacity(self.memories.len());

        for &(mem, index) in &self.mems_use_external_inputs {
            let ptr = inputs.get(index).copied().ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "External input #{} requested but only {} inputs given",
                    index,
                    inputs.len()
                ))
            })?;
            updates.push((mem, ptr));
        }
        for &(mem, index) in &self.mems_use_external_outputs {
            let ptr = outputs.get(index).copied().ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "External output #{} requested but only {} outputs given",
                    index,
                    outputs.len()
                ))
            })?;
            updates.push((mem, ptr));
        }
        for (list, grantor, arena) in [
            (&self.mems_use_internal_temporary, temporary, "temporary"),
            (&self.mems_use_internal_persistent, persistent, "persistent"),
        ] {
            for &(mem, key) in list {
                if key == BufferId::NONE.index() {
                    updates.push((mem, std::ptr::null_mut()));
                    continue;
                }
                let ptr = grantor.get(key).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "Offset key {} is not booked in the {} registry",
                        key, arena
                    ))
                })?;
                updates.push((mem, ptr));
            }
        }

        for (mem, ptr) in updates {
            let memory = self.memories.get_mut(mem.index()).ok_or_else(|| {
                Error::InvalidArgument(format!("Memory object {} not found", mem.index()))
            })?;
            memory.set_data_handle(ptr);
        }
        Ok(())
    }
}
