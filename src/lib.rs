pub mod error;
pub mod model;
pub mod graph;
pub mod memory;
pub mod execution;

// Re-export commonly used types
pub use error::{Error, Result};
pub use model::{Attribute, DataType, Engine, EngineKind, MemoryDesc, Op, OpId, OpKind, Subgraph, Value, ValueId};
pub use graph::{AliasMap, SubgraphBuilder};
pub use memory::{BufferAssigner, BufferId, BufferKind, Grantor, MemoryPlanner, PlanSummary, PlannerOptions, Registry};
pub use execution::{ExecArg, ExecArgs, ExecutionArgsSet, MemId, MemoryArg, MemoryObject};
