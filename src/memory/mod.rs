pub mod assigner;
pub mod options;
pub mod planner;
pub mod prepare;
pub mod registry;
pub mod summary;

pub use assigner::{BufferAssigner, BufferId, BufferInfo};
pub use options::{PlannerOptions, DEFAULT_MATCH_RANGE, MEM_REUSE_ENV};
pub use planner::{AssignInfo, BufferKind, MemoryPlanner};
pub use prepare::{arg_layout, bind_slots, ArgLayout, SlotBinding};
pub use registry::{Grantor, Registry, RegistryEntry, DEFAULT_ALIGNMENT};
pub use summary::{PlanSummary, ValuePlacement};
