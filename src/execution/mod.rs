pub mod args;

pub use args::{ExecArg, ExecArgs, ExecutionArgsSet, MemId, MemoryArg, MemoryObject};
