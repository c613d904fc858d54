pub mod builder;
pub mod liveness;

pub use builder::SubgraphBuilder;
pub use liveness::{consumer_counts, AliasMap};
