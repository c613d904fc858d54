use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Dense identifier of a value (tensor edge) inside a subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub usize);

impl ValueId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Dense identifier of an operation inside a subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl OpId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Element types understood by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    F32,
    F16,
    BF16,
    S32,
    S8,
    U8,
    Boolean,
}

impl DataType {
    /// Size of a single element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::S8 | DataType::U8 | DataType::Boolean => 1,
        }
    }
}

/// Size-bearing descriptor of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryDesc {
    pub dims: Vec<usize>,
    pub data_type: DataType,
}

impl MemoryDesc {
    pub fn new(dims: Vec<usize>, data_type: DataType) -> Self {
        Self { dims, data_type }
    }

    /// Flat byte buffer of `bytes` elements of type u8
    pub fn bytes(bytes: usize) -> Self {
        Self::new(vec![bytes], DataType::U8)
    }

    /// Number of bytes the described tensor occupies, `None` on overflow
    pub fn size_in_bytes(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(self.data_type.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
    }
}

/// Device the subgraph was compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Cpu,
    Gpu,
}

/// Engine handle memory objects are created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Engine {
    pub kind: EngineKind,
    pub index: usize,
}

impl Engine {
    pub fn cpu() -> Self {
        Self { kind: EngineKind::Cpu, index: 0 }
    }

    pub fn gpu(index: usize) -> Self {
        Self { kind: EngineKind::Gpu, index }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

/// Operation kinds of a lowered subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum OpKind {
    Convolution,
    MatMul,
    Add,
    Multiply,
    Maximum,
    Minimum,
    Eltwise,
    Pooling,
    Softmax,
    Reorder,
    LayerNorm,
    Concat,
    Sum,
    BatchNorm,
    BatchNormFolding,
    ConvolutionBackwardData,
    /// Graph-level placeholder that never lowers to a primitive
    Wildcard,
}

/// Operation attribute
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
}

/// Attribute keys the planner looks at
pub mod attr {
    pub const WITH_BIAS: &str = "with_bias";
    pub const IS_TRAINING: &str = "is_training";
    pub const IS_CONSTANT: &str = "is_constant";
    pub const WITH_SCRATCHPAD: &str = "with_scratchpad";
    pub const WITH_WORKSPACE: &str = "with_workspace";
}

/// Operation node in the subgraph
#[derive(Debug, Clone)]
pub struct Op {
    pub id: OpId,
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attributes: HashMap<String, Attribute>,
    /// (input slot, output slot) pairs computed in place
    pub inplace: Vec<(usize, usize)>,
}

impl Op {
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        match self.attributes.get(name) {
            Some(Attribute::Bool(value)) => Some(*value),
            Some(Attribute::Int(value)) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn bool_attr_or(&self, name: &str, default: bool) -> bool {
        self.bool_attr(name).unwrap_or(default)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Outputs of constant ops may be cached across invocations
    pub fn is_constant(&self) -> bool {
        self.bool_attr_or(attr::IS_CONSTANT, false)
    }
}

/// Tensor edge of the subgraph
#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub name: String,
    pub desc: MemoryDesc,
    /// Byte size computed from `desc` at build time
    pub size_bytes: usize,
    /// Producing op and output slot
    pub producer: Option<(OpId, usize)>,
    /// Consuming ops and input slots, one entry per slot
    pub consumers: Vec<(OpId, usize)>,
}

/// Lowered subgraph handed to the memory planner
///
/// Only [`SubgraphBuilder`](crate::graph::SubgraphBuilder) creates these, which
/// guarantees consistent producer/consumer edges and a topological op order.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub(crate) values: Vec<Value>,
    pub(crate) ops: Vec<Op>,
    pub(crate) order: Vec<OpId>,
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) outputs: Vec<ValueId>,
    pub(crate) engine: Engine,
}

impl Subgraph {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.index())
    }

    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.ops.get(id.index())
    }

    /// Ops in topological order
    pub fn ops_in_order(&self) -> impl Iterator<Item = &Op> + '_ {
        self.order.iter().map(move |id| &self.ops[id.index()])
    }

    pub fn op_order(&self) -> &[OpId] {
        &self.order
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Declared external inputs, position is the external buffer index
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Declared external outputs, position is the external buffer index
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }
}
