use std::collections::{HashMap, HashSet};

use log::debug;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};
use crate::model::{Attribute, Engine, MemoryDesc, Op, OpId, OpKind, Subgraph, Value, ValueId};

struct ValueDraft {
    name: String,
    desc: MemoryDesc,
}

/// Builder responsible for constructing a validated [`Subgraph`]
///
/// Values and ops are numbered densely in insertion order. `build` wires up
/// producer/consumer edges, rejects malformed structure and settles on a
/// topological op order (insertion order when it already is one).
#[derive(Default)]
pub struct SubgraphBuilder {
    values: Vec<ValueDraft>,
    ops: Vec<Op>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    engine: Engine,
}

impl SubgraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine memory objects will be created on
    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Add a value with the given descriptor
    pub fn add_value(&mut self, name: &str, desc: MemoryDesc) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(ValueDraft {
            name: name.to_string(),
            desc,
        });
        id
    }

    /// Add an op consuming `inputs` and producing `outputs`
    pub fn add_op(
        &mut self,
        kind: OpKind,
        name: &str,
        inputs: &[ValueId],
        outputs: &[ValueId],
    ) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(Op {
            id,
            name: name.to_string(),
            kind,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            attributes: HashMap::new(),
            inplace: Vec::new(),
        });
        id
    }

    /// Attach an attribute to an op
    pub fn set_attribute(&mut self, op: OpId, name: &str, value: Attribute) -> Result<()> {
        let op = self.op_mut(op)?;
        op.attributes.insert(name.to_string(), value);
        Ok(())
    }

    /// Declare that output slot `output` of `op` overwrites input slot `input`
    pub fn set_inplace(&mut self, op: OpId, input: usize, output: usize) -> Result<()> {
        let op = self.op_mut(op)?;
        if input >= op.inputs.len() || output >= op.outputs.len() {
            return Err(Error::InvalidGraph(format!(
                "In-place pair ({}, {}) out of range for op '{}' with {} inputs and {} outputs",
                input,
                output,
                op.name,
                op.inputs.len(),
                op.outputs.len()
            )));
        }
        op.inplace.push((input, output));
        Ok(())
    }

    /// Append a value to the declared external inputs
    pub fn mark_input(&mut self, value: ValueId) {
        self.inputs.push(value);
    }

    /// Append a value to the declared external outputs
    pub fn mark_output(&mut self, value: ValueId) {
        self.outputs.push(value);
    }

    fn op_mut(&mut self, op: OpId) -> Result<&mut Op> {
        self.ops
            .get_mut(op.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Op with ID {} not found", op)))
    }

    /// Validate the collected values and ops and produce a subgraph
    pub fn build(self) -> Result<Subgraph> {
        let value_count = self.values.len();
        let check_id = |id: ValueId, context: &str| -> Result<()> {
            if id.index() >= value_count {
                return Err(Error::InvalidGraph(format!(
                    "Value with ID {} referenced by {} not found",
                    id, context
                )));
            }
            Ok(())
        };

        for op in &self.ops {
            for &id in op.inputs.iter().chain(op.outputs.iter()) {
                check_id(id, &format!("op '{}'", op.name))?;
            }
        }
        Self::check_declared(&self.inputs, "input", &check_id)?;
        Self::check_declared(&self.outputs, "output", &check_id)?;
        if let Some(both) = self.outputs.iter().find(|&id| self.inputs.contains(id)) {
            return Err(Error::InvalidGraph(format!(
                "Value '{}' is declared as both an external input and an external output",
                self.values[both.index()].name
            )));
        }

        let mut values = Vec::with_capacity(value_count);
        for (index, draft) in self.values.into_iter().enumerate() {
            let size_bytes = draft.desc.size_in_bytes().ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "Integer overflow calculating size for value '{}' with dims {:?}",
                    draft.name, draft.desc.dims
                ))
            })?;
            values.push(Value {
                id: ValueId(index),
                name: draft.name,
                desc: draft.desc,
                size_bytes,
                producer: None,
                consumers: Vec::new(),
            });
        }

        // Wire producer and consumer edges
        for op in &self.ops {
            for (slot, &id) in op.outputs.iter().enumerate() {
                let value = &mut values[id.index()];
                if let Some((other, _)) = value.producer {
                    return Err(Error::InvalidGraph(format!(
                        "Value '{}' is produced by both {} and {}",
                        value.name, other, op.id
                    )));
                }
                value.producer = Some((op.id, slot));
            }
            for (slot, &id) in op.inputs.iter().enumerate() {
                values[id.index()].consumers.push((op.id, slot));
            }
        }

        for &id in &self.inputs {
            let value = &values[id.index()];
            if let Some((producer, _)) = value.producer {
                return Err(Error::InvalidGraph(format!(
                    "External input '{}' is produced inside the subgraph by {}",
                    value.name, producer
                )));
            }
        }

        let order = Self::topological_order(&self.ops, &values)?;

        debug!(
            "Built subgraph with {} ops, {} values, {} inputs, {} outputs",
            self.ops.len(),
            values.len(),
            self.inputs.len(),
            self.outputs.len()
        );

        Ok(Subgraph {
            values,
            ops: self.ops,
            order,
            inputs: self.inputs,
            outputs: self.outputs,
            engine: self.engine,
        })
    }

    fn check_declared(
        declared: &[ValueId],
        what: &str,
        check_id: &dyn Fn(ValueId, &str) -> Result<()>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for &id in declared {
            check_id(id, &format!("external {} list", what))?;
            if !seen.insert(id) {
                return Err(Error::InvalidGraph(format!(
                    "Value {} declared twice as external {}",
                    id, what
                )));
            }
        }
        Ok(())
    }

    /// Sort ops topologically, keeping insertion order when it is already valid
    fn topological_order(ops: &[Op], values: &[Value]) -> Result<Vec<OpId>> {
        let mut graph: DiGraph<OpId, ValueId> = DiGraph::with_capacity(ops.len(), values.len());
        let nodes: Vec<NodeIndex> = ops.iter().map(|op| graph.add_node(op.id)).collect();

        let mut insertion_order_valid = true;
        for op in ops {
            for &id in &op.inputs {
                if let Some((producer, _)) = values[id.index()].producer {
                    graph.add_edge(nodes[producer.index()], nodes[op.id.index()], id);
                    if producer >= op.id {
                        insertion_order_valid = false;
                    }
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let op = graph[cycle.node_id()];
            Error::InvalidGraph(format!(
                "Cycle detected in subgraph at op '{}'",
                ops[op.index()].name
            ))
        })?;

        if insertion_order_valid {
            return Ok(ops.iter().map(|op| op.id).collect());
        }

        debug!("Ops were not inserted in topological order, reordering");
        Ok(sorted.into_iter().map(|node| graph[node]).collect())
    }
}
