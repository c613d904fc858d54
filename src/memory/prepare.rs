//! Argument preparation: maps op slots to primitive argument kinds.
//!
//! Every lowered op kind has a fixed argument layout. The memory planner walks
//! ops in topological order and asks [`bind_slots`] which [`ExecArg`] each
//! input and output value is passed as.

use strum_macros::Display;

use crate::error::{Error, Result};
use crate::execution::args::ExecArg;
use crate::model::{attr, Op, OpKind, ValueId};

/// One op slot resolved to the argument it is passed as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBinding {
    pub arg: ExecArg,
    pub value: ValueId,
    /// Inputs are read-only for the primitive
    pub is_const: bool,
}

/// Argument layout families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ArgLayout {
    /// `src, weights, [bias], post_op_src...` -> `dst, [scratchpad]`
    ConvOrMatmul,
    /// `src, src1, post_op_src...` -> `dst, [scratchpad]`
    Binary,
    /// Single input, single output with optional scratchpad and workspace
    Siso,
    /// `multiple_src...` -> `dst, [scratchpad]`
    Miso,
    BatchNorm,
    BatchNormFolding,
    ConvBwdData,
}

/// Layout for an op kind, `None` if the kind has no handler
pub fn arg_layout(kind: OpKind) -> Option<ArgLayout> {
    match kind {
        OpKind::Convolution | OpKind::MatMul => Some(ArgLayout::ConvOrMatmul),
        OpKind::Add | OpKind::Multiply | OpKind::Maximum | OpKind::Minimum => {
            Some(ArgLayout::Binary)
        }
        OpKind::Eltwise
        | OpKind::Pooling
        | OpKind::Softmax
        | OpKind::Reorder
        | OpKind::LayerNorm => Some(ArgLayout::Siso),
        OpKind::Concat | OpKind::Sum => Some(ArgLayout::Miso),
        OpKind::BatchNorm => Some(ArgLayout::BatchNorm),
        OpKind::BatchNormFolding => Some(ArgLayout::BatchNormFolding),
        OpKind::ConvolutionBackwardData => Some(ArgLayout::ConvBwdData),
        OpKind::Wildcard => None,
    }
}

/// Walks one side (inputs or outputs) of an op, slot by slot
struct Slots<'a> {
    op: &'a Op,
    side: &'static str,
    is_const: bool,
    values: &'a [ValueId],
    next: usize,
    bound: Vec<SlotBinding>,
}

impl<'a> Slots<'a> {
    fn inputs(op: &'a Op) -> Self {
        Self::new(op, "input", true, &op.inputs)
    }

    fn outputs(op: &'a Op) -> Self {
        Self::new(op, "output", false, &op.outputs)
    }

    fn new(op: &'a Op, side: &'static str, is_const: bool, values: &'a [ValueId]) -> Self {
        Self {
            op,
            side,
            is_const,
            values,
            next: 0,
            bound: Vec::with_capacity(values.len()),
        }
    }

    fn push(&mut self, arg: ExecArg, value: ValueId) {
        self.bound.push(SlotBinding {
            arg,
            value,
            is_const: self.is_const,
        });
    }

    /// Slots not bound yet
    fn remaining(&self) -> usize {
        self.values.len() - self.next
    }

    fn required(&mut self, arg: ExecArg) -> Result<()> {
        match self.values.get(self.next) {
            Some(&value) => {
                self.push(arg, value);
                self.next += 1;
                Ok(())
            }
            None => Err(Error::InvalidGraph(format!(
                "Op '{}' ({}) is missing {} #{} ({})",
                self.op.name, self.op.kind, self.side, self.next, arg
            ))),
        }
    }

    fn optional(&mut self, arg: ExecArg) {
        if let Some(&value) = self.values.get(self.next) {
            self.push(arg, value);
            self.next += 1;
        }
    }

    /// Bind every remaining slot, numbered from zero
    fn rest(&mut self, arg: impl Fn(usize) -> ExecArg) {
        let values = self.values;
        for (k, &value) in values[self.next..].iter().enumerate() {
            self.push(arg(k), value);
        }
        self.next = self.values.len();
    }

    fn finish(self) -> Result<Vec<SlotBinding>> {
        if self.next < self.values.len() {
            return Err(Error::InvalidGraph(format!(
                "Op '{}' ({}) has {} {}s but its layout only takes {}",
                self.op.name,
                self.op.kind,
                self.values.len(),
                self.side,
                self.next
            )));
        }
        Ok(self.bound)
    }
}

/// Argument kinds of every input and output of `op`, inputs first
pub fn bind_slots(op: &Op) -> Result<Vec<SlotBinding>> {
    let layout = arg_layout(op.kind).ok_or_else(|| {
        Error::UnsupportedOperation(format!(
            "No argument preparation for op '{}' of kind {}",
            op.name, op.kind
        ))
    })?;

    let mut ins = Slots::inputs(op);
    let mut outs = Slots::outputs(op);

    match layout {
        ArgLayout::ConvOrMatmul => {
            ins.required(ExecArg::Src)?;
            ins.required(ExecArg::Weights)?;
            if op.bool_attr_or(attr::WITH_BIAS, false) {
                ins.required(ExecArg::Bias)?;
            }
            ins.rest(ExecArg::PostOpSrc);
            outs.required(ExecArg::Dst)?;
            outs.optional(ExecArg::Scratchpad);
        }
        ArgLayout::Binary => {
            ins.required(ExecArg::Src)?;
            ins.required(ExecArg::Src1)?;
            ins.rest(ExecArg::PostOpSrc);
            outs.required(ExecArg::Dst)?;
            outs.optional(ExecArg::Scratchpad);
        }
        ArgLayout::Siso => {
            ins.required(ExecArg::Src)?;
            outs.required(ExecArg::Dst)?;
            // The workspace, when requested, is always the last output
            let with_workspace = op.bool_attr_or(attr::WITH_WORKSPACE, false);
            let reserved = usize::from(with_workspace);
            if op.bool_attr_or(attr::WITH_SCRATCHPAD, true) && outs.remaining() > reserved {
                outs.optional(ExecArg::Scratchpad);
            }
            if with_workspace {
                outs.required(ExecArg::Workspace)?;
            }
        }
        ArgLayout::Miso => {
            if op.inputs.is_empty() {
                return Err(Error::InvalidGraph(format!(
                    "Op '{}' ({}) has no inputs",
                    op.name, op.kind
                )));
            }
            ins.rest(ExecArg::MultipleSrc);
            outs.required(ExecArg::Dst)?;
            outs.optional(ExecArg::Scratchpad);
        }
        ArgLayout::BatchNorm => {
            ins.required(ExecArg::Src)?;
            ins.required(ExecArg::Scale)?;
            ins.required(ExecArg::Shift)?;
            outs.required(ExecArg::Dst)?;
            if op.bool_attr_or(attr::IS_TRAINING, false) {
                outs.required(ExecArg::Mean)?;
                outs.required(ExecArg::Variance)?;
                outs.optional(ExecArg::Scratchpad);
                outs.optional(ExecArg::Workspace);
            } else {
                ins.required(ExecArg::Mean)?;
                ins.required(ExecArg::Variance)?;
                outs.optional(ExecArg::Scratchpad);
            }
        }
        ArgLayout::BatchNormFolding => {
            ins.required(ExecArg::Weights)?;
            if op.bool_attr_or(attr::WITH_BIAS, false) {
                ins.required(ExecArg::Bias)?;
            }
            ins.required(ExecArg::Scale)?;
            ins.required(ExecArg::Shift)?;
            ins.required(ExecArg::Mean)?;
            ins.required(ExecArg::Variance)?;
            outs.required(ExecArg::Dst)?;
            outs.required(ExecArg::Dst1)?;
            outs.optional(ExecArg::Scratchpad);
        }
        ArgLayout::ConvBwdData => {
            ins.required(ExecArg::DiffDst)?;
            ins.required(ExecArg::Weights)?;
            outs.required(ExecArg::DiffSrc)?;
            outs.optional(ExecArg::Scratchpad);
        }
    }

    let mut bound = ins.finish()?;
    bound.extend(outs.finish()?);
    Ok(bound)
}
