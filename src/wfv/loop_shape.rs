//! Loop shape recognition, i.e. the capability checks deciding which loops
//! the divergent-loop normalizer and the remainder transform can handle.
//!
//! Both checks are pure functions of the IR and its analyses (no caching, no
//! mutation), so asking twice always gives the same answer.
//!
//! Supported shapes:
//! * [`recognize_single_exit`]: a reducible loop with a dedicated preheader,
//!   a single latch, and a single exit edge, leaving from a `br_if` in a block
//!   that dominates the latch (the exit test itself can be anything)
//! * [`recognize_counted_loop`]: additionally, the header is the exiting
//!   block, the latch branches straight back to the header, and the exit test
//!   compares a header induction phi (`i = phi [start, i + step]`, constant
//!   `step > 0`) against a loop-invariant bound, staying while `i < bound`
//!   (signed or unsigned, written in any equivalent way)

use crate::cf::{CfgAnalyses, LoopData};
use crate::{BinOp, Block, CmpOp, ConstKind, Context, ControlInstKind, FuncDefBody, Inst, InstKind, Value};

/// Why a loop was rejected by a capability check.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoopRejection {
    #[error("loop is irreducible")]
    Irreducible,
    #[error("no dedicated preheader")]
    NoPreheader,
    #[error("{0} latches (expected exactly one)")]
    NotSingleLatch(usize),
    #[error("{0} exit edges (expected exactly one)")]
    NotSingleExit(usize),
    #[error("exiting block {0} doesn't end in `br_if`")]
    ExitNotConditional(Block),
    #[error("exiting block {0} doesn't dominate the latch")]
    ExitNotDominatingLatch(Block),
    #[error("exit test is in {0}, not in the header")]
    ExitNotInHeader(Block),
    #[error("latch {0} doesn't branch straight back to the header")]
    LatchNotUnconditional(Block),
    #[error("exit test is not an induction variable compared against a loop-invariant bound")]
    UnrecognizedExitTest,
    #[error("induction step is not a positive constant")]
    NonPositiveStep,
}

/// A loop accepted by [`recognize_single_exit`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SingleExitLoop {
    pub header: Block,
    pub preheader: Block,
    pub latch: Block,

    /// The only block with an edge leaving the loop.
    pub exiting: Block,

    /// The target of the exiting edge (outside the loop).
    pub exit: Block,

    /// The other target of `exiting`'s `br_if` (inside the loop).
    pub continue_target: Block,

    /// The `br_if` condition of `exiting`.
    pub cond: Value,

    /// Whether `cond` being `true` means staying in the loop.
    pub stay_on_true: bool,
}

/// A loop accepted by [`recognize_counted_loop`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CountedLoop {
    pub shape: SingleExitLoop,

    /// Induction variable (a phi in the header).
    pub iv: Inst,
    pub start: Value,
    pub step: i64,

    /// Loop-invariant bound the induction variable is compared against.
    pub bound: Value,

    /// `CmpOp::SLt` or `CmpOp::ULt`: the loop keeps going while `iv op bound`.
    pub stay_op: CmpOp,
}

/// Signature shared by all the capability checks, so that callers (e.g. the
/// divergent-loop normalizer) can be handed any of them.
pub type LoopShapeCheck =
    fn(&Context, &FuncDefBody, &CfgAnalyses, &LoopData) -> Result<SingleExitLoop, LoopRejection>;

pub fn recognize_single_exit(
    _cx: &Context,
    func: &FuncDefBody,
    analyses: &CfgAnalyses,
    loop_data: &LoopData,
) -> Result<SingleExitLoop, LoopRejection> {
    if !loop_data.reducible {
        return Err(LoopRejection::Irreducible);
    }
    let preheader = loop_data.preheader(func).ok_or(LoopRejection::NoPreheader)?;
    let latch = loop_data.latch().ok_or(LoopRejection::NotSingleLatch(loop_data.latches.len()))?;
    let &[(exiting, exit)] = &loop_data.exit_edges[..] else {
        return Err(LoopRejection::NotSingleExit(loop_data.exit_edges.len()));
    };

    let terminator = &func.blocks[exiting].terminator;
    if terminator.kind != ControlInstKind::CondBranch {
        return Err(LoopRejection::ExitNotConditional(exiting));
    }
    if !analyses.dom.dominates(exiting, latch) {
        return Err(LoopRejection::ExitNotDominatingLatch(exiting));
    }

    let stay_on_true = terminator.targets[1] == exit;
    let continue_target = if stay_on_true { terminator.targets[0] } else { terminator.targets[1] };
    Ok(SingleExitLoop {
        header: loop_data.header,
        preheader,
        latch,
        exiting,
        exit,
        continue_target,
        cond: terminator.inputs[0],
        stay_on_true,
    })
}

pub fn recognize_counted_loop(
    cx: &Context,
    func: &FuncDefBody,
    analyses: &CfgAnalyses,
    loop_data: &LoopData,
) -> Result<CountedLoop, LoopRejection> {
    let shape = recognize_single_exit(cx, func, analyses, loop_data)?;
    if shape.exiting != shape.header {
        return Err(LoopRejection::ExitNotInHeader(shape.exiting));
    }
    let latch_terminator = &func.blocks[shape.latch].terminator;
    if shape.latch == shape.header || latch_terminator.kind != ControlInstKind::Branch {
        return Err(LoopRejection::LatchNotUnconditional(shape.latch));
    }

    // The exit test, as `lhs op rhs`, with `op` being the "stay" comparison.
    let cond_inst = shape.cond.as_inst().ok_or(LoopRejection::UnrecognizedExitTest)?;
    let cond_def = &func.insts[cond_inst];
    let InstKind::Cmp(op) = cond_def.kind else {
        return Err(LoopRejection::UnrecognizedExitTest);
    };
    let op = if shape.stay_on_true { op } else { op.inverse() };
    let (lhs, rhs) = (cond_def.inputs[0], cond_def.inputs[1]);

    let is_header_phi = |v: Value| {
        v.as_inst().filter(|&inst| {
            func.insts[inst].block == shape.header && func.insts[inst].kind.is_phi()
        })
    };
    let (iv, bound, op) = match (is_header_phi(lhs), is_header_phi(rhs)) {
        (Some(iv), _) => (iv, rhs, op),
        (None, Some(iv)) => (iv, lhs, op.swapped()),
        (None, None) => return Err(LoopRejection::UnrecognizedExitTest),
    };
    if !matches!(op, CmpOp::SLt | CmpOp::ULt) || !is_loop_invariant(func, loop_data, bound) {
        return Err(LoopRejection::UnrecognizedExitTest);
    }

    let start = func
        .phi_incoming_value(iv, shape.preheader)
        .ok_or(LoopRejection::UnrecognizedExitTest)?;
    let next = func
        .phi_incoming_value(iv, shape.latch)
        .and_then(Value::as_inst)
        .ok_or(LoopRejection::UnrecognizedExitTest)?;
    let next_def = &func.insts[next];
    if next_def.kind != InstKind::Binary(BinOp::Add) || !loop_data.contains(next_def.block) {
        return Err(LoopRejection::UnrecognizedExitTest);
    }
    let step = match next_def.inputs[..] {
        [a, step] | [step, a] if a == Value::InstOutput(iv) => step,
        _ => return Err(LoopRejection::UnrecognizedExitTest),
    };
    let step = match step.as_const().map(|ct| &cx[ct].kind) {
        Some(&ConstKind::Int(step)) if step > 0 => step,
        _ => return Err(LoopRejection::NonPositiveStep),
    };

    Ok(CountedLoop { shape, iv, start, step, bound, stay_op: op })
}

/// Whether `v` is defined outside of the loop (constants and parameters are
/// trivially loop-invariant).
pub fn is_loop_invariant(func: &FuncDefBody, loop_data: &LoopData, v: Value) -> bool {
    match v {
        Value::Const(_) | Value::Param(_) => true,
        Value::InstOutput(inst) => !loop_data.contains(func.insts[inst].block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FuncSketch, counted_loop_sketch};

    #[test]
    fn counted_loop_spellings() {
        // Every spelling of "stay while `i < n`" should be recognized.
        for (op, iv_on_left, stay_on_true) in [
            (CmpOp::SLt, true, true),
            (CmpOp::SGe, true, false),
            (CmpOp::SGt, false, true),
            (CmpOp::SLe, false, false),
            (CmpOp::ULt, true, true),
        ] {
            let sketch = counted_loop_sketch(op, iv_on_left, stay_on_true, 1);
            let analyses = CfgAnalyses::compute(&sketch.func);
            let loop_id = analyses.loops.ids().next().unwrap();
            let counted =
                recognize_counted_loop(&sketch.cx, &sketch.func, &analyses, &analyses.loops[loop_id])
                    .unwrap();
            assert_eq!(counted.step, 1);
            assert!(matches!(counted.stay_op, CmpOp::SLt | CmpOp::ULt));
            assert_eq!(counted.bound, Value::Param(0));
        }
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let sketch = counted_loop_sketch(CmpOp::SGt, true, true, 1);
        let analyses = CfgAnalyses::compute(&sketch.func);
        let loop_data = &analyses.loops[analyses.loops.ids().next().unwrap()];
        assert_eq!(
            recognize_counted_loop(&sketch.cx, &sketch.func, &analyses, loop_data),
            Err(LoopRejection::UnrecognizedExitTest)
        );
        // Still a perfectly fine single-exit loop.
        assert!(recognize_single_exit(&sketch.cx, &sketch.func, &analyses, loop_data).is_ok());
    }

    #[test]
    fn checks_are_idempotent() {
        let sketch = counted_loop_sketch(CmpOp::SLt, true, true, 0);
        let analyses = CfgAnalyses::compute(&sketch.func);
        let loop_data = &analyses.loops[analyses.loops.ids().next().unwrap()];
        let first = recognize_counted_loop(&sketch.cx, &sketch.func, &analyses, loop_data);
        let second = recognize_counted_loop(&sketch.cx, &sketch.func, &analyses, loop_data);
        assert_eq!(first, Err(LoopRejection::NonPositiveStep));
        assert_eq!(first, second);
    }

    #[test]
    fn multi_exit_loops_are_rejected() {
        // entry -> header; header: br_if c0, body, exit; body: br_if c1, header, exit
        let mut s = FuncSketch::new(2);
        let [header, body, exit] = s.blocks(["header", "body", "exit"]);
        s.br(s.entry(), header);
        s.br_if(header, Value::Param(0), body, exit);
        s.br_if(body, Value::Param(1), header, exit);
        s.ret(exit);

        let analyses = CfgAnalyses::compute(&s.func);
        let loop_data = &analyses.loops[analyses.loops.ids().next().unwrap()];
        assert_eq!(
            recognize_single_exit(&s.cx, &s.func, &analyses, loop_data),
            Err(LoopRejection::NotSingleExit(2))
        );
    }
}
