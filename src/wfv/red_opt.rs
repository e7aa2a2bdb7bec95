//! Reduction-chain optimization.
//!
//! A reduction over the loop being vectorized (the region) keeps feeding the
//! running accumulator through every update of the chain:
//! ```text
//! header:  sum = phi [init, sum']
//!          t = sum + a
//!          sum' = t + b
//! ```
//! which would force every vectorized update to see the true (horizontally
//! combined) accumulator. Instead, the chain is restarted from the neutral
//! element each iteration, and folded into the accumulator once:
//! ```text
//! header:  sum = phi [init, fold]
//!          t = 0 + a
//!          sum' = t + b
//!          fold = sum + sum'
//! ```
//! Uses of `sum'` after the loop see `fold` instead, so nothing observable
//! changes (associativity and commutativity of the reduction do the rest).

use crate::builder::{FuncBuilder, InsertPoint};
use crate::visit::{UseMap, User};
use crate::wfv::reduction::{Reduction, ReductionAnalysis, neutral_element};
use crate::wfv::{StageCx, VectorizeError};
use crate::{Inst, Value};
use smallvec::SmallVec;

pub struct ReductionOptimization<'a> {
    reda: &'a ReductionAnalysis,
}

impl<'a> ReductionOptimization<'a> {
    pub fn new(reda: &'a ReductionAnalysis) -> Self {
        Self { reda }
    }

    /// Rewrite the reduction rooted at the region header phi `phi`, returning
    /// whether anything changed.
    pub fn optimize(
        st: &mut StageCx<'_>,
        phi: Inst,
        red: &Reduction,
    ) -> Result<bool, VectorizeError> {
        let phi_value = Value::InstOutput(phi);

        // The phi only feeding the next accumulator value is already minimal.
        if UseMap::compute(st.func).num_users(phi_value) == 1 {
            return Ok(false);
        }

        let ty = st.func.insts[phi].output_type;
        let Some(neutral) = neutral_element(st.cx, red.kind, ty) else {
            log::debug!(target: "wfv::red_opt", "{phi}: no neutral element for {:?}", red.kind);
            return Ok(false);
        };
        let neutral = Value::Const(neutral);

        let incoming: SmallVec<[_; 2]> = st.func.at_inst(phi).phi_incoming().collect();
        let in_region = |v: Value| st.vinfo.defined_in_region(st.func, v);
        let latch_idx = match incoming[..] {
            [(_, a), _] if in_region(a) => 0,
            [_, (_, b)] if in_region(b) => 1,
            _ => {
                return Err(VectorizeError::bug(format!(
                    "reduction {phi} has no in-region latch value"
                )));
            }
        };
        let (latch_pred, latch_value) = incoming[latch_idx];
        let latch = latch_value
            .as_inst()
            .ok_or_else(|| VectorizeError::bug(format!("{latch_value} isn't an instruction")))?;

        // Partial chains start from the neutral element.
        let vinfo = &*st.vinfo;
        st.func.replace_uses_where(phi_value, neutral, |func, user| {
            vinfo.in_region(user.block(func)) && user != User::Inst(phi)
        });

        let at = if st.func.insts[latch].kind.is_phi() {
            InsertPoint::AfterPhis(st.func.insts[latch].block)
        } else {
            InsertPoint::After(latch)
        };
        let fold = FuncBuilder::new(st.cx, st.func, at).binary(red.kind.binop(), phi_value, latch_value);
        st.vinfo.set_shape(fold, st.vinfo.shape(phi_value));

        let vinfo = &*st.vinfo;
        st.func.replace_uses_where(latch_value, fold, |func, user| {
            !vinfo.in_region(user.block(func))
        });
        st.func.set_phi_incoming(phi, latch_pred, fold);

        log::debug!(target: "wfv::red_opt", "{phi}: {:?} chain folded by {fold}", red.kind);
        Ok(true)
    }

    /// Optimize every reduction rooted at a phi of the region entry, returning
    /// how many were rewritten.
    pub fn run(&self, st: &mut StageCx<'_>) -> Result<usize, VectorizeError> {
        if st.vinfo.region().is_none() {
            log::debug!(target: "wfv::red_opt", "whole-function mode, no reductions to optimize");
            return Ok(0);
        }

        let header = st.vinfo.entry(st.func);
        let mut num_optimized = 0;
        for phi in st.func.phis(header) {
            let Some(red) = self.reda.reduction_of(phi) else { continue };
            if Self::optimize(st, phi, red)? {
                num_optimized += 1;
            }
        }
        log::info!(target: "wfv::red_opt", "redOpt: optimized {num_optimized} reduction chains");
        Ok(num_optimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cf::CfgAnalyses;
    use crate::eval::{Evaluator, Scalar};
    use crate::test_util::{FuncSketch, lanes_of_ints};
    use crate::wfv::{Region, VectorizationInfo};
    use crate::{BinOp, CmpOp};

    /// `for i in 0..p0 { sum = sum op p1 } return sum`, with the loop as region.
    fn reduction_loop(op: BinOp) -> (FuncSketch, Inst) {
        let mut s = FuncSketch::with_params(
            |cx| [cx.int_type(32), cx.int_type(32)],
            |cx| cx.int_type(32),
        );
        let [header, body, exit] = s.blocks(["header", "body", "exit"]);
        let entry = s.entry();
        s.br(entry, header);

        let i32_ty = s.cx.int_type(32);
        let init = Value::Const(s.cx.const_int(i32_ty, 3));
        let zero = Value::Const(s.cx.const_int(i32_ty, 0));
        let one = Value::Const(s.cx.const_int(i32_ty, 1));
        let sum = s.func.append_phi(header, i32_ty, [(entry, init)]);
        let i = s.func.append_phi(header, i32_ty, [(entry, zero)]);

        let mut b = s.builder(header);
        let c = b.cmp(CmpOp::SLt, Value::InstOutput(i), Value::Param(0));
        b.cond_br(c, body, exit);

        let mut b = s.builder(body);
        let next_sum = b.binary(op, Value::InstOutput(sum), Value::Param(1));
        let next_i = b.binary(BinOp::Add, Value::InstOutput(i), one);
        b.br(header);
        s.func.set_phi_incoming(sum, body, next_sum);
        s.func.set_phi_incoming(i, body, next_i);
        s.ret_value(exit, Value::InstOutput(sum));

        let analyses = CfgAnalyses::compute(&s.func);
        let loop_data = &analyses.loops[analyses.loops.ids().next().unwrap()];
        s.vinfo = VectorizationInfo::new(4, Some(Region::for_loop(loop_data)));
        (s, sum)
    }

    fn optimize(s: &mut FuncSketch) -> usize {
        let analyses = CfgAnalyses::compute(&s.func);
        let reda = ReductionAnalysis::analyze(&s.cx, &s.func, &analyses.loops);
        ReductionOptimization::new(&reda).run(&mut s.stage_cx()).unwrap()
    }

    fn eval(s: &FuncSketch, n: i64, x: i64) -> Scalar {
        let run = Evaluator::new(&s.cx, &s.func, 1)
            .run(&[lanes_of_ints([n]), lanes_of_ints([x])])
            .unwrap();
        run.ret.unwrap()[0]
    }

    #[test]
    fn sum_is_folded_once() {
        let (mut s, sum) = reduction_loop(BinOp::Add);
        let expected = eval(&s, 7, 5);
        let num_insts = s.func.insts.len();

        assert_eq!(optimize(&mut s), 1);
        assert_eq!(s.func.insts.len(), num_insts + 1);
        assert_eq!(eval(&s, 7, 5), expected);
        assert_eq!(expected, Scalar::Int(3 + 7 * 5));

        // The accumulator is only read by the fold (and after the loop).
        let fold = s.func.insts[sum].inputs[1];
        let fold_def = &s.func.insts[fold.as_inst().unwrap()];
        assert_eq!(fold_def.kind, crate::InstKind::Binary(BinOp::Add));
        assert_eq!(fold_def.inputs[0], Value::InstOutput(sum));
    }

    #[test]
    fn whole_function_mode_is_skipped() {
        let (mut s, _) = reduction_loop(BinOp::Xor);
        s.vinfo = VectorizationInfo::new(4, None);
        assert_eq!(optimize(&mut s), 0);
    }
}
