//! Divergent loop normalization.
//!
//! A loop whose exit condition is varying may be left by different lanes in
//! different iterations, which lock-step execution can't express directly.
//! Normalizing such a loop makes it keep iterating while *any* lane is still
//! active, with the per-lane state tracked explicitly:
//! * a "live" mask phi in the header (the header's block mask), starting out
//!   as the mask of the preheader edge, and continuing as the mask of the
//!   lanes that took the in-loop edge of the exiting block
//! * an "entry" mask phi in the header, carrying the preheader edge mask
//!   unchanged, which is the mask of the exit edge (every lane that entered
//!   the loop eventually leaves it)
//! * the exiting `br_if` tests `rv_any(live lanes staying)`, a uniform value
//! * every value used after the loop gets a "tracker" phi, which latches the
//!   value in the iteration a lane exits, and holds it afterwards
//!
//! ```text
//! header:                              header:
//!   ...                                  live = phi [pre: m_pre, latch: stay]
//!                                        entry = phi [pre: m_pre, latch: entry]
//!                                        t = phi [pre: undef, latch: t']
//!   v = ...                       =>     v = ...
//!   br_if c, body, exit                  stay = live & c
//!                                        any = rv_any(stay)
//!                                        t' = select(live & !c, v, t)
//!                                        br_if any, body, exit
//! exit:                                exit:
//!   use(v)                               use(t')
//! ```

use crate::builder::FuncBuilder;
use crate::cf::{CfgAnalyses, LoopData, LoopId};
use crate::visit::UseMap;
use crate::wfv::loop_shape::{self, LoopShapeCheck, SingleExitLoop};
use crate::wfv::mask::MaskExpander;
use crate::wfv::{IntrinsicKind, StageCx, VectorShape, VectorizeError};
use crate::{ControlInst, Inst, TypeKind, Value};
use smallvec::SmallVec;

/// Header phis introduced for one divergent loop (before it's rewritten).
struct LoopMasks {
    live: Inst,
    entry: Inst,
}

pub struct DivLoopTrans {
    check: LoopShapeCheck,
}

impl Default for DivLoopTrans {
    fn default() -> Self {
        Self { check: loop_shape::recognize_single_exit }
    }
}

impl DivLoopTrans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `check` (instead of [`loop_shape::recognize_single_exit`]) to decide
    /// which divergent loops are supported.
    pub fn with_check(check: LoopShapeCheck) -> Self {
        Self { check }
    }

    fn has_divergent_exit(st: &StageCx<'_>, loop_data: &LoopData) -> bool {
        loop_data.exit_edges.iter().any(|&(exiting, _)| {
            st.func.blocks[exiting]
                .terminator
                .cond()
                .is_some_and(|cond| !st.vinfo.is_uniform(cond))
        })
    }

    /// Normalize every loop of the region that has a varying exit condition,
    /// returning the number of normalized loops.
    ///
    /// All loops are checked before any of them is modified, so an
    /// [`VectorizeError::UnsupportedLoop`] leaves the function untouched.
    pub fn transform_divergent_loops(
        &self,
        st: &mut StageCx<'_>,
        mask_ex: &mut MaskExpander,
        analyses: &CfgAnalyses,
    ) -> Result<usize, VectorizeError> {
        let region_entry = st.vinfo.entry(st.func);

        let mut divergent_loops: Vec<(LoopId, SingleExitLoop)> = vec![];
        for id in analyses.loops.inner_to_outer() {
            let loop_data = &analyses.loops[id];
            if loop_data.header == region_entry
                || !st.vinfo.in_region(loop_data.header)
                || !Self::has_divergent_exit(st, loop_data)
            {
                continue;
            }
            let shape = (self.check)(st.cx, st.func, analyses, loop_data).map_err(|reason| {
                VectorizeError::UnsupportedLoop { header: loop_data.header, reason }
            })?;
            divergent_loops.push((id, shape));
        }
        if divergent_loops.is_empty() {
            return Ok(0);
        }

        // All the masks that the rewrite changes the meaning of are overridden
        // before any mask is requested, as requests can reach (through the
        // backedges of enclosing loops) the exits of any divergent loop.
        let bool_ty = st.cx.bool_type();
        let mut loop_masks = Vec::with_capacity(divergent_loops.len());
        for &(id, shape) in &divergent_loops {
            let live = st.func.append_phi(shape.header, bool_ty, []);
            let entry = st.func.append_phi(shape.header, bool_ty, []);
            for mask in [live, entry] {
                st.vinfo.set_shape(Value::InstOutput(mask), VectorShape::varying());
            }
            mask_ex.set_block_mask(st, shape.header, Value::InstOutput(live));
            mask_ex.set_edge_mask(shape.exiting, shape.exit, Value::InstOutput(entry));
            for &block in &analyses.loops[id].blocks {
                st.vinfo.set_divergent(block, true);
            }
            loop_masks.push(LoopMasks { live, entry });
        }

        for (&(id, shape), masks) in divergent_loops.iter().zip(loop_masks) {
            Self::normalize_loop(st, mask_ex, analyses, &analyses.loops[id], shape, masks)?;
        }
        log::debug!(
            target: "wfv::div_loop",
            "normalized {} divergent loops",
            divergent_loops.len()
        );
        Ok(divergent_loops.len())
    }

    fn normalize_loop(
        st: &mut StageCx<'_>,
        mask_ex: &mut MaskExpander,
        analyses: &CfgAnalyses,
        loop_data: &LoopData,
        shape: SingleExitLoop,
        masks: LoopMasks,
    ) -> Result<(), VectorizeError> {
        let SingleExitLoop { header, preheader, latch, exiting, exit, continue_target, cond, stay_on_true } =
            shape;
        let cfg = &analyses.cfg;
        let varying = VectorShape::varying();

        let pre_mask = mask_ex.request_edge_mask(st, cfg, preheader, header);
        let stay = mask_ex.request_edge_mask(st, cfg, exiting, continue_target);
        let exiting_mask = mask_ex.request_block_mask(st, cfg, exiting);

        st.func.set_phi_incoming(masks.live, preheader, pre_mask);
        st.func.set_phi_incoming(masks.live, latch, stay);
        st.func.set_phi_incoming(masks.entry, preheader, pre_mask);
        st.func.set_phi_incoming(masks.entry, latch, Value::InstOutput(masks.entry));

        // Lanes leaving in the current iteration.
        let (exit_now, any) = {
            let mut b = FuncBuilder::at_end(st.cx, st.func, exiting);
            let exit_cond = if stay_on_true { b.not(cond) } else { cond };
            let exit_now = b.and(exiting_mask, exit_cond);
            let bool_ty = b.cx.bool_type();
            let any = b.call(st.intrinsics.func(IntrinsicKind::Any), bool_ty, [stay]);
            for v in [exit_cond, exit_now] {
                if v != cond && v != exiting_mask && v.as_inst().is_some() {
                    st.vinfo.set_shape(v, varying);
                }
            }
            (exit_now, Value::InstOutput(any))
        };
        st.vinfo.set_shape(any, VectorShape::uni());

        // Values defined in the loop and used after it.
        let live_outs: SmallVec<[Inst; 4]> = {
            let uses = UseMap::compute(st.func);
            let (cx, func) = (st.cx, &*st.func);
            loop_data
                .blocks
                .iter()
                .flat_map(|&block| func.blocks[block].insts.iter().copied())
                .filter(|&inst| {
                    cx[func.insts[inst].output_type].kind != TypeKind::Void
                        && uses
                            .users_of(Value::InstOutput(inst))
                            .iter()
                            .any(|user| !loop_data.contains(user.block(func)))
                })
                .collect()
        };
        for &inst in &live_outs {
            let v = Value::InstOutput(inst);
            let ty = st.func.insts[inst].output_type;
            let undef = Value::Const(st.cx.const_undef(ty));
            let tracker = st.func.append_phi(header, ty, [(preheader, undef)]);
            let tracked = FuncBuilder::at_end(st.cx, st.func, exiting).select(
                exit_now,
                v,
                Value::InstOutput(tracker),
            );
            st.func.set_phi_incoming(tracker, latch, tracked);
            st.func.replace_uses_where(v, tracked, |func, user| {
                !loop_data.contains(user.block(func))
            });
            st.vinfo.set_shape(Value::InstOutput(tracker), varying);
            st.vinfo.set_shape(tracked, varying);
        }

        st.func.blocks[exiting].terminator = ControlInst::cond_branch(any, continue_target, exit);

        log::debug!(
            target: "wfv::div_loop",
            "loop {header}: exit {exiting} -> {exit} now tests {any}, {} live-out(s) tracked",
            live_outs.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Evaluator;
    use crate::test_util::{FuncSketch, counted_loop_sketch, lanes_of_ints};
    use crate::wfv::LoopRejection;
    use crate::{Block, CmpOp};

    fn normalize(s: &mut FuncSketch) -> Result<usize, VectorizeError> {
        let analyses = CfgAnalyses::compute(&s.func);
        let mut mask_ex = MaskExpander::new();
        DivLoopTrans::new().transform_divergent_loops(&mut s.stage_cx(), &mut mask_ex, &analyses)
    }

    fn header_of(s: &FuncSketch) -> Block {
        let analyses = CfgAnalyses::compute(&s.func);
        analyses.loops[analyses.loops.ids().next().unwrap()].header
    }

    #[test]
    fn uniform_exits_are_left_alone() {
        let mut s = counted_loop_sketch(CmpOp::SLt, true, true, 1);
        let header = header_of(&s);
        let cond = s.func.blocks[header].terminator.cond().unwrap();
        s.vinfo.set_shape(cond, VectorShape::uni());
        let before = s.func.print(&s.cx);

        assert_eq!(normalize(&mut s).unwrap(), 0);
        assert_eq!(s.func.print(&s.cx), before);
    }

    #[test]
    fn varying_exits_wait_for_every_lane() {
        let mut s = counted_loop_sketch(CmpOp::SLt, true, true, 1);
        let header = header_of(&s);
        let body = s.func.blocks[header].terminator.targets[0];

        assert_eq!(normalize(&mut s).unwrap(), 1);
        let cond = s.func.blocks[header].terminator.cond().unwrap();
        assert_eq!(s.intrinsics.called_by(&s.func, cond), Some(IntrinsicKind::Any));
        assert!(s.vinfo.is_uniform(cond));
        // `i`, plus the live and entry masks.
        assert_eq!(s.func.phis(header).len(), 3);

        let run = Evaluator::new(&s.cx, &s.func, 4)
            .with_intrinsics(&s.intrinsics)
            .run(&[lanes_of_ints([0, 3, 1, 2])])
            .unwrap();
        assert_eq!(run.visits(body), 3);
    }

    #[test]
    fn custom_checks_decide_what_is_supported() {
        let mut s = counted_loop_sketch(CmpOp::SLt, true, true, 1);
        let header = header_of(&s);
        let before = s.func.print(&s.cx);

        let analyses = CfgAnalyses::compute(&s.func);
        let err = DivLoopTrans::with_check(|_, _, _, _| Err(LoopRejection::UnrecognizedExitTest))
            .transform_divergent_loops(&mut s.stage_cx(), &mut MaskExpander::new(), &analyses)
            .unwrap_err();
        assert!(
            matches!(
                err,
                VectorizeError::UnsupportedLoop { header: h, reason: LoopRejection::UnrecognizedExitTest }
                    if h == header
            ),
            "{err}"
        );
        assert_eq!(s.func.print(&s.cx), before);
        assert_eq!(s.func.phis(header).len(), 1);
    }

    #[test]
    fn multiple_exits_are_rejected_untouched() {
        // entry: br header; header: br_if p0, body, exit; body: br_if p1, header, exit
        let mut s = FuncSketch::new(2);
        let [header, body, exit] = s.blocks(["header", "body", "exit"]);
        s.br(s.entry(), header);
        s.br_if(header, Value::Param(0), body, exit);
        s.br_if(body, Value::Param(1), header, exit);
        s.ret(exit);
        let before = s.func.print(&s.cx);

        let err = normalize(&mut s).unwrap_err();
        assert!(matches!(err, VectorizeError::UnsupportedLoop { header: h, .. } if h == header), "{err}");
        assert!(err.is_recoverable());
        assert_eq!(s.func.print(&s.cx), before);
    }
}
