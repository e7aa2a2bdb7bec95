//! Lazy block/edge predicate ("mask") synthesis.
//!
//! The mask of a block is the set of lanes for which control reaches it:
//! * the region entry (and any block known not to be divergent) is `true`
//! * a block with one predecessor `P` uses the mask of the edge `P -> B`
//! * a block with several predecessors gets a phi of the incoming edge masks
//!   (which also covers loop headers, through their backedge)
//!
//! The mask of an edge `P -> S` is `mask(P)`, and-ed with `P`'s branch
//! condition (or its negation) if `P` ends in a `br_if`.
//!
//! Masks are memoized, and can be overridden before they're first requested
//! (e.g. loop headers and exits in divergent loops, see [`div_loop`]).
//!
//! [`div_loop`]: crate::wfv::div_loop

use crate::builder::FuncBuilder;
use crate::cf::ControlFlowGraph;
use crate::wfv::{StageCx, VectorShape};
use crate::{Block, EntityOrientedDenseMap, FxIndexMap, Value};
use smallvec::SmallVec;

#[derive(Default)]
pub struct MaskExpander {
    block_masks: EntityOrientedDenseMap<Block, Value>,
    edge_masks: FxIndexMap<(Block, Block), Value>,
}

impl MaskExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mask of `block`, if already computed (or overridden).
    pub fn block_mask(&self, block: Block) -> Option<Value> {
        self.block_masks.get(block).copied()
    }

    /// The mask of the edge `pred -> succ`, if already computed (or overridden).
    pub fn edge_mask(&self, pred: Block, succ: Block) -> Option<Value> {
        self.edge_masks.get(&(pred, succ)).copied()
    }

    /// Override the mask of `block` (before it's ever requested).
    pub fn set_block_mask(&mut self, st: &mut StageCx<'_>, block: Block, mask: Value) {
        self.block_masks.insert(block, mask);
        st.vinfo.set_predicate(block, mask);
    }

    /// Override the mask of the edge `pred -> succ`.
    pub fn set_edge_mask(&mut self, pred: Block, succ: Block, mask: Value) {
        self.edge_masks.insert((pred, succ), mask);
    }

    /// Replace `old` with `new` wherever it's used as a cached mask (after the
    /// IR was rewritten to do the same).
    pub fn replace_mask(&mut self, blocks: &[Block], old: Value, new: Value) {
        for &block in blocks {
            if let Some(mask) = self.block_masks.get_mut(block).filter(|mask| **mask == old) {
                *mask = new;
            }
        }
        for mask in self.edge_masks.values_mut().filter(|mask| **mask == old) {
            *mask = new;
        }
    }

    pub fn request_block_mask(
        &mut self,
        st: &mut StageCx<'_>,
        cfg: &ControlFlowGraph,
        block: Block,
    ) -> Value {
        if let Some(mask) = self.block_mask(block) {
            return mask;
        }

        let true_ = Value::Const(st.cx.const_bool(true));
        if block == st.vinfo.entry(st.func)
            || !st.vinfo.in_region(block)
            || !st.vinfo.is_divergent(block)
        {
            self.set_block_mask(st, block, true_);
            return true_;
        }

        let preds: SmallVec<[Block; 4]> = cfg.preds(block).iter().copied().collect();
        let mask = match preds[..] {
            [] => true_,
            [pred] => self.request_edge_mask(st, cfg, pred, block),
            _ => {
                // NOTE the phi is cached before requesting any edge masks, as
                // those may (through loop backedges) depend on this very mask.
                let phi = st.func.append_phi(block, st.cx.bool_type(), []);
                let phi_mask = Value::InstOutput(phi);
                st.vinfo.set_shape(phi_mask, VectorShape::varying());
                self.set_block_mask(st, block, phi_mask);

                for pred in preds {
                    let edge_mask = self.request_edge_mask(st, cfg, pred, block);
                    st.func.set_phi_incoming(phi, pred, edge_mask);
                }
                log::trace!(target: "wfv::mask", "mask({block}) = {phi}");
                return phi_mask;
            }
        };
        self.set_block_mask(st, block, mask);
        mask
    }

    pub fn request_edge_mask(
        &mut self,
        st: &mut StageCx<'_>,
        cfg: &ControlFlowGraph,
        pred: Block,
        succ: Block,
    ) -> Value {
        if let Some(mask) = self.edge_mask(pred, succ) {
            return mask;
        }

        let pred_mask = self.request_block_mask(st, cfg, pred);
        let terminator = &st.func.blocks[pred].terminator;
        let mask = match terminator.cond() {
            Some(cond) => {
                let on_true = terminator.targets[0] == succ;
                let shape = if st.vinfo.is_uniform(pred_mask) && st.vinfo.is_uniform(cond) {
                    VectorShape::uni()
                } else {
                    VectorShape::varying()
                };

                let mut b = FuncBuilder::at_end(st.cx, st.func, pred);
                let edge_cond = if on_true { cond } else { b.not(cond) };
                let mask = b.and(pred_mask, edge_cond);
                for v in [edge_cond, mask] {
                    if v.as_inst().is_some() && ![cond, pred_mask].contains(&v) {
                        st.vinfo.set_shape(v, shape);
                    }
                }
                mask
            }
            None => pred_mask,
        };
        self.edge_masks.insert((pred, succ), mask);
        mask
    }

    /// Materialize the masks of every (reachable) block in the region, and of
    /// every edge leaving those blocks, so that later CFG rewrites don't need
    /// to recompute anything.
    pub fn expand_region_masks(&mut self, st: &mut StageCx<'_>, cfg: &ControlFlowGraph) {
        for &block in cfg.rev_post_order() {
            if !st.vinfo.in_region(block) {
                continue;
            }
            self.request_block_mask(st, cfg, block);
            for &succ in cfg.succs(block) {
                self.request_edge_mask(st, cfg, block, succ);
            }
        }
        log::debug!(
            target: "wfv::mask",
            "expanded {} edge masks in region of {}",
            self.edge_masks.len(),
            st.vinfo.entry(st.func)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{Evaluator, Scalar};
    use crate::test_util::{FuncSketch, lanes_of_bools};

    /// `entry: br_if p0, then, else; then: br join; else: br join; join: ret`
    fn diamond() -> (FuncSketch, [Block; 3]) {
        let mut s = FuncSketch::new(1);
        let blocks @ [then_, else_, join] = s.blocks(["then", "else", "join"]);
        s.br_if(s.entry(), Value::Param(0), then_, else_);
        s.br(then_, join);
        s.br(else_, join);
        s.ret(join);
        (s, blocks)
    }

    #[test]
    fn entry_and_non_divergent_blocks_are_true() {
        let (mut s, [then_, _, join]) = diamond();
        let true_ = Value::Const(s.cx.const_bool(true));
        let entry = s.entry();
        s.vinfo.set_divergent(join, false);

        let cfg = ControlFlowGraph::compute(&s.func);
        let mut mask_ex = MaskExpander::new();
        let mut st = s.stage_cx();
        assert_eq!(mask_ex.request_block_mask(&mut st, &cfg, entry), true_);
        assert_eq!(mask_ex.request_block_mask(&mut st, &cfg, join), true_);

        // `then` has a single predecessor, so its mask is just the edge mask
        // (i.e. the branch condition, as `entry`'s mask is `true`).
        assert_eq!(mask_ex.request_block_mask(&mut st, &cfg, then_), Value::Param(0));
        assert_eq!(st.vinfo.predicate(then_), Some(Value::Param(0)));
    }

    #[test]
    fn masks_are_memoized() {
        let (mut s, [_, else_, join]) = diamond();
        let cfg = ControlFlowGraph::compute(&s.func);
        let mut mask_ex = MaskExpander::new();
        let mut st = s.stage_cx();

        let first = mask_ex.request_block_mask(&mut st, &cfg, join);
        let num_insts = st.func.insts.len();
        assert_eq!(mask_ex.request_block_mask(&mut st, &cfg, join), first);
        let edge_mask = mask_ex.request_edge_mask(&mut st, &cfg, else_, join);
        assert_eq!(mask_ex.edge_mask(else_, join), Some(edge_mask));
        assert_eq!(st.func.insts.len(), num_insts);
    }

    #[test]
    fn diamond_masks_match_control_flow() {
        let (mut s, blocks) = diamond();
        let cfg = ControlFlowGraph::compute(&s.func);
        let mut mask_ex = MaskExpander::new();
        mask_ex.expand_region_masks(&mut s.stage_cx(), &cfg);

        // Each block's mask must be `true` exactly when the (scalar) execution
        // with the same input reaches that block.
        for cond in [false, true] {
            let run = Evaluator::new(&s.cx, &s.func, 1).run(&[lanes_of_bools([cond])]).unwrap();
            for block in blocks {
                let reached = run.trace.contains(&block);
                let mask = run.value(mask_ex.block_mask(block).unwrap());
                assert_eq!(mask[0], Scalar::Bool(reached), "{block} with p0={cond}");
            }
        }
    }
}
