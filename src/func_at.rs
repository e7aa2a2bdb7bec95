//! Traversal helpers for intra-function entities.
//!
//! [`FuncAt<P>`]/[`FuncAtMut<P>`] are like `(&FuncDefBody, P)`/`(&mut FuncDefBody, P`)
//! (where `P` is some type describing a "position" in the function), except:
//! * they only borrow the [`EntityDefs`] fields of [`FuncDefBody`]
//!   * this can prevent borrow conflicts, especially when mutating other fields
//!   * it also avoids accidentally accessing parts of the function definition
//!     without going through `P` (as [`EntityDefs`] requires keys for any access)
//! * they're dedicated types with inherent methods and trait `impl`s
//!
//! [`FuncDefBody`] itself also gets its structural editing methods here
//! (instruction insertion/removal and phi bookkeeping), which keep the
//! [`InstDef::block`] back-references and the phis-first invariant intact.

// NOTE wrong wrt lifetimes (https://github.com/rust-lang/rust-clippy/issues/5004).
#![allow(clippy::should_implement_trait)]

use crate::{
    Block, BlockDef, Context, ControlInst, EntityDefs, FuncDefBody, Inst, InstDef, InstKind,
    InternedStr, Type, TypeKind, Value,
};
use smallvec::SmallVec;

/// Immutable traversal (i.e. visiting) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper
/// (e.g. a `&[Inst]` slice of a block's instructions).
#[derive(Copy, Clone)]
pub struct FuncAt<'a, P: Copy> {
    pub blocks: &'a EntityDefs<Block>,
    pub insts: &'a EntityDefs<Inst>,
    pub params: &'a [Type],

    pub position: P,
}

impl<'a, P: Copy> FuncAt<'a, P> {
    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAt<'a, P2> {
        FuncAt {
            blocks: self.blocks,
            insts: self.insts,
            params: self.params,
            position: new_position,
        }
    }
}

impl<'a> FuncAt<'a, Block> {
    pub fn def(self) -> &'a BlockDef {
        &self.blocks[self.position]
    }

    pub fn at_insts(self) -> FuncAt<'a, &'a [Inst]> {
        self.at(&self.def().insts[..])
    }

    /// The leading phi instructions of this block.
    pub fn at_phis(self) -> FuncAt<'a, &'a [Inst]> {
        let insts = &self.def().insts[..];
        let num_phis =
            insts.iter().take_while(|&&inst| self.insts[inst].kind.is_phi()).count();
        self.at(&insts[..num_phis])
    }

    pub fn successors(self) -> &'a [Block] {
        &self.def().terminator.targets
    }
}

impl<'a> Iterator for FuncAt<'a, &'a [Inst]> {
    type Item = FuncAt<'a, Inst>;
    fn next(&mut self) -> Option<Self::Item> {
        let (&next, rest) = self.position.split_first()?;
        self.position = rest;
        Some(self.at(next))
    }
}

impl<'a> DoubleEndedIterator for FuncAt<'a, &'a [Inst]> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let (&prev, rest) = self.position.split_last()?;
        self.position = rest;
        Some(self.at(prev))
    }
}

impl<'a> FuncAt<'a, Inst> {
    pub fn def(self) -> &'a InstDef {
        &self.insts[self.position]
    }

    /// For a phi, the `(predecessor, value)` pairs, in operand order.
    pub fn phi_incoming(self) -> impl Iterator<Item = (Block, Value)> + 'a {
        let def = self.def();
        let incoming: &[Block] = match &def.kind {
            InstKind::Phi { incoming } => incoming,
            _ => &[],
        };
        incoming.iter().copied().zip(def.inputs.iter().copied())
    }
}

impl FuncAt<'_, Value> {
    /// Return the [`Type`] of this [`Value`] ([`Context`] used for [`Value::Const`]).
    pub fn type_of(self, cx: &Context) -> Type {
        match self.position {
            Value::Const(ct) => cx[ct].ty,
            Value::Param(idx) => self.params[idx as usize],
            Value::InstOutput(inst) => self.insts[inst].output_type,
        }
    }
}

/// Mutable traversal (i.e. transforming) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper.
pub struct FuncAtMut<'a, P: Copy> {
    pub blocks: &'a mut EntityDefs<Block>,
    pub insts: &'a mut EntityDefs<Inst>,

    pub position: P,
}

impl<'a, P: Copy> FuncAtMut<'a, P> {
    /// Emulate a "reborrow", which is automatic only for `&mut` types.
    pub fn reborrow(&mut self) -> FuncAtMut<'_, P> {
        FuncAtMut { blocks: self.blocks, insts: self.insts, position: self.position }
    }

    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAtMut<'a, P2> {
        FuncAtMut { blocks: self.blocks, insts: self.insts, position: new_position }
    }
}

impl<'a> FuncAtMut<'a, Block> {
    pub fn def(self) -> &'a mut BlockDef {
        &mut self.blocks[self.position]
    }

    pub fn terminator(self) -> &'a mut ControlInst {
        &mut self.def().terminator
    }
}

impl<'a> FuncAtMut<'a, Inst> {
    pub fn def(self) -> &'a mut InstDef {
        &mut self.insts[self.position]
    }
}

impl FuncDefBody {
    /// Create an empty function body, with only an `entry` block (which ends
    /// in `unreachable` until a terminator is set).
    pub fn new(cx: &Context, params: impl IntoIterator<Item = Type>, ret_type: Type) -> Self {
        let mut blocks = EntityDefs::new();
        let entry = blocks.define(BlockDef {
            name: Some(cx.intern("entry")),
            insts: vec![],
            terminator: ControlInst::unreachable(),
        });
        Self {
            params: params.into_iter().collect(),
            ret_type,
            blocks,
            insts: EntityDefs::new(),
            entry,
            layout: vec![entry],
        }
    }

    pub fn at(&self, block: Block) -> FuncAt<'_, Block> {
        FuncAt { blocks: &self.blocks, insts: &self.insts, params: &self.params, position: block }
    }

    pub fn at_inst(&self, inst: Inst) -> FuncAt<'_, Inst> {
        self.at(self.entry).at(inst)
    }

    pub fn at_value(&self, v: Value) -> FuncAt<'_, Value> {
        self.at(self.entry).at(v)
    }

    pub fn at_mut(&mut self, block: Block) -> FuncAtMut<'_, Block> {
        FuncAtMut { blocks: &mut self.blocks, insts: &mut self.insts, position: block }
    }

    pub fn type_of(&self, cx: &Context, v: Value) -> Type {
        self.at_value(v).type_of(cx)
    }

    /// Append a new block to the function (ending in `unreachable`).
    pub fn add_block(&mut self, name: Option<InternedStr>) -> Block {
        let block = self.blocks.define(BlockDef {
            name,
            insts: vec![],
            terminator: ControlInst::unreachable(),
        });
        self.layout.push(block);
        block
    }

    /// Index of the first non-phi instruction in `block`.
    pub fn first_non_phi(&self, block: Block) -> usize {
        self.at(block).at_phis().position.len()
    }

    pub fn phis(&self, block: Block) -> SmallVec<[Inst; 4]> {
        self.at(block).at_phis().position.iter().copied().collect()
    }

    /// Position of `inst` in its block's instruction list, if still attached.
    pub fn position_of(&self, inst: Inst) -> Option<usize> {
        let block = self.insts[inst].block;
        self.blocks[block].insts.iter().position(|&i| i == inst)
    }

    /// Define `def` and attach it to `block` at position `idx`.
    pub fn insert_inst(&mut self, block: Block, idx: usize, mut def: InstDef) -> Inst {
        def.block = block;
        let inst = self.insts.define(def);
        self.blocks[block].insts.insert(idx, inst);
        inst
    }

    /// Define `def` and attach it right before `block`'s terminator.
    pub fn append_inst(&mut self, block: Block, def: InstDef) -> Inst {
        let idx = self.blocks[block].insts.len();
        self.insert_inst(block, idx, def)
    }

    /// Define a phi and attach it after the existing phis of `block`.
    pub fn append_phi(
        &mut self,
        block: Block,
        ty: Type,
        incoming: impl IntoIterator<Item = (Block, Value)>,
    ) -> Inst {
        let (incoming, inputs) = incoming.into_iter().unzip();
        let idx = self.first_non_phi(block);
        self.insert_inst(
            block,
            idx,
            InstDef { kind: InstKind::Phi { incoming }, inputs, output_type: ty, mask: None, block },
        )
    }

    /// Detach `inst` from its block (its definition, and any remaining uses,
    /// are left in place, removing only makes sense once it's unused).
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.insts[inst].block;
        self.blocks[block].insts.retain(|&i| i != inst);
    }

    /// Index of `pred` in the phi's incoming blocks.
    pub fn phi_incoming_idx(&self, phi: Inst, pred: Block) -> Option<usize> {
        match &self.insts[phi].kind {
            InstKind::Phi { incoming } => incoming.iter().position(|&b| b == pred),
            _ => None,
        }
    }

    pub fn phi_incoming_value(&self, phi: Inst, pred: Block) -> Option<Value> {
        self.phi_incoming_idx(phi, pred).map(|idx| self.insts[phi].inputs[idx])
    }

    pub fn set_phi_incoming(&mut self, phi: Inst, pred: Block, v: Value) {
        let def = &mut self.insts[phi];
        let InstKind::Phi { incoming } = &mut def.kind else {
            unreachable!("`set_phi_incoming` on non-phi {phi}");
        };
        match incoming.iter().position(|&b| b == pred) {
            Some(idx) => def.inputs[idx] = v,
            None => {
                incoming.push(pred);
                def.inputs.push(v);
            }
        }
    }

    /// Remove the incoming entries of `phi` for which `remove(pred)` is `true`,
    /// returning the removed `(pred, value)` pairs.
    pub fn remove_phi_incoming(
        &mut self,
        phi: Inst,
        mut remove: impl FnMut(Block) -> bool,
    ) -> SmallVec<[(Block, Value); 4]> {
        let def = &mut self.insts[phi];
        let InstKind::Phi { incoming } = &mut def.kind else {
            return SmallVec::new();
        };
        let mut removed = SmallVec::new();
        let mut i = 0;
        while i < incoming.len() {
            if remove(incoming[i]) {
                removed.push((incoming.remove(i), def.inputs.remove(i)));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Rename `old_pred` to `new_pred` in the phis of `block` (used when the
    /// edge `old_pred -> block` is rerouted to leave from `new_pred` instead).
    pub fn replace_phi_pred(&mut self, block: Block, old_pred: Block, new_pred: Block) {
        for phi in self.phis(block) {
            if let InstKind::Phi { incoming } = &mut self.insts[phi].kind {
                for pred in incoming.iter_mut().filter(|pred| **pred == old_pred) {
                    *pred = new_pred;
                }
            }
        }
    }

    pub fn is_bool(&self, cx: &Context, v: Value) -> bool {
        cx[self.type_of(cx, v)].kind == TypeKind::Bool
    }
}

#[cfg(test)]
mod tests {
    use crate::CmpOp;
    use crate::test_util::counted_loop_sketch;

    #[test]
    fn insts_iterate_from_both_ends() {
        let s = counted_loop_sketch(CmpOp::SLt, true, true, 1);
        let header = s.func.blocks[s.entry()].terminator.targets[0];

        let phis: Vec<_> = s.func.at(header).at_phis().map(|at| at.position).collect();
        assert_eq!(phis.len(), 1);
        assert_eq!(s.func.first_non_phi(header), 1);

        let forward: Vec<_> = s.func.at(header).at_insts().map(|at| at.position).collect();
        let mut backward: Vec<_> =
            s.func.at(header).at_insts().rev().map(|at| at.position).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.first(), phis.first());
        assert_eq!(forward.len(), 2);
    }
}
