//! Cursor-based construction of [`Inst`]s and [`Block`]s in a [`FuncDefBody`].

use crate::{
    BinOp, Block, CastOp, CmpOp, ConstKind, Context, ControlInst, Func, FuncDefBody, Inst,
    InstDef, InstKind, Type, Value,
};

/// Where the next non-phi instruction built by a [`FuncBuilder`] goes.
#[derive(Copy, Clone, Debug)]
pub enum InsertPoint {
    /// At the end of the block (i.e. right before its terminator).
    BlockEnd(Block),

    /// After the phis of the block (and after anything previously inserted).
    AfterPhis(Block),

    /// Right before an instruction (successive insertions stay in order).
    Before(Inst),

    /// Right after an instruction (successive insertions stay in order).
    After(Inst),
}

pub struct FuncBuilder<'a> {
    pub cx: &'a Context,
    pub func: &'a mut FuncDefBody,
    at: InsertPoint,
}

impl<'a> FuncBuilder<'a> {
    pub fn new(cx: &'a Context, func: &'a mut FuncDefBody, at: InsertPoint) -> Self {
        Self { cx, func, at }
    }

    pub fn at_end(cx: &'a Context, func: &'a mut FuncDefBody, block: Block) -> Self {
        Self::new(cx, func, InsertPoint::BlockEnd(block))
    }

    pub fn position(&mut self, at: InsertPoint) {
        self.at = at;
    }

    pub fn insert_point(&self) -> InsertPoint {
        self.at
    }

    /// The block instructions are currently being inserted into.
    pub fn current_block(&self) -> Block {
        match self.at {
            InsertPoint::BlockEnd(block) | InsertPoint::AfterPhis(block) => block,
            InsertPoint::Before(inst) | InsertPoint::After(inst) => self.func.insts[inst].block,
        }
    }

    pub fn add_block(&mut self, name: &str) -> Block {
        self.func.add_block(Some(self.cx.intern(name)))
    }

    /// Insert an arbitrary (non-phi) instruction at the insertion point.
    pub fn insert(&mut self, def: InstDef) -> Inst {
        debug_assert!(!def.kind.is_phi(), "phis must be built with `FuncBuilder::phi`");
        match self.at {
            InsertPoint::BlockEnd(block) => self.func.append_inst(block, def),
            InsertPoint::AfterPhis(block) => {
                let idx = self.func.first_non_phi(block);
                let inst = self.func.insert_inst(block, idx, def);
                self.at = InsertPoint::After(inst);
                inst
            }
            InsertPoint::Before(before) => {
                let block = self.func.insts[before].block;
                let idx =
                    self.func.position_of(before).unwrap_or(self.func.blocks[block].insts.len());
                self.func.insert_inst(block, idx, def)
            }
            InsertPoint::After(after) => {
                let block = self.func.insts[after].block;
                let idx = self.func.position_of(after).map_or(0, |idx| idx + 1);
                let inst = self.func.insert_inst(block, idx, def);
                self.at = InsertPoint::After(inst);
                inst
            }
        }
    }

    pub fn inst(
        &mut self,
        kind: InstKind,
        inputs: impl IntoIterator<Item = Value>,
        output_type: Type,
    ) -> Value {
        Value::InstOutput(self.inst_without_output(kind, inputs, output_type))
    }

    /// Like [`FuncBuilder::inst`], but returning the [`Inst`] itself (for e.g.
    /// stores, which have no meaningful output value).
    pub fn inst_without_output(
        &mut self,
        kind: InstKind,
        inputs: impl IntoIterator<Item = Value>,
        output_type: Type,
    ) -> Inst {
        let block = self.current_block();
        self.insert(InstDef {
            kind,
            inputs: inputs.into_iter().collect(),
            output_type,
            mask: None,
            block,
        })
    }

    /// Build a phi in `block` (phis ignore the insertion point, as they must
    /// always precede all other instructions).
    pub fn phi(
        &mut self,
        block: Block,
        ty: Type,
        incoming: impl IntoIterator<Item = (Block, Value)>,
    ) -> Value {
        Value::InstOutput(self.func.append_phi(block, ty, incoming))
    }

    pub fn type_of(&self, v: Value) -> Type {
        self.func.type_of(self.cx, v)
    }

    pub fn binary(&mut self, op: BinOp, a: Value, b: Value) -> Value {
        let ty = self.type_of(a);
        self.inst(InstKind::Binary(op), [a, b], ty)
    }

    pub fn cmp(&mut self, op: CmpOp, a: Value, b: Value) -> Value {
        let bool_ty = self.cx.bool_type();
        self.inst(InstKind::Cmp(op), [a, b], bool_ty)
    }

    /// Boolean `a & b`, folding `true` operands away.
    pub fn and(&mut self, a: Value, b: Value) -> Value {
        match (self.bool_const(a), self.bool_const(b)) {
            (Some(true), _) => b,
            (_, Some(true)) => a,
            _ => self.binary(BinOp::And, a, b),
        }
    }

    /// Boolean `a | b`, folding `false` operands away.
    pub fn or(&mut self, a: Value, b: Value) -> Value {
        match (self.bool_const(a), self.bool_const(b)) {
            (Some(false), _) => b,
            (_, Some(false)) => a,
            _ => self.binary(BinOp::Or, a, b),
        }
    }

    /// Boolean `!a`, folding constants.
    pub fn not(&mut self, a: Value) -> Value {
        match self.bool_const(a) {
            Some(b) => self.const_bool(!b),
            None => {
                let true_ = self.const_bool(true);
                self.binary(BinOp::Xor, a, true_)
            }
        }
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        if if_true == if_false {
            return if_true;
        }
        let ty = self.type_of(if_true);
        self.inst(InstKind::Select, [cond, if_true, if_false], ty)
    }

    pub fn cast(&mut self, op: CastOp, v: Value, ty: Type) -> Value {
        self.inst(InstKind::Cast(op), [v], ty)
    }

    pub fn ptr_offset(&mut self, base: Value, offset: Value) -> Value {
        let ty = self.type_of(base);
        self.inst(InstKind::PtrOffset, [base, offset], ty)
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        self.inst(InstKind::Load, [ptr], ty)
    }

    pub fn store(&mut self, ptr: Value, v: Value) -> Inst {
        let void = self.cx.void_type();
        self.inst_without_output(InstKind::Store, [ptr, v], void)
    }

    pub fn call(
        &mut self,
        callee: Func,
        ret_type: Type,
        args: impl IntoIterator<Item = Value>,
    ) -> Inst {
        self.inst_without_output(InstKind::Call(callee), args, ret_type)
    }

    pub fn const_bool(&self, b: bool) -> Value {
        self.cx.const_bool(b).into()
    }

    pub fn const_int(&self, ty: Type, x: i64) -> Value {
        self.cx.const_int(ty, x).into()
    }

    pub fn const_undef(&self, ty: Type) -> Value {
        self.cx.const_undef(ty).into()
    }

    fn bool_const(&self, v: Value) -> Option<bool> {
        let ct = v.as_const()?;
        match self.cx[ct].kind {
            ConstKind::Bool(b) => Some(b),
            _ => None,
        }
    }

    // Terminators (for the current block).

    pub fn set_terminator(&mut self, terminator: ControlInst) {
        let block = self.current_block();
        self.func.blocks[block].terminator = terminator;
    }

    pub fn br(&mut self, target: Block) {
        self.set_terminator(ControlInst::branch(target));
    }

    pub fn cond_br(&mut self, cond: Value, then_target: Block, else_target: Block) {
        self.set_terminator(ControlInst::cond_branch(cond, then_target, else_target));
    }

    pub fn ret(&mut self, v: Option<Value>) {
        self.set_terminator(ControlInst::ret(v));
    }

    /// Switch to appending at the end of `block`.
    pub fn switch_to_block(&mut self, block: Block) {
        self.at = InsertPoint::BlockEnd(block);
    }
}
