//! Helpers for building small functions in tests.

use crate::builder::FuncBuilder;
use crate::eval::{Lanes, Scalar};
use crate::wfv::{IntrinsicRegistry, StageCx, VectorizationInfo};
use crate::{
    BinOp, Block, CmpOp, Context, ControlInst, DeclDef, Func, FuncDecl, FuncDefBody, Module, Type,
    Value,
};
use std::rc::Rc;

/// A [`Module`] (with its own [`Context`]) to declare functions in.
pub struct TestModule {
    pub cx: Rc<Context>,
    pub module: Module,
}

impl TestModule {
    pub fn new() -> Self {
        let cx = Rc::new(Context::new());
        Self { module: Module::new(cx.clone()), cx }
    }

    /// Declare an imported function.
    pub fn declare(&mut self, name: &str, ret_type: Type, params: impl IntoIterator<Item = Type>) -> Func {
        self.module.funcs.define(FuncDecl {
            name: self.cx.intern(name),
            ret_type,
            params: params.into_iter().collect(),
            def: DeclDef::Imported,
        })
    }
}

/// A function under construction, together with everything the vectorizer
/// stages need to run on it (vector width `4`, whole-function region, and no
/// shapes, i.e. everything varying, unless a test changes that).
pub struct FuncSketch {
    pub cx: Rc<Context>,
    pub module: Module,
    pub intrinsics: IntrinsicRegistry,
    pub func: FuncDefBody,
    pub vinfo: VectorizationInfo,
}

impl FuncSketch {
    /// `fn(bool, ...) -> void`, with `num_bool_params` parameters.
    pub fn new(num_bool_params: usize) -> Self {
        Self::with_params(
            |cx| (0..num_bool_params).map(|_| cx.bool_type()).collect::<Vec<_>>(),
            |cx| cx.void_type(),
        )
    }

    pub fn with_params<P: IntoIterator<Item = Type>>(
        params: impl FnOnce(&Context) -> P,
        ret_type: impl FnOnce(&Context) -> Type,
    ) -> Self {
        let TestModule { cx, mut module } = TestModule::new();
        let intrinsics = IntrinsicRegistry::new(&mut module);
        let func = FuncDefBody::new(&cx, params(&*cx), ret_type(&*cx));
        Self { cx, module, intrinsics, func, vinfo: VectorizationInfo::new(4, None) }
    }

    pub fn entry(&self) -> Block {
        self.func.entry
    }

    /// Add one (named, initially `unreachable`) block per name.
    pub fn blocks<const N: usize>(&mut self, names: [&str; N]) -> [Block; N] {
        names.map(|name| self.func.add_block(Some(self.cx.intern(name))))
    }

    pub fn br(&mut self, from: Block, to: Block) {
        self.func.blocks[from].terminator = ControlInst::branch(to);
    }

    pub fn br_if(&mut self, from: Block, cond: Value, then_target: Block, else_target: Block) {
        self.func.blocks[from].terminator = ControlInst::cond_branch(cond, then_target, else_target);
    }

    pub fn ret(&mut self, block: Block) {
        self.func.blocks[block].terminator = ControlInst::ret(None);
    }

    pub fn ret_value(&mut self, block: Block, v: Value) {
        self.func.blocks[block].terminator = ControlInst::ret(Some(v));
    }

    /// Builder appending to the end of `block`.
    pub fn builder(&mut self, block: Block) -> FuncBuilder<'_> {
        FuncBuilder::at_end(&self.cx, &mut self.func, block)
    }

    pub fn stage_cx(&mut self) -> StageCx<'_> {
        StageCx {
            cx: &self.cx,
            func: &mut self.func,
            vinfo: &mut self.vinfo,
            intrinsics: &self.intrinsics,
        }
    }

    /// Declare an imported function in the sketch's module.
    pub fn declare(&mut self, name: &str, ret_type: Type, params: impl IntoIterator<Item = Type>) -> Func {
        self.module.funcs.define(FuncDecl {
            name: self.cx.intern(name),
            ret_type,
            params: params.into_iter().collect(),
            def: DeclDef::Imported,
        })
    }
}

/// `fn(n: i32)`, looping with `i = phi [0, i + step]` while the exit test
/// (`i op n`, or `n op i` if `!iv_on_left`) says so:
/// ```text
/// entry:  br header
/// header: i = phi [entry: 0, body: i']
///         c = cmp op ...
///         br_if c, body, exit   (or `exit, body` if `!stay_on_true`)
/// body:   i' = i + step
///         br header
/// exit:   ret
/// ```
pub fn counted_loop_sketch(op: CmpOp, iv_on_left: bool, stay_on_true: bool, step: i64) -> FuncSketch {
    let mut s = FuncSketch::with_params(|cx| [cx.int_type(32)], |cx| cx.void_type());
    let [header, body, exit] = s.blocks(["header", "body", "exit"]);
    let entry = s.entry();
    s.br(entry, header);

    let i32_ty = s.cx.int_type(32);
    let zero = Value::Const(s.cx.const_int(i32_ty, 0));
    let step = Value::Const(s.cx.const_int(i32_ty, step));
    let i = s.func.append_phi(header, i32_ty, [(entry, zero)]);
    let (iv, n) = (Value::InstOutput(i), Value::Param(0));

    let mut b = s.builder(header);
    let c = if iv_on_left { b.cmp(op, iv, n) } else { b.cmp(op, n, iv) };
    if stay_on_true {
        b.cond_br(c, body, exit);
    } else {
        b.cond_br(c, exit, body);
    }

    let mut b = s.builder(body);
    let next = b.binary(BinOp::Add, iv, step);
    b.br(header);
    s.func.set_phi_incoming(i, body, next);

    s.ret(exit);
    s
}

pub fn lanes_of_bools(lanes: impl IntoIterator<Item = bool>) -> Lanes {
    lanes.into_iter().map(Scalar::Bool).collect()
}

pub fn lanes_of_ints(lanes: impl IntoIterator<Item = i64>) -> Lanes {
    lanes.into_iter().map(Scalar::Int).collect()
}

pub fn lanes_of_floats(lanes: impl IntoIterator<Item = f64>) -> Lanes {
    lanes.into_iter().map(Scalar::Float).collect()
}
