//! Marker functions (`rv_any`, `rv_all`, ...) that source code can call to
//! observe or influence vectorization, and their scalar lowering.

use crate::builder::{FuncBuilder, InsertPoint};
use crate::wfv::VectorShape;
use crate::{
    CastOp, Context, DeclDef, Func, FuncDecl, FuncDefBody, FxIndexMap, InstKind, Module, Type,
    Value,
};
use smallvec::{SmallVec, smallvec};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IntrinsicKind {
    /// `rv_any(pred)`: whether `pred` holds in any lane.
    Any,

    /// `rv_all(pred)`: whether `pred` holds in every lane.
    All,

    /// `rv_extract(v, lane)`: the value of `v` in lane `lane`.
    Extract,

    /// `rv_ballot(pred, _)`: bitmask of the lanes in which `pred` holds.
    Ballot,

    /// `rv_align(v, align)`: `v`, with a promise about its alignment.
    Align,
}

impl IntrinsicKind {
    pub const ALL: [Self; 5] = [Self::Any, Self::All, Self::Extract, Self::Ballot, Self::Align];

    pub fn name(self) -> &'static str {
        match self {
            Self::Any => "rv_any",
            Self::All => "rv_all",
            Self::Extract => "rv_extract",
            Self::Ballot => "rv_ballot",
            Self::Align => "rv_align",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn result_shape(self) -> VectorShape {
        match self {
            Self::Any | Self::All | Self::Extract | Self::Ballot => VectorShape::uni(),
            Self::Align => VectorShape::undef(),
        }
    }

    pub fn arg_shapes(self) -> SmallVec<[VectorShape; 2]> {
        match self {
            Self::Any | Self::All => smallvec![VectorShape::varying()],
            Self::Extract => smallvec![VectorShape::varying(), VectorShape::uni()],
            Self::Ballot => smallvec![VectorShape::varying(), VectorShape::varying()],
            Self::Align => smallvec![VectorShape::undef(), VectorShape::uni()],
        }
    }

    pub fn arity(self) -> usize {
        self.arg_shapes().len()
    }

    /// Declared signature, for modules that don't already declare it
    /// (calls may still use other types for the overloaded operands).
    fn signature(self, cx: &Context) -> (Type, SmallVec<[Type; 2]>) {
        let bool_ty = cx.bool_type();
        let i32_ty = cx.int_type(32);
        match self {
            Self::Any | Self::All => (bool_ty, smallvec![bool_ty]),
            Self::Extract | Self::Align => (i32_ty, smallvec![i32_ty, i32_ty]),
            Self::Ballot => (i32_ty, smallvec![bool_ty, bool_ty]),
        }
    }
}

/// Mapping between the intrinsic marker functions of a [`Module`] and their
/// [`IntrinsicKind`]s, built once (declaring any missing markers).
#[derive(Clone)]
pub struct IntrinsicRegistry {
    kinds: FxIndexMap<Func, IntrinsicKind>,
    funcs: FxIndexMap<IntrinsicKind, Func>,
}

impl IntrinsicRegistry {
    pub fn new(module: &mut Module) -> Self {
        let cx = module.cx();
        let mut registry = Self { kinds: FxIndexMap::default(), funcs: FxIndexMap::default() };

        for func in module.funcs.keys() {
            if let Some(kind) = IntrinsicKind::from_name(&cx[module.funcs[func].name]) {
                registry.funcs.entry(kind).or_insert(func);
                registry.kinds.insert(func, kind);
            }
        }
        for kind in IntrinsicKind::ALL {
            if registry.funcs.contains_key(&kind) {
                continue;
            }
            let (ret_type, params) = kind.signature(&cx);
            let func = module.funcs.define(FuncDecl {
                name: cx.intern(kind.name()),
                ret_type,
                params,
                def: DeclDef::Imported,
            });
            log::debug!(target: "wfv::intrinsics", "declared missing `{}` as {func}", kind.name());
            registry.funcs.insert(kind, func);
            registry.kinds.insert(func, kind);
        }
        registry
    }

    pub fn kind_of(&self, func: Func) -> Option<IntrinsicKind> {
        self.kinds.get(&func).copied()
    }

    pub fn func(&self, kind: IntrinsicKind) -> Func {
        self.funcs[&kind]
    }

    /// The intrinsic called by `v`'s defining instruction, if any.
    pub fn called_by(&self, func: &FuncDefBody, v: Value) -> Option<IntrinsicKind> {
        match func.insts[v.as_inst()?].kind {
            InstKind::Call(callee) => self.kind_of(callee),
            _ => None,
        }
    }

    /// Replace every remaining intrinsic call in `func` with its scalar
    /// equivalent (the first operand, or its zero-extension for ballots),
    /// returning the number of calls lowered.
    pub fn lower_intrinsics(&self, cx: &Context, func: &mut FuncDefBody) -> usize {
        let calls: Vec<_> = func
            .layout
            .iter()
            .flat_map(|&block| func.blocks[block].insts.iter().copied())
            .filter_map(|inst| match func.insts[inst].kind {
                InstKind::Call(callee) => Some((inst, self.kind_of(callee)?)),
                _ => None,
            })
            .collect();

        for &(call, kind) in &calls {
            let operand = func.insts[call].inputs[0];
            let replacement = match kind {
                IntrinsicKind::Any
                | IntrinsicKind::All
                | IntrinsicKind::Extract
                | IntrinsicKind::Align => operand,
                IntrinsicKind::Ballot => {
                    let mut builder = FuncBuilder::new(cx, func, InsertPoint::Before(call));
                    let i32_ty = cx.int_type(32);
                    builder.cast(CastOp::ZExt, operand, i32_ty)
                }
            };
            func.replace_all_uses(Value::InstOutput(call), replacement);
            func.remove_inst(call);
        }
        calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestModule;

    #[test]
    fn registry_declares_missing_markers_once() {
        let mut t = TestModule::new();
        let any = t.declare("rv_any", t.cx.bool_type(), [t.cx.bool_type()]);

        let registry = IntrinsicRegistry::new(&mut t.module);
        assert_eq!(registry.func(IntrinsicKind::Any), any);
        for kind in IntrinsicKind::ALL {
            let func = registry.func(kind);
            assert_eq!(registry.kind_of(func), Some(kind));
            assert_eq!(&t.cx[t.module.funcs[func].name], kind.name());
        }

        // Building a second registry finds everything already declared.
        let num_funcs = t.module.funcs.len();
        let again = IntrinsicRegistry::new(&mut t.module);
        assert_eq!(t.module.funcs.len(), num_funcs);
        assert_eq!(again.func(IntrinsicKind::Ballot), registry.func(IntrinsicKind::Ballot));
    }

    #[test]
    fn intrinsic_arities_and_shapes() {
        assert_eq!(IntrinsicKind::Any.arity(), 1);
        assert_eq!(IntrinsicKind::Extract.arity(), 2);
        assert!(IntrinsicKind::All.result_shape().is_uniform());
        assert!(!IntrinsicKind::Align.result_shape().is_defined());
        assert_eq!(IntrinsicKind::from_name("rv_ballot"), Some(IntrinsicKind::Ballot));
        assert_eq!(IntrinsicKind::from_name("rv_none"), None);
    }

    #[test]
    fn lowering_replaces_calls() {
        let mut t = TestModule::new();
        let registry = IntrinsicRegistry::new(&mut t.module);
        let cx = t.cx.clone();
        let bool_ty = cx.bool_type();
        let i32_ty = cx.int_type(32);

        let mut func = FuncDefBody::new(&cx, [bool_ty], i32_ty);
        let entry = func.entry;
        let mut b = FuncBuilder::at_end(&cx, &mut func, entry);
        let p = Value::Param(0);
        let any = b.call(registry.func(IntrinsicKind::Any), bool_ty, [p]);
        let false_ = b.const_bool(false);
        let ballot =
            b.call(registry.func(IntrinsicKind::Ballot), i32_ty, [Value::InstOutput(any), false_]);
        b.ret(Some(Value::InstOutput(ballot)));

        assert_eq!(registry.lower_intrinsics(&cx, &mut func), 2);
        let insts = &func.blocks[entry].insts;
        assert_eq!(insts.len(), 1);
        let zext = &func.insts[insts[0]];
        assert_eq!(zext.kind, InstKind::Cast(CastOp::ZExt));
        assert_eq!(zext.inputs[..], [p]);
        assert_eq!(func.blocks[entry].terminator.inputs[..], [Value::InstOutput(insts[0])]);
    }
}
