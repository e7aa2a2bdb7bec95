//! Whole-function vectorization over a small SSA control-flow-graph IR.
//!
//! Given a scalar function (or a region of one) and a per-value "shape"
//! classification (uniform, varying, strided), the [`wfv`] pipeline rewrites
//! control-flow so that all SIMD lanes can execute it in lock-step:
//! * divergent loops get a uniform exit condition and an accumulated live mask
//! * every block gets a predicate ("mask") of the lanes active in it
//! * divergent branches are replaced by predicated fall-through, with phis
//!   turned into selects and side effects guarded by masks
//!
//! #### Notable types/modules
//!
//! ##### IR data types
// HACK using `(struct.Context.html)` to link `Context`, not `context::Context`.
//! * [`Context`](struct.Context.html): handles interning ([`Type`]s, [`Const`]s, etc.)
//! * [`Module`]: owns [`Func`]s
//! * [`FuncDefBody`]: owns [`Block`]s and [`Inst`]s (rooted by [`entry`](FuncDefBody::entry))
//!
//! ##### Utilities and passes
//! * [`cf`]: CFG, dominance and loop analyses
//! * [`wfv`]: the vectorization pipeline ([`wfv::VectorizerInterface`])
//! * [`eval`]: lock-step multi-lane reference interpreter
//! * [`print`](mod@print): textual IR printing
//!
// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(
    // NOTE ignored for readability (`match` used when `if let` is too long).
    clippy::single_match_else,
    // NOTE ignored because it's misguided to suggest `let mut s = ...;`
    // and `s.push_str(...);` when `+` is equivalent and does not require `let`.
    clippy::string_add,
)]
// NOTE this is stronger than the "Embark standard lints" above, because
// we almost never need `unsafe` code and this is a further "speed bump" to it.
#![forbid(unsafe_code)]

// NOTE all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod builder;
pub mod cf;
mod context;
pub mod eval;
pub mod func_at;
pub mod print;
pub mod transform;
pub mod visit;
pub mod wfv;

#[cfg(test)]
mod test_util;

use smallvec::SmallVec;
use std::rc::Rc;

// HACK work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

// NOTE these reexports are all documented inside `context`.
pub use context::{
    Block, Const, Context, Entity, EntityDefs, EntityOrientedDenseMap, Func, Inst, InternInCx,
    InternedStr, Type,
};

// HACK this only serves to disallow modifying the `cx` field of `Module`.
#[doc(hidden)]
mod sealed {
    use super::*;

    #[derive(Clone)]
    pub struct Module {
        /// Context used for everything interned, in this module.
        ///
        /// Notable choices made for this field:
        /// * private to disallow switching the context of a module
        /// * [`Rc`] sharing to allow multiple modules to use the same context
        ///   (`Context: !Sync` because of the interners so it can't be `Arc`)
        cx: Rc<Context>,

        pub funcs: EntityDefs<Func>,
    }

    impl Module {
        pub fn new(cx: Rc<Context>) -> Self {
            Self { cx, funcs: Default::default() }
        }

        pub fn cx(&self) -> Rc<Context> {
            self.cx.clone()
        }

        pub fn cx_ref(&self) -> &Rc<Context> {
            &self.cx
        }
    }
}
pub use sealed::Module;

impl Module {
    /// Find a function by its name (first match, in definition order).
    pub fn func_by_name(&self, name: &str) -> Option<Func> {
        self.funcs.keys().find(|&func| &self.cx_ref()[self.funcs[func].name] == name)
    }

    pub fn func_body(&self, func: Func) -> Option<&FuncDefBody> {
        match &self.funcs[func].def {
            DeclDef::Imported => None,
            DeclDef::Present(body) => Some(body),
        }
    }

    pub fn func_body_mut(&mut self, func: Func) -> Option<&mut FuncDefBody> {
        match &mut self.funcs[func].def {
            DeclDef::Imported => None,
            DeclDef::Present(body) => Some(body),
        }
    }
}

/// Definition for a [`Type`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypeDef {
    pub kind: TypeKind,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeKind {
    Void,
    Bool,

    /// Integer of the given bit-width, signedness is a property of the
    /// operations (e.g. [`CmpOp::SLt`] vs [`CmpOp::ULt`]), not of the type.
    Int(u8),

    /// IEEE float of the given bit-width (only `32` and `64` are meaningful).
    Float(u8),

    /// Word-addressed pointer to a `pointee`.
    Ptr(Type),

    Vector {
        elem: Type,
        len: u32,
    },

    Struct(SmallVec<[Type; 4]>),
}

impl InternInCx for TypeKind {
    type Output = Type;

    fn intern_in_cx(self, cx: &Context) -> Type {
        cx.intern(TypeDef { kind: self })
    }
}

/// Definition for a [`Const`]: a constant value.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConstKind {
    Undef,
    Bool(bool),
    Int(i64),

    /// Bit pattern of an `f64` (`f32` constants are stored widened).
    Float(u64),
}

impl Context {
    pub fn void_type(&self) -> Type {
        self.intern(TypeKind::Void)
    }

    pub fn bool_type(&self) -> Type {
        self.intern(TypeKind::Bool)
    }

    pub fn int_type(&self, width: u8) -> Type {
        self.intern(TypeKind::Int(width))
    }

    pub fn float_type(&self, width: u8) -> Type {
        self.intern(TypeKind::Float(width))
    }

    pub fn ptr_type(&self, pointee: Type) -> Type {
        self.intern(TypeKind::Ptr(pointee))
    }

    pub fn const_bool(&self, b: bool) -> Const {
        self.intern(ConstDef { ty: self.bool_type(), kind: ConstKind::Bool(b) })
    }

    /// Integer constant, `x` is normalized (sign-extended) to `ty`'s width.
    pub fn const_int(&self, ty: Type, x: i64) -> Const {
        let x = match self[ty].kind {
            TypeKind::Int(width) => sign_extend(x, width),
            _ => x,
        };
        self.intern(ConstDef { ty, kind: ConstKind::Int(x) })
    }

    pub fn const_float(&self, ty: Type, x: f64) -> Const {
        let x = match self[ty].kind {
            TypeKind::Float(32) => f64::from(x as f32),
            _ => x,
        };
        self.intern(ConstDef { ty, kind: ConstKind::Float(x.to_bits()) })
    }

    pub fn const_undef(&self, ty: Type) -> Const {
        self.intern(ConstDef { ty, kind: ConstKind::Undef })
    }
}

/// Truncate `x` to `width` bits, then sign-extend it back to `i64`.
pub fn sign_extend(x: i64, width: u8) -> i64 {
    match width {
        1..=63 => {
            let shift = 64 - u32::from(width);
            (x << shift) >> shift
        }
        _ => x,
    }
}

/// Declarations ([`FuncDecl`]) can contain a full definition,
/// or only be an import of a definition (e.g. from another module).
#[derive(Clone)]
pub enum DeclDef<D> {
    Imported,
    Present(D),
}

#[derive(Clone)]
pub struct FuncDecl {
    pub name: InternedStr,

    pub ret_type: Type,

    pub params: SmallVec<[Type; 2]>,

    pub def: DeclDef<FuncDefBody>,
}

/// The body of a [`Func`] definition.
#[derive(Clone)]
pub struct FuncDefBody {
    pub params: SmallVec<[Type; 2]>,
    pub ret_type: Type,

    pub blocks: EntityDefs<Block>,
    pub insts: EntityDefs<Inst>,

    /// The [`Block`] control-flow starts at, when the function is called.
    pub entry: Block,

    /// All the [`Block`]s that are part of the function, in printing order
    /// (`entry` is always first, other blocks have no semantic order).
    pub layout: Vec<Block>,
}

/// Definition for a [`Block`]: a straight-line sequence of [`Inst`]s (with all
/// phis first), followed by a [`ControlInst`] terminator.
#[derive(Clone)]
pub struct BlockDef {
    pub name: Option<InternedStr>,

    pub insts: Vec<Inst>,

    pub terminator: ControlInst,
}

/// Definition for an [`Inst`]: a single operation producing at most one value.
#[derive(Clone, Debug)]
pub struct InstDef {
    pub kind: InstKind,

    pub inputs: SmallVec<[Value; 2]>,

    /// [`TypeKind::Void`] for instructions without an output (e.g. stores).
    pub output_type: Type,

    /// Lane predicate (added by linearization): when present, the instruction's
    /// side effects only happen for lanes where `mask` is `true`.
    pub mask: Option<Value>,

    /// The [`Block`] this instruction was inserted into (kept up to date by
    /// [`FuncDefBody`]'s insertion methods).
    pub block: Block,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum InstKind {
    /// `inputs[i]` is the value flowing in from predecessor `incoming[i]`.
    Phi { incoming: SmallVec<[Block; 2]> },

    Binary(BinOp),
    Cmp(CmpOp),

    /// `inputs = [cond, if_true, if_false]`.
    Select,

    Cast(CastOp),

    /// `inputs = [base, offset]`, pointer arithmetic in words.
    PtrOffset,

    /// `inputs = [ptr]`.
    Load,

    /// `inputs = [ptr, value]`.
    Store,

    Call(Func),

    // NOTE these are never produced by the vectorizer, and only
    // exist to be recognized (and left alone) by it.
    ExtractElement,
    InsertElement,
    ShuffleVector,
    ExtractValue(u32),
    InsertValue(u32),
}

impl InstKind {
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Whether the instruction can affect (or observe) state beyond its inputs
    /// and output, and therefore needs to be guarded by a lane mask.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, InstKind::Load | InstKind::Store | InstKind::Call(_))
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    SMin,
    SMax,
    UMin,
    UMax,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CmpOp {
    Eq,
    Ne,
    SLt,
    SLe,
    SGt,
    SGe,
    ULt,
    ULe,
    UGt,
    UGe,
    FLt,
    FLe,
    FGt,
    FGe,
}

impl CmpOp {
    /// The comparison that is `true` exactly when `self` is `false`.
    pub fn inverse(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::SLt => CmpOp::SGe,
            CmpOp::SLe => CmpOp::SGt,
            CmpOp::SGt => CmpOp::SLe,
            CmpOp::SGe => CmpOp::SLt,
            CmpOp::ULt => CmpOp::UGe,
            CmpOp::ULe => CmpOp::UGt,
            CmpOp::UGt => CmpOp::ULe,
            CmpOp::UGe => CmpOp::ULt,
            // NOTE only exact for non-NaN inputs.
            CmpOp::FLt => CmpOp::FGe,
            CmpOp::FLe => CmpOp::FGt,
            CmpOp::FGt => CmpOp::FLe,
            CmpOp::FGe => CmpOp::FLt,
        }
    }

    /// The comparison with the same result when its two inputs are swapped.
    pub fn swapped(self) -> Self {
        match self {
            CmpOp::Eq | CmpOp::Ne => self,
            CmpOp::SLt => CmpOp::SGt,
            CmpOp::SLe => CmpOp::SGe,
            CmpOp::SGt => CmpOp::SLt,
            CmpOp::SGe => CmpOp::SLe,
            CmpOp::ULt => CmpOp::UGt,
            CmpOp::ULe => CmpOp::UGe,
            CmpOp::UGt => CmpOp::ULt,
            CmpOp::UGe => CmpOp::ULe,
            CmpOp::FLt => CmpOp::FGt,
            CmpOp::FLe => CmpOp::FGe,
            CmpOp::FGt => CmpOp::FLt,
            CmpOp::FGe => CmpOp::FLe,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    SIToFP,
    FPToSI,
    Bitcast,
}

/// Block terminator, i.e. the "action on exit" from a [`Block`].
#[derive(Clone, Debug)]
pub struct ControlInst {
    pub kind: ControlInstKind,

    pub inputs: SmallVec<[Value; 2]>,

    pub targets: SmallVec<[Block; 2]>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ControlInstKind {
    /// Reaching this point in the control-flow is undefined behavior.
    Unreachable,

    /// Leave the current function, optionally returning `inputs[0]`.
    Return,

    /// Unconditional branch to `targets[0]`.
    Branch,

    /// Branch to `targets[0]` if `inputs[0]` is `true`, or `targets[1]` otherwise.
    CondBranch,
}

impl ControlInst {
    pub fn unreachable() -> Self {
        Self { kind: ControlInstKind::Unreachable, inputs: SmallVec::new(), targets: SmallVec::new() }
    }

    pub fn ret(value: Option<Value>) -> Self {
        Self {
            kind: ControlInstKind::Return,
            inputs: value.into_iter().collect(),
            targets: SmallVec::new(),
        }
    }

    pub fn branch(target: Block) -> Self {
        Self {
            kind: ControlInstKind::Branch,
            inputs: SmallVec::new(),
            targets: [target].into_iter().collect(),
        }
    }

    pub fn cond_branch(cond: Value, then_target: Block, else_target: Block) -> Self {
        assert!(then_target != else_target, "`br_if` with identical targets");
        Self {
            kind: ControlInstKind::CondBranch,
            inputs: [cond].into_iter().collect(),
            targets: [then_target, else_target].into_iter().collect(),
        }
    }

    /// The branch condition, for [`ControlInstKind::CondBranch`].
    pub fn cond(&self) -> Option<Value> {
        match self.kind {
            ControlInstKind::CondBranch => Some(self.inputs[0]),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Value {
    Const(Const),

    /// One of the function's parameters.
    Param(u32),

    /// The output value of an [`Inst`].
    InstOutput(Inst),
}

impl From<Const> for Value {
    fn from(ct: Const) -> Self {
        Value::Const(ct)
    }
}

impl From<Inst> for Value {
    fn from(inst: Inst) -> Self {
        Value::InstOutput(inst)
    }
}

impl Value {
    pub fn as_inst(self) -> Option<Inst> {
        match self {
            Value::InstOutput(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn as_const(self) -> Option<Const> {
        match self {
            Value::Const(ct) => Some(ct),
            _ => None,
        }
    }
}
