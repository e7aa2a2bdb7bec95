//! Plain-text printing of function bodies.
//!
//! The output only depends on entity indices (never on hashing or allocation
//! addresses), so printing the same IR twice always produces the same text,
//! and two runs of a deterministic transformation can be compared as strings.
//!
//! Example output:
//! ```text
//! func(i32 %0) -> i32 {
//!   block0: // entry
//!     v0 = cmp.slt %0, 0i32
//!     br_if v0, block1, block2
//!   ...
//! }
//! ```

// FIXME stop using `itertools` for methods like `intersperse` when they
// get stabilized on `Iterator` instead.
#![allow(unstable_name_collisions)]
use itertools::Itertools as _;

use crate::{
    BinOp, Block, CastOp, CmpOp, Const, ConstKind, Context, ControlInstKind, FuncDefBody, Inst,
    InstKind, Module, Type, TypeKind, Value,
};
use std::fmt::{self, Write as _};

/// [`fmt::Display`] adapter for a whole [`FuncDefBody`].
pub struct FuncPrinter<'a> {
    cx: &'a Context,
    func: &'a FuncDefBody,

    /// Used only to print callee names (instead of `func3`-style handles).
    module: Option<&'a Module>,
}

impl<'a> FuncPrinter<'a> {
    pub fn new(cx: &'a Context, func: &'a FuncDefBody) -> Self {
        Self { cx, func, module: None }
    }

    pub fn with_module(self, module: &'a Module) -> Self {
        Self { module: Some(module), ..self }
    }
}

impl Context {
    pub fn print_type(&self, ty: Type) -> String {
        match &self[ty].kind {
            TypeKind::Void => "void".into(),
            TypeKind::Bool => "bool".into(),
            TypeKind::Int(width) => format!("i{width}"),
            TypeKind::Float(width) => format!("f{width}"),
            &TypeKind::Ptr(pointee) => format!("ptr<{}>", self.print_type(pointee)),
            &TypeKind::Vector { elem, len } => format!("<{len} x {}>", self.print_type(elem)),
            TypeKind::Struct(fields) => {
                format!("{{{}}}", fields.iter().map(|&field| self.print_type(field)).join(", "))
            }
        }
    }

    pub fn print_const(&self, ct: Const) -> String {
        let def = &self[ct];
        match def.kind {
            ConstKind::Undef => format!("undef.{}", self.print_type(def.ty)),
            ConstKind::Bool(b) => b.to_string(),
            ConstKind::Int(x) => format!("{x}{}", self.print_type(def.ty)),
            ConstKind::Float(bits) => format!("{:?}{}", f64::from_bits(bits), self.print_type(def.ty)),
        }
    }
}

/// Context-free form of a [`Value`] (constants only show their handle), for
/// logging and diagnostics.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Const(ct) => write!(f, "{ct:?}"),
            Value::Param(idx) => write!(f, "%{idx}"),
            Value::InstOutput(inst) => write!(f, "{inst}"),
        }
    }
}

impl FuncPrinter<'_> {
    fn value(&self, v: Value) -> String {
        match v {
            Value::Const(ct) => self.cx.print_const(ct),
            Value::Param(_) | Value::InstOutput(_) => v.to_string(),
        }
    }

    fn values(&self, vs: &[Value]) -> String {
        vs.iter().map(|&v| self.value(v)).join(", ")
    }

    fn block_label(&self, block: Block) -> String {
        match self.func.blocks[block].name {
            Some(name) => format!("{block}: // {}", &self.cx[name]),
            None => format!("{block}:"),
        }
    }

    fn inst(&self, inst: Inst) -> String {
        let def = &self.func.insts[inst];
        let has_output = self.cx[def.output_type].kind != TypeKind::Void;

        let mut s = String::new();
        if has_output {
            s += &format!("{inst} = ");
        }
        s += &match &def.kind {
            InstKind::Phi { incoming } => format!(
                "phi {} {}",
                self.cx.print_type(def.output_type),
                incoming
                    .iter()
                    .zip(&def.inputs)
                    .map(|(pred, &v)| format!("[{pred}: {}]", self.value(v)))
                    .join(", ")
            ),
            &InstKind::Binary(op) => format!("{} {}", binary_op_name(op), self.values(&def.inputs)),
            &InstKind::Cmp(op) => format!("cmp.{} {}", cmp_op_name(op), self.values(&def.inputs)),
            InstKind::Select => format!("select {}", self.values(&def.inputs)),
            &InstKind::Cast(op) => format!(
                "{} {} to {}",
                cast_op_name(op),
                self.values(&def.inputs),
                self.cx.print_type(def.output_type)
            ),
            InstKind::PtrOffset => format!("ptr.offset {}", self.values(&def.inputs)),
            InstKind::Load => format!(
                "load {} {}",
                self.cx.print_type(def.output_type),
                self.values(&def.inputs)
            ),
            InstKind::Store => format!("store {}", self.values(&def.inputs)),
            &InstKind::Call(callee) => {
                let callee = match self.module {
                    Some(module) => self.cx[module.funcs[callee].name].to_string(),
                    None => callee.to_string(),
                };
                format!("call {callee}({})", self.values(&def.inputs))
            }
            InstKind::ExtractElement => format!("extract.element {}", self.values(&def.inputs)),
            InstKind::InsertElement => format!("insert.element {}", self.values(&def.inputs)),
            InstKind::ShuffleVector => format!("shuffle.vector {}", self.values(&def.inputs)),
            InstKind::ExtractValue(idx) => {
                format!("extract.value {}, {idx}", self.values(&def.inputs))
            }
            InstKind::InsertValue(idx) => {
                format!("insert.value {}, {idx}", self.values(&def.inputs))
            }
        };
        if let Some(mask) = def.mask {
            s += &format!(" if {}", self.value(mask));
        }
        s
    }

    fn terminator(&self, block: Block) -> String {
        let terminator = &self.func.blocks[block].terminator;
        let targets = terminator.targets.iter().join(", ");
        match terminator.kind {
            ControlInstKind::Unreachable => "unreachable".into(),
            ControlInstKind::Return => match terminator.inputs[..] {
                [v] => format!("ret {}", self.value(v)),
                _ => "ret".into(),
            },
            ControlInstKind::Branch => format!("br {targets}"),
            ControlInstKind::CondBranch => {
                format!("br_if {}, {targets}", self.values(&terminator.inputs))
            }
        }
    }
}

impl fmt::Display for FuncPrinter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .func
            .params
            .iter()
            .enumerate()
            .map(|(i, &ty)| format!("{} %{i}", self.cx.print_type(ty)))
            .join(", ");
        writeln!(f, "func({params}) -> {} {{", self.cx.print_type(self.func.ret_type))?;
        for &block in &self.func.layout {
            writeln!(f, "  {}", self.block_label(block))?;
            for &inst in &self.func.blocks[block].insts {
                writeln!(f, "    {}", self.inst(inst))?;
            }
            writeln!(f, "    {}", self.terminator(block))?;
        }
        f.write_char('}')
    }
}

impl FuncDefBody {
    /// Shorthand for printing with a [`FuncPrinter`] (without callee names).
    pub fn print(&self, cx: &Context) -> String {
        FuncPrinter::new(cx, self).to_string()
    }
}

fn binary_op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::SDiv => "sdiv",
        BinOp::UDiv => "udiv",
        BinOp::SRem => "srem",
        BinOp::URem => "urem",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Shl => "shl",
        BinOp::LShr => "lshr",
        BinOp::AShr => "ashr",
        BinOp::SMin => "smin",
        BinOp::SMax => "smax",
        BinOp::UMin => "umin",
        BinOp::UMax => "umax",
        BinOp::FAdd => "fadd",
        BinOp::FSub => "fsub",
        BinOp::FMul => "fmul",
        BinOp::FDiv => "fdiv",
        BinOp::FMin => "fmin",
        BinOp::FMax => "fmax",
    }
}

fn cmp_op_name(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::SLt => "slt",
        CmpOp::SLe => "sle",
        CmpOp::SGt => "sgt",
        CmpOp::SGe => "sge",
        CmpOp::ULt => "ult",
        CmpOp::ULe => "ule",
        CmpOp::UGt => "ugt",
        CmpOp::UGe => "uge",
        CmpOp::FLt => "flt",
        CmpOp::FLe => "fle",
        CmpOp::FGt => "fgt",
        CmpOp::FGe => "fge",
    }
}

fn cast_op_name(op: CastOp) -> &'static str {
    match op {
        CastOp::ZExt => "zext",
        CastOp::SExt => "sext",
        CastOp::Trunc => "trunc",
        CastOp::SIToFP => "sitofp",
        CastOp::FPToSI => "fptosi",
        CastOp::Bitcast => "bitcast",
    }
}
