//! Lock-step multi-lane interpreter, used as the reference semantics for
//! testing the vectorizer.
//!
//! All lanes share one control-flow path (every branch condition must agree
//! across the lanes where it's defined), and every instruction computes one
//! [`Scalar`] per lane. With a single lane, this is a plain scalar interpreter,
//! so comparing a `W`-lane run of vectorized code against `W` single-lane runs
//! of the original code checks that vectorization preserved per-lane results.
//!
//! Semantics worth pointing out:
//! * integer arithmetic wraps at the bit-width of its type, division and
//!   remainder by zero produce `0` (instead of being undefined behavior)
//! * `undef` propagates, except through `and`/`or`/`select` operands that
//!   can't affect the result
//! * memory is a flat array of [`Scalar`] cells, indexed by pointer values
//!   (i.e. pointers are plain integers, and `ptr.offset` adds cells)
//! * masked loads, stores and calls only happen in lanes where the mask is
//!   `true` (in lane order), masked loads produce `undef` in the other lanes
//! * intrinsic calls (`rv_any`, ...) combine all lanes, ignoring any mask
//! * calls marked uniform by the [`VectorizationInfo`] run once (using the
//!   first active lane's arguments), their result being broadcast

use crate::wfv::{IntrinsicKind, IntrinsicRegistry, VectorizationInfo};
use crate::{
    BinOp, Block, CastOp, CmpOp, ConstKind, Context, ControlInstKind, Func, FuncDefBody, Inst,
    InstKind, TypeKind, Value, sign_extend,
};
use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub const MAX_LANES: usize = 16;

/// Runtime value of one lane.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Scalar {
    Undef,
    Bool(bool),
    /// Sign-extended from the bit-width of its type.
    Int(i64),
    Float(f64),
}

pub type Lanes = ArrayVec<Scalar, MAX_LANES>;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("expected {expected} arguments, got {found}")]
    ArgCount { expected: usize, found: usize },

    #[error("{0} lanes requested or passed (expected 1..={MAX_LANES}, matching the evaluator)")]
    Width(usize),

    #[error("lanes disagree on the branch at the end of {0}")]
    DivergentBranch(Block),

    #[error("branch condition at the end of {0} is undefined in every lane")]
    UndefBranch(Block),

    #[error("reached `unreachable` in {0}")]
    Unreachable(Block),

    #[error("phi {phi} has no incoming value for {pred:?}")]
    MissingIncoming { phi: Inst, pred: Option<Block> },

    #[error("cannot evaluate {inst}: {reason}")]
    Unsupported { inst: Inst, reason: &'static str },

    #[error("memory access out of bounds (address {addr})")]
    OutOfBounds { addr: i64 },

    #[error("call to {0}, with no host function to run it")]
    UnknownCallee(Func),

    #[error("step limit exceeded")]
    StepLimit,
}

type HostCall<'a> = Box<dyn FnMut(Func, &[Scalar]) -> Scalar + 'a>;

pub struct Evaluator<'a> {
    cx: &'a Context,
    func: &'a FuncDefBody,
    width: usize,

    memory: Vec<Scalar>,
    intrinsics: Option<&'a IntrinsicRegistry>,
    vinfo: Option<&'a VectorizationInfo>,

    /// Implementation of (non-intrinsic) callees, invoked once per lane.
    host_call: Option<HostCall<'a>>,

    /// Maximum number of blocks executed, before giving up.
    max_steps: usize,
}

/// The outcome of a complete [`Evaluator::run`].
pub struct Execution<'a> {
    cx: &'a Context,
    width: usize,
    params: SmallVec<[Lanes; 2]>,
    values: FxHashMap<Inst, Lanes>,

    /// The returned value, if any.
    pub ret: Option<Lanes>,

    /// Every block executed, in order (a block appears once per execution).
    pub trace: Vec<Block>,

    pub memory: Vec<Scalar>,
}

impl Execution<'_> {
    /// The last value `v` had (all `undef` if its instruction never ran).
    pub fn value(&self, v: Value) -> Lanes {
        lanes_of(self.cx, self.width, &self.params, &self.values, v)
    }

    /// How many times `block` was executed.
    pub fn visits(&self, block: Block) -> usize {
        self.trace.iter().filter(|&&b| b == block).count()
    }
}

fn splat(width: usize, x: Scalar) -> Lanes {
    (0..width).map(|_| x).collect()
}

fn lanes_of(
    cx: &Context,
    width: usize,
    params: &[Lanes],
    values: &FxHashMap<Inst, Lanes>,
    v: Value,
) -> Lanes {
    match v {
        Value::Const(ct) => splat(
            width,
            match cx[ct].kind {
                ConstKind::Undef => Scalar::Undef,
                ConstKind::Bool(b) => Scalar::Bool(b),
                ConstKind::Int(x) => Scalar::Int(x),
                ConstKind::Float(bits) => Scalar::Float(f64::from_bits(bits)),
            },
        ),
        Value::Param(idx) => params[idx as usize].clone(),
        Value::InstOutput(inst) => {
            values.get(&inst).cloned().unwrap_or_else(|| splat(width, Scalar::Undef))
        }
    }
}

impl<'a> Evaluator<'a> {
    pub fn new(cx: &'a Context, func: &'a FuncDefBody, width: usize) -> Self {
        Self {
            cx,
            func,
            width,
            memory: vec![],
            intrinsics: None,
            vinfo: None,
            host_call: None,
            max_steps: 100_000,
        }
    }

    pub fn with_memory(self, memory: Vec<Scalar>) -> Self {
        Self { memory, ..self }
    }

    pub fn with_intrinsics(self, intrinsics: &'a IntrinsicRegistry) -> Self {
        Self { intrinsics: Some(intrinsics), ..self }
    }

    pub fn with_vinfo(self, vinfo: &'a VectorizationInfo) -> Self {
        Self { vinfo: Some(vinfo), ..self }
    }

    pub fn with_host_call(self, host_call: impl FnMut(Func, &[Scalar]) -> Scalar + 'a) -> Self {
        Self { host_call: Some(Box::new(host_call)), ..self }
    }

    pub fn with_step_limit(self, max_steps: usize) -> Self {
        Self { max_steps, ..self }
    }

    /// Run the function from its entry, with one [`Lanes`] per parameter
    /// (single-lane arguments are broadcast to every lane).
    pub fn run(mut self, args: &[Lanes]) -> Result<Execution<'a>, EvalError> {
        if !(1..=MAX_LANES).contains(&self.width) {
            return Err(EvalError::Width(self.width));
        }
        if args.len() != self.func.params.len() {
            return Err(EvalError::ArgCount { expected: self.func.params.len(), found: args.len() });
        }
        let params = args
            .iter()
            .map(|arg| match arg[..] {
                [x] => Ok(splat(self.width, x)),
                _ if arg.len() == self.width => Ok(arg.clone()),
                _ => Err(EvalError::Width(arg.len())),
            })
            .collect::<Result<_, _>>()?;

        let mut exec = Execution {
            cx: self.cx,
            width: self.width,
            params,
            values: FxHashMap::default(),
            ret: None,
            trace: vec![],
            memory: std::mem::take(&mut self.memory),
        };

        let func = self.func;
        let mut block = func.entry;
        let mut prev = None;
        loop {
            if exec.trace.len() >= self.max_steps {
                return Err(EvalError::StepLimit);
            }
            exec.trace.push(block);

            // All phis read their inputs before any of them is updated.
            let phis = func.phis(block);
            let mut phi_values = SmallVec::<[(Inst, Lanes); 4]>::new();
            for &phi in &phis {
                let v = prev
                    .and_then(|pred| func.phi_incoming_value(phi, pred))
                    .ok_or(EvalError::MissingIncoming { phi, pred: prev })?;
                phi_values.push((phi, exec.value(v)));
            }
            exec.values.extend(phi_values);

            for &inst in &func.blocks[block].insts[phis.len()..] {
                let lanes = self.eval_inst(&mut exec, inst)?;
                exec.values.insert(inst, lanes);
            }

            let terminator = &func.blocks[block].terminator;
            let next = match terminator.kind {
                ControlInstKind::Unreachable => return Err(EvalError::Unreachable(block)),
                ControlInstKind::Return => {
                    exec.ret = terminator.inputs.first().map(|&v| exec.value(v));
                    return Ok(exec);
                }
                ControlInstKind::Branch => terminator.targets[0],
                ControlInstKind::CondBranch => {
                    let mut taken = None;
                    for x in exec.value(terminator.inputs[0]) {
                        let Scalar::Bool(b) = x else { continue };
                        if taken.is_some_and(|taken| taken != b) {
                            return Err(EvalError::DivergentBranch(block));
                        }
                        taken = Some(b);
                    }
                    match taken {
                        Some(true) => terminator.targets[0],
                        Some(false) => terminator.targets[1],
                        None => return Err(EvalError::UndefBranch(block)),
                    }
                }
            };
            prev = Some(block);
            block = next;
        }
    }

    fn eval_inst(&mut self, exec: &mut Execution<'a>, inst: Inst) -> Result<Lanes, EvalError> {
        let (cx, func, width) = (self.cx, self.func, self.width);
        let def = &func.insts[inst];
        let inputs: SmallVec<[Lanes; 3]> = def.inputs.iter().map(|&v| exec.value(v)).collect();
        let active: ArrayVec<bool, MAX_LANES> = match def.mask {
            Some(mask) => exec.value(mask).into_iter().map(|m| m == Scalar::Bool(true)).collect(),
            None => (0..width).map(|_| true).collect(),
        };
        let unsupported = |reason| EvalError::Unsupported { inst, reason };
        let out_kind = &cx[def.output_type].kind;

        let per_lane = |f: &dyn Fn(usize) -> Result<Scalar, &'static str>| {
            (0..width).map(|l| f(l).map_err(unsupported)).collect::<Result<Lanes, _>>()
        };

        match def.kind {
            InstKind::Phi { .. } => Err(unsupported("phi after non-phi instructions")),
            InstKind::Binary(op) => per_lane(&|l| binary(op, inputs[0][l], inputs[1][l], out_kind)),
            InstKind::Cmp(op) => {
                let in_kind = &cx[func.type_of(cx, def.inputs[0])].kind;
                per_lane(&|l| compare(op, inputs[0][l], inputs[1][l], in_kind))
            }
            InstKind::Select => per_lane(&|l| {
                Ok(match inputs[0][l] {
                    Scalar::Bool(true) => inputs[1][l],
                    Scalar::Bool(false) => inputs[2][l],
                    _ if inputs[1][l] == inputs[2][l] => inputs[1][l],
                    _ => Scalar::Undef,
                })
            }),
            InstKind::Cast(op) => {
                let in_kind = &cx[func.type_of(cx, def.inputs[0])].kind;
                per_lane(&|l| cast(op, inputs[0][l], in_kind, out_kind))
            }
            InstKind::PtrOffset => per_lane(&|l| {
                Ok(match (inputs[0][l], inputs[1][l]) {
                    (Scalar::Int(base), Scalar::Int(offset)) => Scalar::Int(base.wrapping_add(offset)),
                    _ => Scalar::Undef,
                })
            }),
            InstKind::Load => {
                let mut out = Lanes::new();
                for l in 0..width {
                    out.push(match (active[l], inputs[0][l]) {
                        (true, Scalar::Int(addr)) => *cell(&mut exec.memory, addr)?,
                        _ => Scalar::Undef,
                    });
                }
                Ok(out)
            }
            InstKind::Store => {
                for l in 0..width {
                    if let (true, Scalar::Int(addr)) = (active[l], inputs[0][l]) {
                        *cell(&mut exec.memory, addr)? = inputs[1][l];
                    }
                }
                Ok(splat(width, Scalar::Undef))
            }
            InstKind::Call(callee) => {
                if let Some(kind) = self.intrinsics.and_then(|intrinsics| intrinsics.kind_of(callee)) {
                    return Ok(self.eval_intrinsic(kind, &inputs));
                }
                let is_uniform = self.vinfo.is_some_and(|vinfo| vinfo.is_uniform(Value::InstOutput(inst)));
                let host_call = self.host_call.as_mut().ok_or(EvalError::UnknownCallee(callee))?;

                let mut out = splat(width, Scalar::Undef);
                for l in (0..width).filter(|&l| active[l]) {
                    let args: SmallVec<[Scalar; 4]> = inputs.iter().map(|arg| arg[l]).collect();
                    let result = host_call(callee, &args);
                    if is_uniform {
                        out = splat(width, result);
                        break;
                    }
                    out[l] = result;
                }
                Ok(out)
            }
            InstKind::ExtractElement
            | InstKind::InsertElement
            | InstKind::ShuffleVector
            | InstKind::ExtractValue(_)
            | InstKind::InsertValue(_) => Err(unsupported("vector/aggregate operations")),
        }
    }

    fn eval_intrinsic(&self, kind: IntrinsicKind, inputs: &[Lanes]) -> Lanes {
        let is_true = |x: &Scalar| *x == Scalar::Bool(true);
        let result = match kind {
            IntrinsicKind::Any => Scalar::Bool(inputs[0].iter().any(is_true)),
            IntrinsicKind::All => Scalar::Bool(inputs[0].iter().all(is_true)),
            IntrinsicKind::Extract => match inputs[1][0] {
                Scalar::Int(lane) => usize::try_from(lane)
                    .ok()
                    .and_then(|lane| inputs[0].get(lane).copied())
                    .unwrap_or(Scalar::Undef),
                _ => Scalar::Undef,
            },
            IntrinsicKind::Ballot => Scalar::Int(
                inputs[0]
                    .iter()
                    .enumerate()
                    .filter(|(_, x)| is_true(*x))
                    .map(|(l, _)| 1i64 << l)
                    .sum(),
            ),
            IntrinsicKind::Align => return inputs[0].clone(),
        };
        splat(self.width, result)
    }
}

fn cell(memory: &mut [Scalar], addr: i64) -> Result<&mut Scalar, EvalError> {
    usize::try_from(addr)
        .ok()
        .and_then(|idx| memory.get_mut(idx))
        .ok_or(EvalError::OutOfBounds { addr })
}

/// All-ones mask for the low `width` bits.
fn low_bits(width: u8) -> u64 {
    if width >= 64 { u64::MAX } else { (1u64 << width) - 1 }
}

fn int_width(kind: &TypeKind) -> u8 {
    match *kind {
        TypeKind::Int(width) => width,
        // Pointers are plain (64-bit) integers here.
        _ => 64,
    }
}

fn round_float(x: f64, kind: &TypeKind) -> f64 {
    match kind {
        TypeKind::Float(32) => f64::from(x as f32),
        _ => x,
    }
}

fn binary(op: BinOp, a: Scalar, b: Scalar, ty: &TypeKind) -> Result<Scalar, &'static str> {
    use Scalar::{Bool, Float, Int, Undef};

    Ok(match (a, b) {
        (Bool(x), Bool(y)) => Bool(match op {
            BinOp::And | BinOp::Mul | BinOp::UMin => x & y,
            BinOp::Or | BinOp::UMax => x | y,
            BinOp::Xor | BinOp::Add | BinOp::Sub => x ^ y,
            _ => return Err("unsupported operation on `bool`"),
        }),
        (Bool(false), Undef) | (Undef, Bool(false)) if op == BinOp::And => Bool(false),
        (Bool(true), Undef) | (Undef, Bool(true)) if op == BinOp::Or => Bool(true),
        (Undef, _) | (_, Undef) => Undef,

        (Int(x), Int(y)) => {
            let width = int_width(ty);
            let (ux, uy) = ((x as u64) & low_bits(width), (y as u64) & low_bits(width));
            let shift = (y as u32) % u32::from(width.max(1));
            let r = match op {
                BinOp::Add => x.wrapping_add(y),
                BinOp::Sub => x.wrapping_sub(y),
                BinOp::Mul => x.wrapping_mul(y),
                BinOp::SDiv => x.checked_div(y).unwrap_or(0),
                BinOp::UDiv => ux.checked_div(uy).unwrap_or(0) as i64,
                BinOp::SRem => x.checked_rem(y).unwrap_or(0),
                BinOp::URem => ux.checked_rem(uy).unwrap_or(0) as i64,
                BinOp::And => x & y,
                BinOp::Or => x | y,
                BinOp::Xor => x ^ y,
                BinOp::Shl => x.wrapping_shl(shift),
                BinOp::LShr => (ux >> shift) as i64,
                BinOp::AShr => x >> shift,
                BinOp::SMin => x.min(y),
                BinOp::SMax => x.max(y),
                BinOp::UMin => ux.min(uy) as i64,
                BinOp::UMax => ux.max(uy) as i64,
                BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv | BinOp::FMin | BinOp::FMax => {
                    return Err("float operation on integers");
                }
            };
            Int(sign_extend(r, width))
        }

        (Float(x), Float(y)) => Float(round_float(
            match op {
                BinOp::FAdd => x + y,
                BinOp::FSub => x - y,
                BinOp::FMul => x * y,
                BinOp::FDiv => x / y,
                BinOp::FMin => x.min(y),
                BinOp::FMax => x.max(y),
                _ => return Err("integer operation on floats"),
            },
            ty,
        )),

        _ => return Err("mismatched operand kinds"),
    })
}

fn compare(op: CmpOp, a: Scalar, b: Scalar, ty: &TypeKind) -> Result<Scalar, &'static str> {
    use Scalar::{Bool, Float, Int, Undef};

    Ok(Bool(match (a, b) {
        (Undef, _) | (_, Undef) => return Ok(Undef),
        (Bool(x), Bool(y)) => match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            _ => return Err("ordered comparison of `bool`s"),
        },
        (Int(x), Int(y)) => {
            let mask = low_bits(int_width(ty));
            let (ux, uy) = ((x as u64) & mask, (y as u64) & mask);
            match op {
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
                CmpOp::SLt => x < y,
                CmpOp::SLe => x <= y,
                CmpOp::SGt => x > y,
                CmpOp::SGe => x >= y,
                CmpOp::ULt => ux < uy,
                CmpOp::ULe => ux <= uy,
                CmpOp::UGt => ux > uy,
                CmpOp::UGe => ux >= uy,
                CmpOp::FLt | CmpOp::FLe | CmpOp::FGt | CmpOp::FGe => {
                    return Err("float comparison of integers");
                }
            }
        }
        (Float(x), Float(y)) => match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::FLt => x < y,
            CmpOp::FLe => x <= y,
            CmpOp::FGt => x > y,
            CmpOp::FGe => x >= y,
            _ => return Err("integer comparison of floats"),
        },
        _ => return Err("mismatched operand kinds"),
    }))
}

fn cast(op: CastOp, x: Scalar, from: &TypeKind, to: &TypeKind) -> Result<Scalar, &'static str> {
    use Scalar::{Bool, Float, Int, Undef};

    let to_int = |x: i64| match to {
        TypeKind::Bool => Bool(x & 1 != 0),
        _ => Int(sign_extend(x, int_width(to))),
    };
    Ok(match (op, x) {
        (_, Undef) => Undef,
        (CastOp::ZExt, Bool(b)) => to_int(i64::from(b)),
        (CastOp::SExt, Bool(b)) => to_int(-i64::from(b)),
        (CastOp::ZExt, Int(x)) => to_int(((x as u64) & low_bits(int_width(from))) as i64),
        (CastOp::SExt | CastOp::Trunc, Int(x)) => to_int(x),
        (CastOp::SIToFP, Int(x)) => Float(round_float(x as f64, to)),
        (CastOp::FPToSI, Float(x)) => to_int(x as i64),
        (CastOp::Bitcast, Int(x)) => match to {
            TypeKind::Float(32) => Float(f64::from(f32::from_bits(x as u32))),
            TypeKind::Float(_) => Float(f64::from_bits(x as u64)),
            _ => to_int(x),
        },
        (CastOp::Bitcast, Float(x)) => match to {
            TypeKind::Int(32) => to_int(i64::from((x as f32).to_bits())),
            TypeKind::Int(_) => to_int(x.to_bits() as i64),
            _ => Float(x),
        },
        (CastOp::Bitcast, Bool(b)) => to_int(i64::from(b)),
        _ => return Err("invalid cast operand"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FuncSketch, lanes_of_bools, lanes_of_ints};

    #[test]
    fn integer_arithmetic_wraps_at_type_width() {
        let i8_kind = TypeKind::Int(8);
        let add = binary(BinOp::Add, Scalar::Int(127), Scalar::Int(1), &i8_kind);
        assert_eq!(add, Ok(Scalar::Int(-128)));
        let udiv = binary(BinOp::UDiv, Scalar::Int(-1), Scalar::Int(2), &i8_kind);
        assert_eq!(udiv, Ok(Scalar::Int(127)));
        let div_by_zero = binary(BinOp::SDiv, Scalar::Int(5), Scalar::Int(0), &i8_kind);
        assert_eq!(div_by_zero, Ok(Scalar::Int(0)));
        let ult = compare(CmpOp::ULt, Scalar::Int(1), Scalar::Int(-1), &i8_kind);
        assert_eq!(ult, Ok(Scalar::Bool(true)));
    }

    #[test]
    fn undef_is_absorbed_by_and_or() {
        let bool_kind = TypeKind::Bool;
        let and = binary(BinOp::And, Scalar::Undef, Scalar::Bool(false), &bool_kind);
        assert_eq!(and, Ok(Scalar::Bool(false)));
        let or = binary(BinOp::Or, Scalar::Bool(true), Scalar::Undef, &bool_kind);
        assert_eq!(or, Ok(Scalar::Bool(true)));
        let xor = binary(BinOp::Xor, Scalar::Bool(true), Scalar::Undef, &bool_kind);
        assert_eq!(xor, Ok(Scalar::Undef));
    }

    #[test]
    fn lanes_must_agree_on_branches() {
        let mut s = FuncSketch::new(1);
        let [then_, join] = s.blocks(["then", "join"]);
        s.br_if(s.entry(), Value::Param(0), then_, join);
        s.br(then_, join);
        s.ret(join);

        let run = Evaluator::new(&s.cx, &s.func, 2).run(&[lanes_of_bools([true, true])]).unwrap();
        assert_eq!(run.trace, [s.entry(), then_, join]);
        assert_eq!(run.visits(then_), 1);

        let err = Evaluator::new(&s.cx, &s.func, 2).run(&[lanes_of_bools([true, false])]);
        assert_eq!(err.err(), Some(EvalError::DivergentBranch(s.entry())));
    }

    #[test]
    fn masked_stores_only_touch_active_lanes() {
        let mut s = FuncSketch::with_params(
            |cx| [cx.ptr_type(cx.int_type(32)), cx.bool_type()],
            |cx| cx.void_type(),
        );
        let entry = s.entry();
        let mut b = s.builder(entry);
        let i32_ty = b.cx.int_type(32);
        let seven = b.const_int(i32_ty, 7);
        let store = b.store(Value::Param(0), seven);
        b.ret(None);
        s.func.insts[store].mask = Some(Value::Param(1));

        let run = Evaluator::new(&s.cx, &s.func, 4)
            .with_memory(vec![Scalar::Int(0); 4])
            .run(&[lanes_of_ints([0, 1, 2, 3]), lanes_of_bools([true, false, false, true])])
            .unwrap();
        assert_eq!(run.memory, [Scalar::Int(7), Scalar::Int(0), Scalar::Int(0), Scalar::Int(7)]);
    }

    #[test]
    fn runaway_loops_hit_the_step_limit() {
        let mut s = FuncSketch::new(0);
        let [spin] = s.blocks(["spin"]);
        s.br(s.entry(), spin);
        s.br(spin, spin);

        let err = Evaluator::new(&s.cx, &s.func, 1).with_step_limit(50).run(&[]);
        assert_eq!(err.err(), Some(EvalError::StepLimit));
    }
}
