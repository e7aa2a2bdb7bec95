//! Reduction recognition: loop header phis accumulating a value through a
//! chain of associative operations (e.g. `sum = phi [0, sum + x]`), with
//! float add/mul only accepted for a single update per iteration.

use crate::cf::{LoopData, LoopInfo};
use crate::visit::{UseMap, User};
use crate::{
    BinOp, Block, Const, Context, FuncDefBody, FxIndexMap, FxIndexSet, Inst, InstKind, Type,
    TypeKind, Value,
};
use smallvec::SmallVec;

/// Associative (and commutative) operation a reduction accumulates with.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RedKind {
    Add,
    Mul,
    And,
    Or,
    Xor,
    SMin,
    SMax,
    UMin,
    UMax,
    FAdd,
    FMul,
    FMin,
    FMax,
}

impl RedKind {
    pub fn from_binop(op: BinOp) -> Option<Self> {
        Some(match op {
            BinOp::Add => Self::Add,
            BinOp::Mul => Self::Mul,
            BinOp::And => Self::And,
            BinOp::Or => Self::Or,
            BinOp::Xor => Self::Xor,
            BinOp::SMin => Self::SMin,
            BinOp::SMax => Self::SMax,
            BinOp::UMin => Self::UMin,
            BinOp::UMax => Self::UMax,
            BinOp::FAdd => Self::FAdd,
            BinOp::FMul => Self::FMul,
            BinOp::FMin => Self::FMin,
            BinOp::FMax => Self::FMax,
            BinOp::Sub
            | BinOp::SDiv
            | BinOp::UDiv
            | BinOp::SRem
            | BinOp::URem
            | BinOp::Shl
            | BinOp::LShr
            | BinOp::AShr
            | BinOp::FSub
            | BinOp::FDiv => return None,
        })
    }

    /// Whether regrouping the updates of a chain keeps the result exact
    /// (float add/mul round after every step, so they don't).
    pub fn is_associative(self) -> bool {
        !matches!(self, Self::FAdd | Self::FMul)
    }

    pub fn binop(self) -> BinOp {
        match self {
            Self::Add => BinOp::Add,
            Self::Mul => BinOp::Mul,
            Self::And => BinOp::And,
            Self::Or => BinOp::Or,
            Self::Xor => BinOp::Xor,
            Self::SMin => BinOp::SMin,
            Self::SMax => BinOp::SMax,
            Self::UMin => BinOp::UMin,
            Self::UMax => BinOp::UMax,
            Self::FAdd => BinOp::FAdd,
            Self::FMul => BinOp::FMul,
            Self::FMin => BinOp::FMin,
            Self::FMax => BinOp::FMax,
        }
    }
}

/// The value `n` for which `x op n == x` for every `x` of type `ty`, if `op`
/// (i.e. `kind`) applies to `ty` at all.
pub fn neutral_element(cx: &Context, kind: RedKind, ty: Type) -> Option<Const> {
    match cx[ty].kind {
        TypeKind::Bool => match kind {
            RedKind::And | RedKind::Mul => Some(cx.const_bool(true)),
            RedKind::Or | RedKind::Xor => Some(cx.const_bool(false)),
            _ => None,
        },
        TypeKind::Int(width) => {
            let signed_max = if width >= 64 { i64::MAX } else { (1i64 << (width - 1)) - 1 };
            let x = match kind {
                RedKind::Add | RedKind::Or | RedKind::Xor | RedKind::UMax => 0,
                RedKind::Mul => 1,
                // All ones, i.e. the unsigned maximum.
                RedKind::And | RedKind::UMin => -1,
                RedKind::SMin => signed_max,
                RedKind::SMax => !signed_max,
                RedKind::FAdd | RedKind::FMul | RedKind::FMin | RedKind::FMax => return None,
            };
            Some(cx.const_int(ty, x))
        }
        TypeKind::Float(_) => {
            let x = match kind {
                RedKind::FAdd => -0.0,
                RedKind::FMul => 1.0,
                RedKind::FMin => f64::INFINITY,
                RedKind::FMax => f64::NEG_INFINITY,
                _ => return None,
            };
            Some(cx.const_float(ty, x))
        }
        TypeKind::Void | TypeKind::Ptr(_) | TypeKind::Vector { .. } | TypeKind::Struct(_) => None,
    }
}

/// A recognized reduction, rooted at a loop header phi.
#[derive(Clone, Debug)]
pub struct Reduction {
    pub kind: RedKind,
    pub phi: Inst,

    /// The incoming value of `phi` along the loop backedge.
    pub latch_value: Value,

    /// Every instruction of the update chain (`phi` included).
    pub elements: FxIndexSet<Inst>,
}

/// Reductions of all the loop headers in a function, keyed by header phi.
#[derive(Default)]
pub struct ReductionAnalysis {
    reductions: FxIndexMap<Inst, Reduction>,
}

impl ReductionAnalysis {
    pub fn analyze(cx: &Context, func: &FuncDefBody, loops: &LoopInfo) -> Self {
        let uses = UseMap::compute(func);
        let mut reda = Self::default();
        for id in loops.ids() {
            let loop_data = &loops[id];
            for phi in func.phis(loop_data.header) {
                if let Some(red) = analyze_header_phi(cx, func, &uses, loops, loop_data, phi) {
                    log::trace!(
                        target: "wfv::reduction",
                        "{phi}: {:?} reduction over {} instructions",
                        red.kind,
                        red.elements.len()
                    );
                    reda.reductions.insert(phi, red);
                }
            }
        }
        reda
    }

    pub fn reduction_of(&self, phi: Inst) -> Option<&Reduction> {
        self.reductions.get(&phi)
    }

    pub fn len(&self) -> usize {
        self.reductions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reductions.is_empty()
    }
}

fn analyze_header_phi(
    cx: &Context,
    func: &FuncDefBody,
    uses: &UseMap,
    loops: &LoopInfo,
    loop_data: &LoopData,
    phi: Inst,
) -> Option<Reduction> {
    let incoming: SmallVec<[(Block, Value); 4]> = func.at_inst(phi).phi_incoming().collect();
    let latch_value = match incoming[..] {
        [(a_pred, a), (b_pred, b)] => match (loop_data.contains(a_pred), loop_data.contains(b_pred)) {
            (true, false) => a,
            (false, true) => b,
            _ => return None,
        },
        _ => return None,
    };
    if cx[func.insts[phi].output_type].kind == TypeKind::Void {
        return None;
    }

    let mut kind = None;
    let mut elements = FxIndexSet::default();
    elements.insert(phi);
    let mut queue = vec![phi];
    while let Some(element) = queue.pop() {
        let v = Value::InstOutput(element);
        let observable_outside = element == phi || v == latch_value;
        for &user in uses.users_of(v) {
            let user_inst = match user {
                User::Terminator(block) => {
                    if loop_data.contains(block) || !observable_outside {
                        return None;
                    }
                    continue;
                }
                User::Inst(inst) => inst,
            };
            let user_def = &func.insts[user_inst];
            if !loop_data.contains(user_def.block) {
                if !observable_outside {
                    return None;
                }
                continue;
            }
            if elements.contains(&user_inst) {
                continue;
            }
            match user_def.kind {
                InstKind::Binary(op) if user_def.mask.is_none() => {
                    let user_kind = RedKind::from_binop(op)?;
                    if *kind.get_or_insert(user_kind) != user_kind {
                        return None;
                    }
                }
                InstKind::Phi { .. } if user_def.block != loop_data.header => {}
                _ => return None,
            }
            elements.insert(user_inst);
            queue.push(user_inst);
        }
    }

    let kind = kind?;

    // Without associativity, only a single update per iteration can be split
    // off exactly (`acc + x` and `acc + (-0.0 + x)` are the same value). An
    // inner loop header phi in the chain means repeated updates.
    if !kind.is_associative() {
        let num_updates =
            elements.iter().filter(|&&e| matches!(func.insts[e].kind, InstKind::Binary(_))).count();
        let through_inner_loop =
            elements.iter().any(|&e| e != phi && loops.is_loop_header(func.insts[e].block));
        if num_updates > 1 || through_inner_loop {
            return None;
        }
    }
    if !latch_value.as_inst().is_some_and(|latch| elements.contains(&latch)) {
        return None;
    }
    let in_chain = |v: Value| v.as_inst().is_some_and(|inst| elements.contains(&inst));
    for &element in &elements {
        if element == phi {
            continue;
        }
        let inputs = &func.insts[element].inputs;
        let ok = match func.insts[element].kind {
            InstKind::Phi { .. } => inputs.iter().all(|&input| in_chain(input)),
            _ => inputs.iter().filter(|&&input| in_chain(input)).count() == 1,
        };
        if !ok {
            return None;
        }
    }

    Some(Reduction { kind, phi, latch_value, elements })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConstKind;
    use crate::builder::FuncBuilder;
    use crate::cf::CfgAnalyses;
    use crate::test_util::FuncSketch;

    #[test]
    fn neutral_elements() {
        let s = FuncSketch::new(0);
        let cx = &s.cx;
        let i8_ty = cx.int_type(8);
        let i32_ty = cx.int_type(32);
        let f32_ty = cx.float_type(32);

        let int = |kind, ty| match cx[neutral_element(cx, kind, ty).unwrap()].kind {
            ConstKind::Int(x) => x,
            other => panic!("{other:?}"),
        };
        assert_eq!(int(RedKind::Add, i32_ty), 0);
        assert_eq!(int(RedKind::Mul, i32_ty), 1);
        assert_eq!(int(RedKind::And, i32_ty), -1);
        assert_eq!(int(RedKind::SMin, i8_ty), 127);
        assert_eq!(int(RedKind::SMax, i8_ty), -128);
        assert_eq!(int(RedKind::SMax, i32_ty), i64::from(i32::MIN));
        assert_eq!(int(RedKind::UMax, i8_ty), 0);

        let float = neutral_element(cx, RedKind::FMin, f32_ty).unwrap();
        assert_eq!(cx[float].kind, ConstKind::Float(f64::INFINITY.to_bits()));
        assert_eq!(neutral_element(cx, RedKind::FAdd, i32_ty), None);
        assert_eq!(neutral_element(cx, RedKind::Add, f32_ty), None);
        assert_eq!(
            neutral_element(cx, RedKind::Or, cx.bool_type()),
            Some(cx.const_bool(false))
        );
    }

    /// `sum = phi [0, sum']; i = phi [0, i']; ...; sum' = sum op x; i' = i + 1`,
    /// with `extra` building anything else in the loop body.
    fn accumulating_loop(
        op: BinOp,
        extra: impl FnOnce(&mut FuncBuilder<'_>, Value, Value),
    ) -> (FuncSketch, Inst) {
        let mut s = FuncSketch::with_params(
            |cx| [cx.int_type(32), cx.int_type(32)],
            |cx| cx.int_type(32),
        );
        let [header, body, exit] = s.blocks(["header", "body", "exit"]);
        let entry = s.entry();
        s.br(entry, header);

        let i32_ty = s.cx.int_type(32);
        let zero = Value::Const(s.cx.const_int(i32_ty, 0));
        let one = Value::Const(s.cx.const_int(i32_ty, 1));
        let sum = s.func.append_phi(header, i32_ty, [(entry, zero)]);
        let i = s.func.append_phi(header, i32_ty, [(entry, zero)]);

        let mut b = s.builder(header);
        let c = b.cmp(crate::CmpOp::SLt, Value::InstOutput(i), Value::Param(0));
        b.cond_br(c, body, exit);

        let mut b = s.builder(body);
        let next_sum = b.binary(op, Value::InstOutput(sum), Value::Param(1));
        let next_i = b.binary(BinOp::Add, Value::InstOutput(i), one);
        extra(&mut b, Value::InstOutput(sum), next_sum);
        b.br(header);
        s.func.set_phi_incoming(sum, body, next_sum);
        s.func.set_phi_incoming(i, body, next_i);

        s.ret_value(exit, Value::InstOutput(sum));
        (s, sum)
    }

    fn analyze(s: &FuncSketch) -> ReductionAnalysis {
        let analyses = CfgAnalyses::compute(&s.func);
        ReductionAnalysis::analyze(&s.cx, &s.func, &analyses.loops)
    }

    #[test]
    fn sum_is_a_reduction() {
        let (s, sum) = accumulating_loop(BinOp::Add, |_, _, _| {});
        let reda = analyze(&s);
        let red = reda.reduction_of(sum).unwrap();
        assert_eq!(red.kind, RedKind::Add);
        assert_eq!(red.elements.len(), 2);
        // `i` is read by the exit test, so it's not a reduction.
        assert_eq!(reda.len(), 1);
    }

    #[test]
    fn non_associative_updates_are_rejected() {
        let (s, sum) = accumulating_loop(BinOp::Sub, |_, _, _| {});
        let reda = analyze(&s);
        assert!(reda.reduction_of(sum).is_none());
        assert!(reda.is_empty());
    }

    #[test]
    fn mixed_kinds_are_rejected() {
        let (s, sum) = accumulating_loop(BinOp::Add, |b, _, next_sum| {
            b.binary(BinOp::Mul, next_sum, Value::Param(1));
        });
        assert!(analyze(&s).reduction_of(sum).is_none());
    }

    #[test]
    fn other_in_loop_readers_are_rejected() {
        // Storing the running sum observes it mid-loop.
        let (s, sum) = accumulating_loop(BinOp::Add, |b, sum, _| {
            let ptr_ty = b.cx.ptr_type(b.cx.int_type(32));
            let null = b.const_int(ptr_ty, 0);
            b.store(null, sum);
        });
        assert!(analyze(&s).reduction_of(sum).is_none());
    }
}
