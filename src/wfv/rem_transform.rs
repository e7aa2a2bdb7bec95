//! Remainder transform: splitting a counted loop into a "main" loop whose trip
//! count is a multiple of the vector width, and a (scalar) remainder loop for
//! the leftover iterations.
//!
//! For a loop `for (i = start; i < bound; i += step)`, the preheader computes
//! ```text
//! trip       = start < bound ? (bound - start - 1) / step + 1 : 0
//! main_trips = trip - trip % W
//! main_bound = trip % W == 0 ? bound : start + main_trips * step
//! ```
//! (with unsigned division, as `bound - start` may not fit a signed integer),
//! the original loop becomes the main loop (staying while `i < main_bound`),
//! and a clone of it (blocks named `<name>.rem`) picks up from the main loop's
//! final state, still staying while `i < bound`. Values defined in the loop and
//! used after it are rewritten to use the remainder's clones instead.
//!
//! `main_bound` never overflows: when the main loop doesn't run every
//! iteration, `main_trips * step < bound - start`.

use crate::builder::FuncBuilder;
use crate::cf::{CfgAnalyses, LoopData, LoopId};
use crate::transform::{InnerInPlaceTransform, Remap, ReplaceValues};
use crate::visit::User;
use crate::wfv::loop_shape::{CountedLoop, LoopRejection, recognize_counted_loop};
use crate::{
    BinOp, Block, BlockDef, CmpOp, ControlInst, Context, FuncDefBody, FxIndexSet, TypeKind, Value,
    sign_extend,
};
use rustc_hash::FxHashMap;

/// The result of [`create_vectorizable_loop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorizableLoop {
    /// Header of the main loop (the original loop, in place).
    pub header: Block,

    /// What the main loop's induction variable is compared against, i.e.
    /// the original bound, if no remainder is needed.
    pub main_bound: Value,

    pub remainder: Option<RemainderLoop>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemainderLoop {
    /// Block between the main loop's exit and the remainder loop.
    pub preheader: Block,
    pub header: Block,

    /// Clones of the original loop blocks (in the same order).
    pub blocks: Vec<Block>,
}

/// Whether the loop's exit test is understood (see [`recognize_counted_loop`]).
pub fn can_handle_exit_condition(
    cx: &Context,
    func: &FuncDefBody,
    analyses: &CfgAnalyses,
    loop_data: &LoopData,
) -> bool {
    recognize_counted_loop(cx, func, analyses, loop_data).is_ok()
}

/// Everything [`create_vectorizable_loop`] needs, checked without mutating
/// anything: once this succeeds, the transform cannot fail.
pub fn can_transform_loop(
    cx: &Context,
    func: &FuncDefBody,
    analyses: &CfgAnalyses,
    loop_data: &LoopData,
) -> Result<CountedLoop, LoopRejection> {
    let counted = recognize_counted_loop(cx, func, analyses, loop_data)?;

    // The trip count computation needs integer arithmetic.
    let iv_ty = func.insts[counted.iv].output_type;
    if !matches!(cx[iv_ty].kind, TypeKind::Int(_)) {
        return Err(LoopRejection::UnrecognizedExitTest);
    }
    Ok(counted)
}

/// Split the loop `loop_id` (see the module docs), returning `None` (without
/// changing anything) if the loop isn't supported.
///
/// `trip_alignment` is a known divisor of the trip count (`0` or `1` if
/// unknown): if it's a multiple of `vector_width`, the loop is left as-is.
///
/// `uniform_overrides` holds values the caller knows to be uniform (and are
/// trusted as such), and gets every value computed by the transform added to
/// it (they only depend on the loop's start, step and bound).
pub fn create_vectorizable_loop(
    cx: &Context,
    func: &mut FuncDefBody,
    analyses: &CfgAnalyses,
    loop_id: LoopId,
    uniform_overrides: &mut FxIndexSet<Value>,
    vector_width: u32,
    trip_alignment: u32,
) -> Option<VectorizableLoop> {
    let loop_data = &analyses.loops[loop_id];
    let counted = match can_transform_loop(cx, func, analyses, loop_data) {
        Ok(counted) => counted,
        Err(reason) => {
            log::debug!(target: "wfv::rem_transform", "{}: {reason}", loop_data.header);
            return None;
        }
    };

    let iv_ty = func.insts[counted.iv].output_type;
    let TypeKind::Int(int_width) = cx[iv_ty].kind else { return None };
    let width = i64::from(vector_width);
    if vector_width == 0 || sign_extend(width, int_width) != width {
        log::debug!(target: "wfv::rem_transform", "vector width {vector_width} doesn't fit in i{int_width}");
        return None;
    }

    let header = counted.shape.header;
    if trip_alignment.max(1) % vector_width == 0 {
        log::debug!(
            target: "wfv::rem_transform",
            "{header}: trip count aligned to {trip_alignment}, no remainder needed"
        );
        return Some(VectorizableLoop { header, main_bound: counted.bound, remainder: None });
    }

    let main_bound = build_main_bound(cx, func, &counted, width, uniform_overrides);
    let remainder = clone_as_remainder(cx, func, loop_data, &counted);

    // The main loop stays while `iv < main_bound`, then moves on to the
    // remainder, instead of exiting.
    let mut b = FuncBuilder::at_end(cx, func, header);
    let stay = b.cmp(counted.stay_op, Value::InstOutput(counted.iv), main_bound);
    b.set_terminator(ControlInst::cond_branch(
        stay,
        counted.shape.continue_target,
        remainder.preheader,
    ));

    log::debug!(
        target: "wfv::rem_transform",
        "{header}: main loop bounded by {main_bound}, remainder loop {}",
        remainder.header
    );
    Some(VectorizableLoop { header, main_bound, remainder: Some(remainder) })
}

/// Compute `main_bound` at the end of the preheader.
fn build_main_bound(
    cx: &Context,
    func: &mut FuncDefBody,
    counted: &CountedLoop,
    width: i64,
    uniform_overrides: &mut FxIndexSet<Value>,
) -> Value {
    let iv_ty = func.insts[counted.iv].output_type;
    let mut b = FuncBuilder::at_end(cx, func, counted.shape.preheader);
    let (start, bound) = (counted.start, counted.bound);
    let (zero, one) = (b.const_int(iv_ty, 0), b.const_int(iv_ty, 1));
    let (step, width) = (b.const_int(iv_ty, counted.step), b.const_int(iv_ty, width));

    let has_iters = b.cmp(counted.stay_op, start, bound);
    let span = b.binary(BinOp::Sub, bound, start);
    let last_offset = b.binary(BinOp::Sub, span, one);
    let last_idx = b.binary(BinOp::UDiv, last_offset, step);
    let trip_if_any = b.binary(BinOp::Add, last_idx, one);
    let trip = b.select(has_iters, trip_if_any, zero);
    let rem_trips = b.binary(BinOp::URem, trip, width);
    let main_trips = b.binary(BinOp::Sub, trip, rem_trips);
    let main_span = b.binary(BinOp::Mul, main_trips, step);
    let partial_bound = b.binary(BinOp::Add, start, main_span);
    let no_rem = b.cmp(CmpOp::Eq, rem_trips, zero);
    let main_bound = b.select(no_rem, bound, partial_bound);

    uniform_overrides.extend([
        has_iters,
        span,
        last_offset,
        last_idx,
        trip_if_any,
        trip,
        rem_trips,
        main_trips,
        main_span,
        partial_bound,
        no_rem,
        main_bound,
    ]);
    main_bound
}

/// Clone the loop's blocks after it, entered through a new preheader from the
/// main loop's exit test, and exiting to the original exit.
fn clone_as_remainder(
    cx: &Context,
    func: &mut FuncDefBody,
    loop_data: &LoopData,
    counted: &CountedLoop,
) -> RemainderLoop {
    let (header, exit) = (counted.shape.header, counted.shape.exit);

    let rem_name = |func: &FuncDefBody, block: Block, suffix: &str| {
        let name = func.blocks[block].name.map_or_else(|| block.to_string(), |name| cx[name].to_string());
        Some(cx.intern(format!("{name}{suffix}")))
    };
    let preheader = func.add_block(rem_name(func, header, ".rem.preheader"));

    let mut block_map = FxHashMap::default();
    let mut value_map = FxHashMap::default();
    let mut cloned_insts = vec![];
    let mut header_phis = vec![];
    for &block in &loop_data.blocks {
        let name = rem_name(func, block, ".rem");
        let new_block = func.add_block(name);
        block_map.insert(block, new_block);
        for inst in func.blocks[block].insts.clone() {
            let def = func.insts[inst].clone();
            let is_header_phi = block == header && def.kind.is_phi();
            let new_inst = func.append_inst(new_block, def);
            value_map.insert(Value::InstOutput(inst), Value::InstOutput(new_inst));
            cloned_insts.push(new_inst);
            if is_header_phi {
                header_phis.push((inst, new_inst));
            }
        }
    }

    // Operands can only be remapped once every clone exists.
    let mut remap = Remap { values: &value_map, blocks: &block_map };
    for &inst in &cloned_insts {
        func.insts[inst].inner_in_place_transform_with(&mut remap);
    }
    for (&block, &new_block) in &block_map {
        let BlockDef { terminator, .. } = &func.blocks[block];
        let mut terminator = terminator.clone();
        terminator.inner_in_place_transform_with(&mut remap);
        func.blocks[new_block].terminator = terminator;
    }

    // The remainder starts from wherever the main loop stopped.
    let rem_header = block_map[&header];
    func.blocks[preheader].terminator = ControlInst::branch(rem_header);
    func.replace_phi_pred(rem_header, counted.shape.preheader, preheader);
    for (phi, rem_phi) in header_phis {
        func.set_phi_incoming(rem_phi, preheader, Value::InstOutput(phi));
    }
    func.replace_phi_pred(exit, header, rem_header);

    // Everything after the loop sees the remainder's values (which are the
    // final ones, and dominate the exit through the remainder header).
    let mut replace = ReplaceValues(&value_map);
    for block in func.layout.clone() {
        if loop_data.contains(block) || block_map.values().any(|&b| b == block) {
            continue;
        }
        for inst in func.blocks[block].insts.clone() {
            func.transform_user_with(User::Inst(inst), &mut replace);
        }
        func.transform_user_with(User::Terminator(block), &mut replace);
    }

    RemainderLoop {
        preheader,
        header: rem_header,
        blocks: loop_data.blocks.iter().map(|block| block_map[block]).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{Evaluator, Scalar};
    use crate::test_util::{FuncSketch, counted_loop_sketch, lanes_of_ints};

    fn first_loop(func: &FuncDefBody) -> (CfgAnalyses, LoopId) {
        let analyses = CfgAnalyses::compute(func);
        let loop_id = analyses.loops.ids().next().unwrap();
        (analyses, loop_id)
    }

    fn block_named(s: &FuncSketch, blocks: &[Block], name: &str) -> Block {
        *blocks.iter().find(|&&block| &s.cx[s.func.blocks[block].name.unwrap()] == name).unwrap()
    }

    #[test]
    fn unrecognized_loops_are_left_untouched() {
        let mut s = counted_loop_sketch(CmpOp::SGt, true, true, 1);
        let (analyses, loop_id) = first_loop(&s.func);
        assert!(!can_handle_exit_condition(&s.cx, &s.func, &analyses, &analyses.loops[loop_id]));

        let before = s.func.print(&s.cx).to_string();
        let mut overrides = FxIndexSet::default();
        let result =
            create_vectorizable_loop(&s.cx, &mut s.func, &analyses, loop_id, &mut overrides, 4, 1);
        assert_eq!(result, None);
        assert!(overrides.is_empty());
        assert_eq!(s.func.print(&s.cx).to_string(), before);
    }

    #[test]
    fn aligned_trip_counts_need_no_remainder() {
        let mut s = counted_loop_sketch(CmpOp::SLt, true, true, 1);
        let (analyses, loop_id) = first_loop(&s.func);
        let num_blocks = s.func.layout.len();
        let mut overrides = FxIndexSet::default();
        let result =
            create_vectorizable_loop(&s.cx, &mut s.func, &analyses, loop_id, &mut overrides, 4, 8)
                .unwrap();
        assert_eq!(result.remainder, None);
        assert_eq!(result.main_bound, Value::Param(0));
        assert_eq!(s.func.layout.len(), num_blocks);
    }

    /// `fn(n: i32) -> i32 { let mut acc = 0; for i in 0..n { acc = acc * 3 + i } acc }`
    /// (order-sensitive, so running iterations out of order would show).
    fn accumulating_loop() -> FuncSketch {
        let mut s = FuncSketch::with_params(|cx| [cx.int_type(32)], |cx| cx.int_type(32));
        let [header, body, exit] = s.blocks(["header", "body", "exit"]);
        let entry = s.entry();
        s.br(entry, header);

        let i32_ty = s.cx.int_type(32);
        let zero = Value::Const(s.cx.const_int(i32_ty, 0));
        let i = s.func.append_phi(header, i32_ty, [(entry, zero)]);
        let acc = s.func.append_phi(header, i32_ty, [(entry, zero)]);
        let (i, acc) = (Value::InstOutput(i), Value::InstOutput(acc));

        let mut b = s.builder(header);
        let stay = b.cmp(CmpOp::SLt, i, Value::Param(0));
        b.cond_br(stay, body, exit);

        let mut b = s.builder(body);
        let three = b.const_int(i32_ty, 3);
        let one = b.const_int(i32_ty, 1);
        let scaled = b.binary(BinOp::Mul, acc, three);
        let next_acc = b.binary(BinOp::Add, scaled, i);
        let next_i = b.binary(BinOp::Add, i, one);
        b.br(header);
        for (phi, next) in [(i, next_i), (acc, next_acc)] {
            s.func.set_phi_incoming(phi.as_inst().unwrap(), body, next);
        }
        s.ret_value(exit, acc);
        s
    }

    #[test]
    fn remainder_handles_leftover_iterations() {
        let width = 4;
        let original = accumulating_loop();
        let mut s = accumulating_loop();
        let (analyses, loop_id) = first_loop(&s.func);
        let mut overrides = FxIndexSet::default();
        let result = create_vectorizable_loop(
            &s.cx,
            &mut s.func,
            &analyses,
            loop_id,
            &mut overrides,
            width,
            1,
        )
        .unwrap();
        let remainder = result.remainder.unwrap();
        let body = block_named(&s, &s.func.layout, "body");
        let rem_body = block_named(&s, &remainder.blocks, "body.rem");
        assert!(overrides.contains(&result.main_bound));

        let name = |block: Block| s.cx[s.func.blocks[block].name.unwrap()].to_string();
        assert_eq!(name(remainder.header), "header.rem");
        assert_eq!(name(remainder.preheader), "header.rem.preheader");

        // The main loop is still a counted loop, now bounded by `main_bound`.
        let (analyses, _) = first_loop(&s.func);
        let main_loop = &analyses.loops[analyses.loops.loop_with_header(result.header).unwrap()];
        let counted = recognize_counted_loop(&s.cx, &s.func, &analyses, main_loop).unwrap();
        assert_eq!(counted.bound, result.main_bound);

        let w = i64::from(width);
        for trips in [0, 1, w - 1, w, w + 1, 10 * w + 3, -5] {
            let expected = Evaluator::new(&original.cx, &original.func, 1)
                .run(&[lanes_of_ints([trips])])
                .unwrap();
            let run = Evaluator::new(&s.cx, &s.func, 1).run(&[lanes_of_ints([trips])]).unwrap();
            assert_eq!(run.ret, expected.ret, "trip count {trips}");

            let trips = trips.max(0) as usize;
            assert_eq!(run.visits(body), trips / 4 * 4, "trip count {trips}");
            assert_eq!(run.visits(rem_body), trips % 4, "trip count {trips}");
        }
        assert_eq!(
            Evaluator::new(&s.cx, &s.func, 1).run(&[lanes_of_ints([2])]).unwrap().ret.unwrap()[0],
            Scalar::Int(1)
        );
    }

    #[test]
    fn unsigned_loops_with_large_steps() {
        // `for (i = 0; i u< n; i += 5)`
        let original = counted_loop_sketch(CmpOp::ULt, true, true, 5);
        let mut s = counted_loop_sketch(CmpOp::ULt, true, true, 5);
        let (analyses, loop_id) = first_loop(&s.func);
        let mut overrides = FxIndexSet::default();
        let remainder =
            create_vectorizable_loop(&s.cx, &mut s.func, &analyses, loop_id, &mut overrides, 8, 2)
                .unwrap()
                .remainder
                .unwrap();
        let body = block_named(&s, &s.func.layout, "body");
        let rem_body = block_named(&s, &remainder.blocks, "body.rem");

        for n in [0, 4, 5, 6, 39, 40, 41, 123] {
            let expected = Evaluator::new(&original.cx, &original.func, 1)
                .run(&[lanes_of_ints([n])])
                .unwrap();
            let run = Evaluator::new(&s.cx, &s.func, 1).run(&[lanes_of_ints([n])]).unwrap();
            let trips = expected.visits(body);
            assert_eq!(trips, (n as usize).div_ceil(5), "n = {n}");
            assert_eq!(run.visits(body), trips / 8 * 8, "n = {n}");
            assert_eq!(run.visits(rem_body), trips % 8, "n = {n}");
        }
    }
}
