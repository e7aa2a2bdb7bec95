//! Helpers for native (i.e. target-SIMD) code generation: per-lane cascades for
//! scalarizing masked operations, and the type queries deciding which
//! operations can be vectorized at all.

use crate::builder::FuncBuilder;
use crate::visit::UseMap;
use crate::wfv::{IntrinsicKind, StageCx, VectorShape, VectorizeError};
use crate::{Block, Context, ControlInst, FuncDefBody, Inst, InstKind, Type, TypeKind, Value};
use smallvec::SmallVec;

/// Blocks executing something once per lane, in lane order: `conds[i]` tests
/// whether lane `i` is active, branching to `masked[i]` if so, and both of them
/// continue to the next lane (`conds[i + 1]`), or `end` after the last one.
pub struct CascadeBlocks {
    pub conds: Vec<Block>,
    pub masked: Vec<Block>,
    pub end: Block,
}

/// Create (empty) cascade blocks for `width` lanes. Only the `masked` blocks
/// get their terminators, the `conds` are left for the caller to fill in.
pub fn create_cascade_blocks(cx: &Context, func: &mut FuncDefBody, width: u32) -> CascadeBlocks {
    let mut conds = Vec::with_capacity(width as usize);
    let mut masked = Vec::with_capacity(width as usize);
    for lane in 0..width {
        conds.push(func.add_block(Some(cx.intern(format!("cascade_cond_{lane}")))));
        masked.push(func.add_block(Some(cx.intern(format!("cascade_masked_{lane}")))));
    }
    let end = func.add_block(Some(cx.intern("cascade_end")));

    for (i, &block) in masked.iter().enumerate() {
        let next = conds.get(i + 1).copied().unwrap_or(end);
        func.blocks[block].terminator = ControlInst::branch(next);
    }
    CascadeBlocks { conds, masked, end }
}

/// Execute the masked call `call` once per active lane, through a cascade of
/// blocks inserted in its place (the rest of its block moves to the cascade's
/// `end`).
///
/// Only calls whose result is unused (or `void`) are scalarized (there's no
/// value to re-assemble from the per-lane calls), `Ok(false)` is returned for
/// anything else.
pub fn scalarize_with_cascade(st: &mut StageCx<'_>, call: Inst) -> Result<bool, VectorizeError> {
    let def = &st.func.insts[call];
    let InstKind::Call(callee) = def.kind else {
        return Err(VectorizeError::bug(format!("{call} is not a call")));
    };
    let Some(mask) = def.mask else { return Ok(false) };
    let has_result = st.cx[def.output_type].kind != TypeKind::Void
        && UseMap::compute(st.func).num_users(Value::InstOutput(call)) > 0;
    if has_result {
        return Ok(false);
    }
    let (ret_type, args, block) = (def.output_type, def.inputs.clone(), def.block);
    let pos = st
        .func
        .position_of(call)
        .ok_or_else(|| VectorizeError::bug(format!("{call} is not attached to {block}")))?;

    let cascade = create_cascade_blocks(st.cx, st.func, st.vinfo.vector_width());

    // Split `block` right after the call, and drop the call itself.
    let tail = st.func.blocks[block].insts.split_off(pos + 1);
    st.func.blocks[block].insts.truncate(pos);
    for &inst in &tail {
        st.func.insts[inst].block = cascade.end;
    }
    st.func.blocks[cascade.end].insts = tail;
    let terminator = std::mem::replace(
        &mut st.func.blocks[block].terminator,
        ControlInst::branch(cascade.conds.first().copied().unwrap_or(cascade.end)),
    );
    for &succ in &terminator.targets {
        st.func.replace_phi_pred(succ, block, cascade.end);
    }
    st.func.blocks[cascade.end].terminator = terminator;

    let extract = st.intrinsics.func(IntrinsicKind::Extract);
    let (bool_ty, i32_ty) = (st.cx.bool_type(), st.cx.int_type(32));
    let mut uniform_values: SmallVec<[Value; 8]> = SmallVec::new();
    for (lane, (&cond, &masked)) in cascade.conds.iter().zip(&cascade.masked).enumerate() {
        let next = cascade.conds.get(lane + 1).copied().unwrap_or(cascade.end);

        let mut b = FuncBuilder::at_end(st.cx, st.func, cond);
        let lane = b.const_int(i32_ty, lane as i64);
        let active = Value::InstOutput(b.call(extract, bool_ty, [mask, lane]));
        b.cond_br(active, masked, next);
        uniform_values.push(active);

        b.switch_to_block(masked);
        let lane_args: SmallVec<[Value; 4]> = args
            .iter()
            .map(|&arg| {
                if st.vinfo.is_uniform(arg) {
                    return arg;
                }
                let ty = b.type_of(arg);
                let scalar = Value::InstOutput(b.call(extract, ty, [arg, lane]));
                uniform_values.push(scalar);
                scalar
            })
            .collect();
        uniform_values.push(Value::InstOutput(b.call(callee, ret_type, lane_args)));
    }

    let predicate = st.vinfo.predicate(block);
    for v in uniform_values {
        st.vinfo.set_shape(v, VectorShape::uni());
    }
    let new_blocks = cascade.conds.iter().chain(&cascade.masked).chain([&cascade.end]);
    for &new_block in new_blocks {
        if let Some(region) = st.vinfo.region_mut() {
            region.add_block(new_block);
        }
        st.vinfo.set_divergent(new_block, false);
    }
    if let Some(predicate) = predicate {
        for &new_block in cascade.conds.iter().chain([&cascade.end]) {
            st.vinfo.set_predicate(new_block, predicate);
        }
    }

    log::debug!(
        target: "wfv::native",
        "scalarized {call} (in {block}) over {} lanes",
        cascade.conds.len()
    );
    Ok(true)
}

/// Whether `ty` is a non-empty struct with all fields of the same type (and
/// that type is itself, if a struct, homogeneous).
pub fn is_homogeneous_struct(cx: &Context, ty: Type) -> bool {
    match &cx[ty].kind {
        TypeKind::Struct(fields) => match fields.first() {
            Some(&first) => {
                fields.iter().all(|&field| field == first)
                    && (!matches!(cx[first].kind, TypeKind::Struct(_))
                        || is_homogeneous_struct(cx, first))
            }
            None => false,
        },
        _ => false,
    }
}

/// Whether `ty` is, or (through pointers and vectors) wraps, a struct.
pub fn contains_struct(cx: &Context, ty: Type) -> bool {
    match cx[ty].kind {
        TypeKind::Struct(_) => true,
        TypeKind::Ptr(pointee) => contains_struct(cx, pointee),
        TypeKind::Vector { elem, .. } => contains_struct(cx, elem),
        TypeKind::Void | TypeKind::Bool | TypeKind::Int(_) | TypeKind::Float(_) => false,
    }
}

fn pointee(cx: &Context, ptr_ty: Type) -> Option<Type> {
    match cx[ptr_ty].kind {
        TypeKind::Ptr(pointee) => Some(pointee),
        _ => None,
    }
}

/// Whether `inst` reads or writes (part of) a struct.
pub fn is_struct_access(cx: &Context, func: &FuncDefBody, inst: Inst) -> bool {
    let def = &func.insts[inst];
    match def.kind {
        InstKind::ExtractValue(_) | InstKind::InsertValue(_) => true,
        InstKind::Load | InstKind::Store => contains_struct(cx, func.type_of(cx, def.inputs[0])),
        _ => false,
    }
}

/// Whether `inst` can be vectorized: element-wise vector operations can't,
/// calls returning vectors or structs can't, and struct accesses only can on
/// homogeneous structs.
pub fn is_supported_operation(cx: &Context, func: &FuncDefBody, inst: Inst) -> bool {
    let def = &func.insts[inst];
    match def.kind {
        InstKind::ExtractElement | InstKind::InsertElement | InstKind::ShuffleVector => false,
        InstKind::Call(_) => {
            !matches!(cx[def.output_type].kind, TypeKind::Vector { .. } | TypeKind::Struct(_))
        }
        InstKind::ExtractValue(_) | InstKind::InsertValue(_) => {
            is_homogeneous_struct(cx, func.type_of(cx, def.inputs[0]))
        }
        InstKind::Load | InstKind::Store => {
            let ptr_ty = func.type_of(cx, def.inputs[0]);
            match pointee(cx, ptr_ty) {
                Some(pointee) if contains_struct(cx, pointee) => is_homogeneous_struct(cx, pointee),
                _ => true,
            }
        }
        InstKind::Phi { .. }
        | InstKind::Binary(_)
        | InstKind::Cmp(_)
        | InstKind::Select
        | InstKind::Cast(_)
        | InstKind::PtrOffset => true,
    }
}
