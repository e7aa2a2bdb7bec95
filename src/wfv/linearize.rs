//! Control-flow linearization under predication.
//!
//! Every divergent branch (a `br_if` on a non-uniform condition) of the region
//! is replaced, together with all the blocks between it and its immediate
//! post-dominator (the "join"), by a straight chain of blocks:
//! * the blocks (and whole loops, which are kept intact as single nodes) are
//!   ordered topologically, ties broken by reverse post-order (RPO) position
//! * every node falls through to the next one, the last one to the join
//! * phis of the chained blocks become selects (or `or`s, for masks) keyed on
//!   the (precomputed) masks of their incoming edges, and join phis get a
//!   single incoming value from the chain, built the same way
//!
//! Branches are processed innermost first (descending RPO position), so that
//! by the time an enclosing branch is linearized, everything nested in it is
//! already straight-line code.
//!
//! Once control-flow is uniform, loads, stores and calls of blocks with a
//! non-trivial mask are predicated with that mask (and optionally, masked
//! calls are scalarized through a cascade of per-lane blocks).

use crate::builder::{FuncBuilder, InsertPoint};
use crate::cf::{CfgAnalyses, ControlFlowGraph};
use crate::wfv::mask::MaskExpander;
use crate::wfv::{StageCx, VectorShape, VectorizeError, VectorizerConfig, native};
use crate::{Block, ConstKind, ControlInst, FuncDefBody, FxIndexSet, Inst, InstKind, Value};
use itertools::Itertools as _;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Counters for one [`Linearizer::run`].
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct LinearizerStats {
    /// Divergent branches turned into straight-line code.
    pub regions: usize,

    /// Blocks (and collapsed loops) that were made to fall through.
    pub blocks: usize,

    /// Masked calls scalarized through cascades.
    pub scalarized_calls: usize,
}

/// One element of a linearized chain: a single block, or a whole loop.
struct Node {
    /// The block control enters the node through (for loops, the header).
    entry: Block,

    /// The block whose terminator leaves the node (for loops, the exiting block).
    exit: Block,

    collapsed_loop: Option<CollapsedLoop>,
}

struct CollapsedLoop {
    blocks: FxIndexSet<Block>,
    exit_target: Block,
}

pub struct Linearizer<'a> {
    config: &'a VectorizerConfig,
}

impl<'a> Linearizer<'a> {
    pub fn new(config: &'a VectorizerConfig) -> Self {
        Self { config }
    }

    fn is_divergent_branch(st: &StageCx<'_>, block: Block) -> bool {
        st.vinfo.in_region(block)
            && st.func.blocks[block].terminator.cond().is_some_and(|cond| !st.vinfo.is_uniform(cond))
    }

    /// Linearize all divergent branches of the region, then predicate side
    /// effects. Every block and edge of the region must already have a mask
    /// (see [`MaskExpander::expand_region_masks`]).
    pub fn run(
        &self,
        st: &mut StageCx<'_>,
        mask_ex: &mut MaskExpander,
    ) -> Result<LinearizerStats, VectorizeError> {
        let mut stats = LinearizerStats::default();

        let cfg = ControlFlowGraph::compute(st.func);
        let branches: SmallVec<[Block; 8]> = cfg
            .rev_post_order()
            .iter()
            .rev()
            .copied()
            .filter(|&block| Self::is_divergent_branch(st, block))
            .collect();

        for branch in branches {
            if !Self::is_divergent_branch(st, branch) {
                continue;
            }
            // NOTE CFG changes from each linearized branch can affect
            // dominance and post-dominance of every other block.
            let analyses = CfgAnalyses::compute(st.func);
            stats.blocks += linearize_branch(st, mask_ex, &analyses, branch)?;
            stats.regions += 1;
        }

        let num_masked = mask_side_effects(st);
        if self.config.cascade_calls {
            stats.scalarized_calls = Self::scalarize_masked_calls(st)?;
        }
        relayout(st.func);

        log::debug!(
            target: "wfv::linearize",
            "linearized {} divergent branches ({} blocks), masked {num_masked} instructions",
            stats.regions,
            stats.blocks,
        );
        Ok(stats)
    }

    fn scalarize_masked_calls(st: &mut StageCx<'_>) -> Result<usize, VectorizeError> {
        let calls: SmallVec<[Inst; 4]> = st
            .func
            .layout
            .iter()
            .filter(|&&block| st.vinfo.in_region(block))
            .flat_map(|&block| st.func.blocks[block].insts.iter().copied())
            .filter(|&inst| {
                let def = &st.func.insts[inst];
                match def.kind {
                    InstKind::Call(callee) => {
                        def.mask.is_some()
                            && st.intrinsics.kind_of(callee).is_none()
                            && !st.vinfo.is_uniform(Value::InstOutput(inst))
                            && native::is_supported_operation(st.cx, st.func, inst)
                    }
                    _ => false,
                }
            })
            .collect();

        let mut scalarized = 0;
        for call in calls {
            if native::scalarize_with_cascade(st, call)? {
                scalarized += 1;
            }
        }
        Ok(scalarized)
    }
}

fn unsupported(block: Block, reason: impl Into<String>) -> VectorizeError {
    VectorizeError::UnsupportedBranch { block, reason: reason.into() }
}

fn cached_block_mask(mask_ex: &MaskExpander, block: Block) -> Result<Value, VectorizeError> {
    mask_ex
        .block_mask(block)
        .ok_or_else(|| VectorizeError::bug(format!("mask of {block} wasn't expanded")))
}

fn cached_edge_mask(
    mask_ex: &MaskExpander,
    pred: Block,
    succ: Block,
) -> Result<Value, VectorizeError> {
    mask_ex
        .edge_mask(pred, succ)
        .ok_or_else(|| VectorizeError::bug(format!("mask of edge {pred} -> {succ} wasn't expanded")))
}

/// Replace `branch` and everything up to its join with a chain of nodes,
/// returning the number of nodes in the chain.
fn linearize_branch(
    st: &mut StageCx<'_>,
    mask_ex: &mut MaskExpander,
    analyses: &CfgAnalyses,
    branch: Block,
) -> Result<usize, VectorizeError> {
    let cfg = &analyses.cfg;
    let join = analyses
        .post_dom
        .ipdom(branch)
        .ok_or_else(|| unsupported(branch, "paths from the branch never join again"))?;

    // Everything reachable from the branch without going through the join.
    let mut blocks = FxIndexSet::default();
    blocks.insert(branch);
    let mut stack: SmallVec<[Block; 8]> = cfg.succs(branch).iter().rev().copied().collect();
    while let Some(block) = stack.pop() {
        if block == join {
            continue;
        }
        if block == branch {
            return Err(unsupported(branch, format!("cycle back to the branch before {join}")));
        }
        if !blocks.insert(block) {
            continue;
        }
        if !st.vinfo.in_region(block) {
            return Err(unsupported(branch, format!("{block} (before {join}) is outside the region")));
        }
        if !analyses.dom.dominates(branch, block) {
            return Err(unsupported(branch, format!("{block} can be entered bypassing the branch")));
        }
        stack.extend(cfg.succs(block).iter().rev().copied());
    }
    blocks.sort_by_cached_key(|&block| cfg.rpo_index(block));

    // Group the blocks into nodes, loops (with their header after the branch)
    // being kept whole.
    let mut nodes: Vec<Node> = vec![];
    let mut node_of: FxHashMap<Block, usize> = FxHashMap::default();
    for &block in &blocks {
        if node_of.contains_key(&block) {
            continue;
        }
        let mut outermost_loop = None;
        let mut loop_id = analyses.loops.innermost_loop_of(block);
        while let Some(id) = loop_id {
            let header = analyses.loops[id].header;
            if header != branch && blocks.contains(&header) {
                outermost_loop = Some(id);
            }
            loop_id = analyses.loops[id].parent;
        }

        let node_idx = nodes.len();
        let node = match outermost_loop {
            None => {
                node_of.insert(block, node_idx);
                Node { entry: block, exit: block, collapsed_loop: None }
            }
            Some(id) => {
                let loop_data = &analyses.loops[id];
                if !loop_data.reducible {
                    return Err(VectorizeError::IrreducibleCycle { block: loop_data.header });
                }
                if let Some(&outside) = loop_data.blocks.iter().find(|b| !blocks.contains(*b)) {
                    return Err(unsupported(
                        branch,
                        format!("loop {} reaches {outside}, past {join}", loop_data.header),
                    ));
                }
                let &[(exiting, exit_target)] = &loop_data.exit_edges[..] else {
                    return Err(unsupported(
                        branch,
                        format!(
                            "loop {} has {} exit edges (expected exactly one)",
                            loop_data.header,
                            loop_data.exit_edges.len()
                        ),
                    ));
                };
                for &loop_block in &loop_data.blocks {
                    node_of.insert(loop_block, node_idx);
                }
                Node {
                    entry: loop_data.header,
                    exit: exiting,
                    collapsed_loop: Some(CollapsedLoop {
                        blocks: loop_data.blocks.clone(),
                        exit_target,
                    }),
                }
            }
        };
        nodes.push(node);
    }

    let order = topological_order(cfg, &nodes, &node_of, join)?;

    let branch_mask = cached_block_mask(mask_ex, branch)?;
    let next_entry = |i: usize| order.get(i + 1).map_or(join, |&next| nodes[next].entry);

    // Phis of chained blocks (other than the branch itself, which keeps its
    // predecessors) are replaced with merges of their incoming values.
    for &n in &order[1..] {
        let node = &nodes[n];
        if node.collapsed_loop.is_some() {
            continue;
        }
        let block = node.entry;
        let phis = st.func.phis(block);
        let mut at = InsertPoint::AfterPhis(block);
        let mut merged = SmallVec::<[(Inst, Value); 4]>::new();
        for &phi in &phis {
            let incoming = keyed_incoming(
                mask_ex,
                st.func.at_inst(phi).phi_incoming().collect(),
                block,
            )?;
            let (value, next_at) = merge(st, at, &incoming);
            at = next_at;
            merged.push((phi, value));
        }
        for (phi, value) in merged {
            replace_phi(st, mask_ex, phi, value);
        }
    }

    // Loops are now entered only from the previous node.
    for (i, &n) in order.iter().enumerate().skip(1) {
        let Some(collapsed) = &nodes[n].collapsed_loop else { continue };
        let header = nodes[n].entry;
        let prev_exit = nodes[order[i - 1]].exit;
        for phi in st.func.phis(header) {
            let entering = st.func.remove_phi_incoming(phi, |pred| !collapsed.blocks.contains(&pred));
            let incoming = keyed_incoming(mask_ex, entering, header)?;
            let (value, _) = merge(st, InsertPoint::BlockEnd(prev_exit), &incoming);
            st.func.set_phi_incoming(phi, prev_exit, value);
        }
    }

    // The join is now entered (from the region) only from the last node.
    let last_exit = nodes[order[order.len() - 1]].exit;
    for phi in st.func.phis(join) {
        let from_region = st.func.remove_phi_incoming(phi, |pred| node_of.contains_key(&pred));
        if from_region.is_empty() {
            continue;
        }
        let incoming = keyed_incoming(mask_ex, from_region, join)?;
        let (value, _) = merge(st, InsertPoint::BlockEnd(last_exit), &incoming);
        st.func.set_phi_incoming(phi, last_exit, value);

        if let [single] = st.func.insts[phi].inputs[..] {
            replace_phi(st, mask_ex, phi, single);
        }
    }

    for (i, &n) in order.iter().enumerate() {
        let node = &nodes[n];
        let target = next_entry(i);
        match &node.collapsed_loop {
            None => st.func.blocks[node.exit].terminator = ControlInst::branch(target),
            Some(collapsed) => {
                for t in &mut st.func.blocks[node.exit].terminator.targets {
                    if *t == collapsed.exit_target {
                        *t = target;
                    }
                }
            }
        }
        // Every lane active in the branch now flows through the whole chain.
        mask_ex.set_edge_mask(node.exit, target, branch_mask);
    }

    log::debug!(
        target: "wfv::linearize",
        "{branch} .. {join}: {}",
        order.iter().map(|&n| nodes[n].entry).format(", ")
    );
    Ok(order.len())
}

/// Kahn's algorithm over the nodes, always picking the ready node that comes
/// first in the original RPO.
fn topological_order(
    cfg: &ControlFlowGraph,
    nodes: &[Node],
    node_of: &FxHashMap<Block, usize>,
    join: Block,
) -> Result<Vec<usize>, VectorizeError> {
    let mut succs: Vec<SmallVec<[usize; 2]>> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let targets: SmallVec<[Block; 2]> = match &node.collapsed_loop {
            None => cfg.succs(node.exit).iter().copied().collect(),
            Some(collapsed) => [collapsed.exit_target].into_iter().collect(),
        };
        let mut node_succs = SmallVec::new();
        for target in targets {
            if target == join {
                continue;
            }
            let &succ = node_of.get(&target).ok_or_else(|| {
                VectorizeError::bug(format!("{target} (after {}) isn't part of the chain", node.exit))
            })?;
            // Entering a loop anywhere but its header.
            if nodes[succ].entry != target {
                return Err(VectorizeError::IrreducibleCycle { block: target });
            }
            if !node_succs.contains(&succ) {
                node_succs.push(succ);
            }
        }
        succs.push(node_succs);
    }

    let mut in_degree = vec![0usize; nodes.len()];
    for &succ in succs.iter().flatten() {
        in_degree[succ] += 1;
    }
    let rpo_key = |n: usize| cfg.rpo_index(nodes[n].entry).unwrap_or(usize::MAX);
    let mut ready: BTreeSet<(usize, usize)> =
        (0..nodes.len()).filter(|&n| in_degree[n] == 0).map(|n| (rpo_key(n), n)).collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, n)) = ready.pop_first() {
        order.push(n);
        for &succ in &succs[n] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert((rpo_key(succ), succ));
            }
        }
    }
    if order.len() != nodes.len() {
        let stuck = (0..nodes.len()).find(|n| !order.contains(n)).unwrap_or(0);
        return Err(VectorizeError::IrreducibleCycle { block: nodes[stuck].entry });
    }
    Ok(order)
}

/// Pair each incoming value with the mask of the edge it flows along.
fn keyed_incoming(
    mask_ex: &MaskExpander,
    incoming: SmallVec<[(Block, Value); 4]>,
    block: Block,
) -> Result<SmallVec<[(Value, Value); 4]>, VectorizeError> {
    incoming
        .into_iter()
        .map(|(pred, v)| Ok((cached_edge_mask(mask_ex, pred, block)?, v)))
        .collect()
}

/// Build the value that, in each lane, is the incoming value whose edge mask
/// is set in that lane (assuming exactly one is), at `at`.
fn merge(
    st: &mut StageCx<'_>,
    at: InsertPoint,
    incoming: &[(Value, Value)],
) -> (Value, InsertPoint) {
    let Some(&(_, last)) = incoming.last() else {
        return (Value::Const(st.cx.const_bool(false)), at);
    };
    if incoming.iter().all(|&(_, v)| v == last) {
        return (last, at);
    }

    let mut b = FuncBuilder::new(st.cx, st.func, at);
    let mut created = SmallVec::<[(Value, SmallVec<[Value; 3]>); 4]>::new();

    // Masks flowing into a block merge into the `or` of the edge masks.
    let value = if incoming.iter().all(|&(edge_mask, v)| edge_mask == v) {
        incoming[1..].iter().fold(incoming[0].1, |acc, &(edge_mask, _)| {
            let v = b.or(acc, edge_mask);
            created.push((v, [acc, edge_mask].into_iter().collect()));
            v
        })
    } else {
        incoming[..incoming.len() - 1].iter().rev().fold(last, |acc, &(edge_mask, v)| {
            let merged = b.select(edge_mask, v, acc);
            created.push((merged, [edge_mask, v, acc].into_iter().collect()));
            merged
        })
    };
    let next_at = b.insert_point();

    for (v, inputs) in created {
        if v.as_inst().is_some() && !inputs.contains(&v) {
            let shape = if inputs.iter().all(|&input| st.vinfo.is_uniform(input)) {
                VectorShape::uni()
            } else {
                VectorShape::varying()
            };
            st.vinfo.set_shape(v, shape);
        }
    }
    (value, next_at)
}

/// Replace every use of `phi` (in the IR, predicates and cached masks) with
/// `value`, and detach it.
fn replace_phi(st: &mut StageCx<'_>, mask_ex: &mut MaskExpander, phi: Inst, value: Value) {
    let old = Value::InstOutput(phi);
    st.func.replace_all_uses(old, value);
    st.func.remove_inst(phi);
    st.vinfo.drop_shape(old);

    let layout = st.func.layout.clone();
    st.vinfo.remap_predicates(layout.iter().copied(), old, value);
    mask_ex.replace_mask(&layout, old, value);
}

/// Guard loads, stores and (non-intrinsic) calls with their block's mask,
/// returning the number of newly masked instructions.
fn mask_side_effects(st: &mut StageCx<'_>) -> usize {
    let mut num_masked = 0;
    for &block in &st.func.layout {
        if !st.vinfo.in_region(block) {
            continue;
        }
        let Some(mask) = st.vinfo.predicate(block) else { continue };
        let always_true =
            mask.as_const().is_some_and(|ct| st.cx[ct].kind == ConstKind::Bool(true));
        if always_true {
            continue;
        }
        for &inst in &st.func.blocks[block].insts {
            let def = &mut st.func.insts[inst];
            let is_intrinsic = match def.kind {
                InstKind::Call(callee) => st.intrinsics.kind_of(callee).is_some(),
                _ => false,
            };
            if def.kind.has_side_effects() && !is_intrinsic && def.mask.is_none() {
                def.mask = Some(mask);
                num_masked += 1;
            }
        }
    }
    num_masked
}

/// Reorder `func.layout` to follow the (new) RPO, keeping unreachable blocks
/// at the end, in their previous order.
fn relayout(func: &mut FuncDefBody) {
    let cfg = ControlFlowGraph::compute(func);
    let mut layout = cfg.rev_post_order().to_vec();
    layout.extend(func.layout.iter().copied().filter(|&block| !cfg.is_reachable(block)));
    func.layout = layout;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FuncSketch;
    use crate::ControlInstKind;

    fn linearize(s: &mut FuncSketch) -> Result<LinearizerStats, VectorizeError> {
        let config = VectorizerConfig::default();
        let cfg = ControlFlowGraph::compute(&s.func);
        let mut mask_ex = MaskExpander::new();
        let mut st = s.stage_cx();
        mask_ex.expand_region_masks(&mut st, &cfg);
        Linearizer::new(&config).run(&mut st, &mut mask_ex)
    }

    #[test]
    fn diamond_becomes_a_chain() {
        let mut s = FuncSketch::new(1);
        let [then_, else_, join] = s.blocks(["then", "else", "join"]);
        s.br_if(s.entry(), Value::Param(0), then_, else_);
        s.br(then_, join);
        s.br(else_, join);
        s.ret(join);

        let stats = linearize(&mut s).unwrap();
        assert_eq!(stats, LinearizerStats { regions: 1, blocks: 3, scalarized_calls: 0 });
        for block in s.func.layout.clone() {
            assert_ne!(s.func.blocks[block].terminator.kind, ControlInstKind::CondBranch);
        }
        assert_eq!(s.func.layout.len(), 4);
        assert_eq!(s.func.layout[0], s.entry());
        assert_eq!(s.func.layout[3], join);
    }

    #[test]
    fn uniform_branches_are_left_alone() {
        let mut s = FuncSketch::new(1);
        s.vinfo.set_shape(Value::Param(0), VectorShape::uni());
        let [then_, join] = s.blocks(["then", "join"]);
        s.br_if(s.entry(), Value::Param(0), then_, join);
        s.br(then_, join);
        s.ret(join);

        assert_eq!(linearize(&mut s).unwrap(), LinearizerStats::default());
        let terminator = &s.func.blocks[s.entry()].terminator;
        assert_eq!(terminator.kind, ControlInstKind::CondBranch);
        assert_eq!(terminator.targets[..], [then_, join]);
    }

    #[test]
    fn returns_in_both_arms_are_unsupported() {
        let mut s = FuncSketch::new(1);
        let [then_, else_] = s.blocks(["then", "else"]);
        s.br_if(s.entry(), Value::Param(0), then_, else_);
        s.ret(then_);
        s.ret(else_);

        let err = linearize(&mut s).unwrap_err();
        assert!(matches!(err, VectorizeError::UnsupportedBranch { block, .. } if block == s.entry()));
        assert!(err.is_recoverable());
    }

    #[test]
    fn cycles_between_arms_are_irreducible() {
        // `a` and `b` form a cycle that can be entered through either of them.
        let mut s = FuncSketch::new(3);
        for p in [1, 2] {
            s.vinfo.set_shape(Value::Param(p), VectorShape::uni());
        }
        let [a, b, join] = s.blocks(["a", "b", "join"]);
        s.br_if(s.entry(), Value::Param(0), a, b);
        s.br_if(a, Value::Param(1), b, join);
        s.br_if(b, Value::Param(2), a, join);
        s.ret(join);

        let err = linearize(&mut s).unwrap_err();
        assert!(matches!(err, VectorizeError::IrreducibleCycle { .. }), "{err}");
        assert!(!err.is_recoverable());
    }
}
