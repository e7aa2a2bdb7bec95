//! Unstructured control-flow graph (CFG) abstractions and utilities.

use crate::{Block, EntityOrientedDenseMap, FuncDefBody};
use itertools::Either;
use smallvec::SmallVec;

/// The control-flow graph (CFG) of a function, as seen from its entry, i.e.
/// successors/predecessors of every reachable [`Block`], and a reverse
/// post-order (RPO) of all reachable blocks.
///
/// Unreachable blocks are treated as absent (no successors/predecessors),
/// and never appear as predecessors of reachable blocks either.
#[derive(Clone)]
pub struct ControlFlowGraph {
    entry: Block,

    succs: EntityOrientedDenseMap<Block, SmallVec<[Block; 2]>>,
    preds: EntityOrientedDenseMap<Block, SmallVec<[Block; 4]>>,

    rpo: Vec<Block>,
    rpo_index: EntityOrientedDenseMap<Block, u32>,
}

pub struct TraversalState<PreVisit: FnMut(Block), PostVisit: FnMut(Block)> {
    pub visited: EntityOrientedDenseMap<Block, ()>,
    pub pre_order_visit: PreVisit,
    pub post_order_visit: PostVisit,

    // FIXME should this be a generic parameter for "targets iterator"?
    pub reverse_targets: bool,
}

impl ControlFlowGraph {
    pub fn compute(func: &FuncDefBody) -> Self {
        let mut cfg = Self {
            entry: func.entry,
            succs: EntityOrientedDenseMap::new(),
            preds: EntityOrientedDenseMap::new(),
            rpo: vec![],
            rpo_index: EntityOrientedDenseMap::new(),
        };

        let mut post_order = vec![];
        Self::traverse(
            func,
            func.entry,
            &mut TraversalState {
                visited: EntityOrientedDenseMap::new(),

                pre_order_visit: |_| {},
                post_order_visit: |block| post_order.push(block),

                // NOTE this doesn't impact semantics, but combined with
                // the final reversal, it should keep targets in the original
                // order in the cases when they didn't get deduplicated.
                reverse_targets: true,
            },
        );
        cfg.rpo = post_order.into_iter().rev().collect();

        for (i, &block) in cfg.rpo.iter().enumerate() {
            cfg.rpo_index.insert(block, i.try_into().unwrap());
        }
        for &block in &cfg.rpo {
            let mut succs = SmallVec::<[Block; 2]>::new();
            for &target in &func.blocks[block].terminator.targets {
                if !succs.contains(&target) {
                    succs.push(target);
                }
            }
            for &succ in &succs {
                let preds = cfg.preds.entry(succ).get_or_insert_with(SmallVec::new);
                if !preds.contains(&block) {
                    preds.push(block);
                }
            }
            cfg.succs.insert(block, succs);
        }

        cfg
    }

    /// Depth-first traversal of the CFG reachable from `block`, calling the
    /// pre/post-order visit callbacks of `state` exactly once per block.
    pub fn traverse(
        func: &FuncDefBody,
        block: Block,
        state: &mut TraversalState<impl FnMut(Block), impl FnMut(Block)>,
    ) {
        if state.visited.insert(block, ()).is_some() {
            return;
        }

        (state.pre_order_visit)(block);

        let targets = func.blocks[block].terminator.targets.iter().copied();
        let targets = if state.reverse_targets {
            Either::Left(targets.rev())
        } else {
            Either::Right(targets)
        };
        for target in targets {
            Self::traverse(func, target, state);
        }

        (state.post_order_visit)(block);
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    /// All reachable [`Block`]s, in reverse post-order (RPO).
    ///
    /// RPO iteration over a CFG provides certain guarantees, most importantly
    /// that dominators are visited before the entire subgraph they dominate.
    pub fn rev_post_order(&self) -> &[Block] {
        &self.rpo
    }

    pub fn rpo_index(&self, block: Block) -> Option<usize> {
        self.rpo_index.get(block).map(|&i| i as usize)
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.rpo_index.contains_key(block)
    }

    /// Deduplicated successors of `block`, in terminator target order.
    pub fn succs(&self, block: Block) -> &[Block] {
        self.succs.get(block).map_or(&[][..], |succs| &succs[..])
    }

    /// Deduplicated (reachable) predecessors of `block`, in RPO order.
    pub fn preds(&self, block: Block) -> &[Block] {
        self.preds.get(block).map_or(&[][..], |preds| &preds[..])
    }
}
