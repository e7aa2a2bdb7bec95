//! Dominator and post-dominator trees.
//!
//! Both are computed with the iterative algorithm from "A Simple, Fast
//! Dominance Algorithm" (Cooper, Harvey and Kennedy), over nodes numbered in
//! reverse post-order, which makes the "intersect" step a simple walk up the
//! (partial) tree, comparing RPO numbers.

use crate::cf::ControlFlowGraph;
use crate::{Block, ControlInstKind, EntityOrientedDenseMap, FuncDefBody};
use smallvec::SmallVec;

/// Compute immediate dominators for nodes `0..preds.len()`, numbered in RPO
/// (i.e. `0` is the root, and every node's RPO predecessors have smaller numbers,
/// except along backedges).
fn compute_idoms(preds: &[SmallVec<[usize; 4]>]) -> Vec<Option<usize>> {
    let mut idoms = vec![None; preds.len()];
    if idoms.is_empty() {
        return idoms;
    }
    idoms[0] = Some(0);

    let intersect = |idoms: &[Option<usize>], mut a: usize, mut b: usize| {
        while a != b {
            while a > b {
                a = idoms[a].unwrap();
            }
            while b > a {
                b = idoms[b].unwrap();
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for node in 1..preds.len() {
            let mut new_idom = None;
            for &pred in &preds[node] {
                if idoms[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(other) => intersect(&idoms, pred, other),
                });
            }
            if new_idom.is_some() && idoms[node] != new_idom {
                idoms[node] = new_idom;
                changed = true;
            }
        }
    }
    idoms
}

/// Walk up `idom` links from `b`, looking for `a`.
fn is_ancestor(
    idom: &EntityOrientedDenseMap<Block, Block>,
    numbering: &EntityOrientedDenseMap<Block, u32>,
    a: Block,
    b: Block,
) -> bool {
    let (Some(&a_idx), Some(_)) = (numbering.get(a), numbering.get(b)) else {
        return false;
    };
    let mut node = b;
    loop {
        if node == a {
            return true;
        }
        // Ancestors always have smaller numbers, no need to keep walking.
        if numbering[node] < a_idx {
            return false;
        }
        match idom.get(node) {
            Some(&parent) => node = parent,
            None => return false,
        }
    }
}

#[derive(Clone)]
pub struct DominatorTree {
    idom: EntityOrientedDenseMap<Block, Block>,
    rpo_index: EntityOrientedDenseMap<Block, u32>,
}

impl DominatorTree {
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let rpo = cfg.rev_post_order();
        let preds: Vec<SmallVec<[usize; 4]>> = rpo
            .iter()
            .map(|&block| cfg.preds(block).iter().filter_map(|&p| cfg.rpo_index(p)).collect())
            .collect();
        let idoms = compute_idoms(&preds);

        let mut tree =
            Self { idom: EntityOrientedDenseMap::new(), rpo_index: EntityOrientedDenseMap::new() };
        for (i, &block) in rpo.iter().enumerate() {
            tree.rpo_index.insert(block, i.try_into().unwrap());
            if let Some(idom) = idoms[i].filter(|&idom| idom != i) {
                tree.idom.insert(block, rpo[idom]);
            }
        }
        tree
    }

    /// Immediate dominator of `block` (`None` for the entry, or unreachable blocks).
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.idom.get(block).copied()
    }

    /// Whether every path from the entry to `b` goes through `a` (including `a == b`).
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        is_ancestor(&self.idom, &self.rpo_index, a, b)
    }

    pub fn strictly_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.dominates(a, b)
    }
}

/// Post-dominator tree, rooted in a virtual exit node that all blocks ending
/// in `ret` or `unreachable` flow into.
///
/// Blocks that can't reach any such exit (e.g. infinite loops) are absent.
#[derive(Clone)]
pub struct PostDominatorTree {
    ipdom: EntityOrientedDenseMap<Block, Block>,
    numbering: EntityOrientedDenseMap<Block, u32>,
}

impl PostDominatorTree {
    pub fn compute(func: &FuncDefBody, cfg: &ControlFlowGraph) -> Self {
        let is_exit = |block: Block| {
            matches!(
                func.blocks[block].terminator.kind,
                ControlInstKind::Return | ControlInstKind::Unreachable
            )
        };

        // Post-order of the reverse CFG, starting at the virtual exit, with
        // an explicit stack (of `(block, next_pred_idx)`) instead of recursion.
        let mut post_order = vec![];
        let mut visited = EntityOrientedDenseMap::<Block, ()>::new();
        let exits: SmallVec<[Block; 4]> =
            cfg.rev_post_order().iter().copied().filter(|&b| is_exit(b)).collect();
        for &exit in &exits {
            if visited.insert(exit, ()).is_some() {
                continue;
            }
            let mut stack = vec![(exit, 0)];
            while let Some((block, next)) = stack.last_mut() {
                let block = *block;
                match cfg.preds(block).get(*next) {
                    Some(&pred) => {
                        *next += 1;
                        if visited.insert(pred, ()).is_none() {
                            stack.push((pred, 0));
                        }
                    }
                    None => {
                        post_order.push(block);
                        stack.pop();
                    }
                }
            }
        }

        // Node `0` is the virtual exit, `1..` are blocks in reverse-CFG RPO.
        let order: Vec<Block> = post_order.into_iter().rev().collect();
        let mut numbering = EntityOrientedDenseMap::new();
        for (i, &block) in order.iter().enumerate() {
            numbering.insert(block, u32::try_from(i + 1).unwrap());
        }
        let mut preds = vec![SmallVec::new()];
        preds.extend(order.iter().map(|&block| {
            let mut reverse_preds: SmallVec<[usize; 4]> =
                cfg.succs(block).iter().filter_map(|&s| numbering.get(s)).map(|&i| i as usize).collect();
            if is_exit(block) {
                reverse_preds.push(0);
            }
            reverse_preds
        }));
        let idoms = compute_idoms(&preds);

        let mut ipdom = EntityOrientedDenseMap::new();
        for (i, &block) in order.iter().enumerate() {
            if let Some(idom) = idoms[i + 1].filter(|&idom| idom != 0) {
                ipdom.insert(block, order[idom - 1]);
            }
        }
        Self { ipdom, numbering }
    }

    /// Immediate post-dominator of `block` (`None` if that's the virtual exit,
    /// i.e. no single block is on every path from `block` to the exits).
    pub fn ipdom(&self, block: Block) -> Option<Block> {
        self.ipdom.get(block).copied()
    }

    /// Whether every path from `b` to the function's exits goes through `a`.
    pub fn post_dominates(&self, a: Block, b: Block) -> bool {
        is_ancestor(&self.ipdom, &self.numbering, a, b)
    }
}
