//! Control-flow analyses over a [`FuncDefBody`](crate::FuncDefBody)'s CFG.
//
// NOTE all the analyses here are snapshots: any CFG mutation (new blocks,
// retargeted terminators) requires recomputing them, see `CfgAnalyses`.

use crate::FuncDefBody;

// NOTE all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod dominance;
pub mod graph;
pub mod loops;

pub use dominance::{DominatorTree, PostDominatorTree};
pub use graph::ControlFlowGraph;
pub use loops::{LoopData, LoopId, LoopInfo};

/// All the CFG analyses the vectorizer depends on, computed together.
#[derive(Clone)]
pub struct CfgAnalyses {
    pub cfg: ControlFlowGraph,
    pub dom: DominatorTree,
    pub post_dom: PostDominatorTree,
    pub loops: LoopInfo,
}

impl CfgAnalyses {
    pub fn compute(func: &FuncDefBody) -> Self {
        let cfg = ControlFlowGraph::compute(func);
        let dom = DominatorTree::compute(&cfg);
        let post_dom = PostDominatorTree::compute(func, &cfg);
        let loops = LoopInfo::compute(&cfg, &dom);
        Self { cfg, dom, post_dom, loops }
    }
}
