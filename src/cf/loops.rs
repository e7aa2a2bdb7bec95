//! Natural loop discovery (nesting, latches, preheaders, exits).

use crate::cf::{ControlFlowGraph, DominatorTree};
use crate::{Block, ControlInstKind, EntityOrientedDenseMap, FuncDefBody, FxIndexMap, FxIndexSet};
use smallvec::SmallVec;

/// Minimal loop analysis, based on Tarjan's SCC (strongly connected components)
/// algorithm, applied recursively (for every level of loop nesting).
///
/// Here "minimal" means that each loops is the smallest CFG subgraph possible
/// (excluding any control-flow paths that cannot reach a backedge and cycle),
/// i.e. each loop is a CFG SCC (strongly connected component), with its
/// "SCC root" (the first node reached by the depth-first traversal) as header.
///
/// For reducible CFGs, the SCC roots are exactly the natural loop headers (and
/// dominate their whole loop body), anything else is flagged by [`LoopInfo`].
struct LoopFinder<'a> {
    cfg: &'a ControlFlowGraph,

    /// Every loop header, with all the blocks in its SCC (itself included,
    /// in the order they were first reached).
    loop_header_to_body: FxIndexMap<Block, Vec<Block>>,

    /// SCC accumulation stack, where CFG nodes collect during the depth-first
    /// traversal, and are only popped when their "SCC root" (loop header) is
    /// (note that multiple SCCs on the stack does *not* indicate SCC nesting,
    /// but rather a path between two SCCs, i.e. a loop *following* another).
    scc_stack: Vec<Block>,
    /// Per-CFG-node traversal state (often just pointing to a `scc_stack` slot).
    scc_state: EntityOrientedDenseMap<Block, SccState>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SccStackIdx(u32);

#[derive(Copy, Clone, PartialEq, Eq)]
enum SccState {
    /// CFG node has been reached and ended up somewhere on the `scc_stack`,
    /// where it will remain until the SCC it's part of will be completed.
    Pending(SccStackIdx),

    /// CFG node had been reached once, but is no longer on the `scc_stack`, its
    /// parent SCC having been completed (or it wasn't in an SCC to begin with).
    Complete,
}

impl<'a> LoopFinder<'a> {
    fn new(cfg: &'a ControlFlowGraph) -> Self {
        Self {
            cfg,
            loop_header_to_body: FxIndexMap::default(),
            scc_stack: vec![],
            scc_state: EntityOrientedDenseMap::new(),
        }
    }

    /// Returns a map from every loop header to its body (including any nested
    /// loops), in the control-flow (sub)graph starting at `entry`.
    fn find_all_loops_starting_at(mut self, entry: Block) -> FxIndexMap<Block, Vec<Block>> {
        self.find_earliest_scc_root_of(entry);
        self.loop_header_to_body
    }

    /// Tarjan's SCC algorithm works by computing the "earliest" reachable node,
    /// from every node (often using the name `lowlink`), which will be equal
    /// to the origin node itself iff that node is an "SCC root" (loop header),
    /// and always point to an "earlier" node if a cycle (via loop backedge) was
    /// found from somewhere else in the SCC (i.e. from inside the loop body).
    ///
    /// Here we track stack indices (as the stack order is the traversal order),
    /// and distinguish the acyclic case to avoid treating most nodes as self-loops.
    fn find_earliest_scc_root_of(&mut self, node: Block) -> Option<SccStackIdx> {
        let state_entry = self.scc_state.entry(node);
        if let Some(state) = *state_entry {
            return match state {
                SccState::Pending(scc_stack_idx) => Some(scc_stack_idx),
                SccState::Complete => None,
            };
        }
        let scc_stack_idx = SccStackIdx(self.scc_stack.len().try_into().unwrap());
        self.scc_stack.push(node);
        *state_entry = Some(SccState::Pending(scc_stack_idx));

        let earliest_scc_root = self
            .cfg
            .succs(node)
            .iter()
            .filter_map(|&target| self.find_earliest_scc_root_of(target))
            .min();

        // If this node has been chosen as the root of an SCC, complete that SCC.
        if earliest_scc_root == Some(scc_stack_idx) {
            let scc_start = scc_stack_idx.0 as usize;

            self.loop_header_to_body.insert(node, self.scc_stack[scc_start..].to_vec());

            // Find nested loops by marking *only* the loop header as complete,
            // clearing loop body nodes' state, and recursing on them: all the
            // nodes outside the loop (otherwise reachable from within), and the
            // loop header itself, are already marked as complete, meaning that
            // all exits and backedges will be ignored, and the recursion will
            // only find more SCCs within the loop body (i.e. nested loops).
            self.scc_state[node] = SccState::Complete;
            let loop_body_range = scc_start + 1..self.scc_stack.len();
            for &scc_node in &self.scc_stack[loop_body_range.clone()] {
                self.scc_state.remove(scc_node);
            }
            for i in loop_body_range.clone() {
                self.find_earliest_scc_root_of(self.scc_stack[i]);
            }
            assert_eq!(self.scc_stack.len(), loop_body_range.end);

            // Remove the entire SCC from the accumulation stack all at once.
            self.scc_stack.truncate(scc_start);

            return None;
        }

        // Not actually in an SCC at all, just some node outside any CFG cycles.
        if earliest_scc_root.is_none() {
            assert!(self.scc_stack.pop() == Some(node));
            self.scc_state[node] = SccState::Complete;
        }

        earliest_scc_root
    }
}

/// Index of a loop in its [`LoopInfo`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LoopId(u32);

#[derive(Clone, Debug)]
pub struct LoopData {
    pub header: Block,

    /// All blocks in the loop (including nested loops), header first.
    pub blocks: FxIndexSet<Block>,

    /// In-loop predecessors of the header (i.e. sources of backedges).
    pub latches: SmallVec<[Block; 2]>,

    /// Out-of-loop predecessors of the header.
    pub entering: SmallVec<[Block; 2]>,

    /// `(exiting, exit)` edges, from a block in the loop to one outside it.
    pub exit_edges: SmallVec<[(Block, Block); 2]>,

    pub parent: Option<LoopId>,
    pub depth: u32,

    /// Whether the header dominates every block of the loop (always the case
    /// for natural loops, `false` means an irreducible cycle).
    pub reducible: bool,
}

impl LoopData {
    pub fn contains(&self, block: Block) -> bool {
        self.blocks.contains(&block)
    }

    /// The single latch, if there's exactly one.
    pub fn latch(&self) -> Option<Block> {
        match self.latches[..] {
            [latch] => Some(latch),
            _ => None,
        }
    }

    /// The dedicated preheader: the only entering block, which only branches
    /// to the header.
    pub fn preheader(&self, func: &FuncDefBody) -> Option<Block> {
        let [pre] = self.entering[..] else { return None };
        let terminator = &func.blocks[pre].terminator;
        (terminator.kind == ControlInstKind::Branch && terminator.targets[..] == [self.header])
            .then_some(pre)
    }

    /// Unique exit blocks (targets of exit edges), in discovery order.
    pub fn exit_blocks(&self) -> FxIndexSet<Block> {
        self.exit_edges.iter().map(|&(_, exit)| exit).collect()
    }
}

/// All the natural loops of a function (at every nesting level).
#[derive(Clone, Default)]
pub struct LoopInfo {
    loops: Vec<LoopData>,

    /// Innermost loop containing each block.
    innermost: EntityOrientedDenseMap<Block, LoopId>,
}

impl LoopInfo {
    pub fn compute(cfg: &ControlFlowGraph, dom: &DominatorTree) -> Self {
        let header_to_body = LoopFinder::new(cfg).find_all_loops_starting_at(cfg.entry());

        // Outer loops are always found before the loops nested in them, so
        // parents always have smaller `LoopId`s than their children.
        let mut info = LoopInfo::default();
        for (&header, body) in &header_to_body {
            let blocks: FxIndexSet<Block> = body.iter().copied().collect();
            let (latches, entering) =
                cfg.preds(header).iter().copied().partition(|pred| blocks.contains(pred));
            let exit_edges = blocks
                .iter()
                .flat_map(|&block| {
                    cfg.succs(block).iter().map(move |&succ| (block, succ))
                })
                .filter(|&(_, succ)| !blocks.contains(&succ))
                .collect();
            let reducible = blocks.iter().all(|&block| dom.dominates(header, block));

            let id = LoopId(info.loops.len().try_into().unwrap());
            let parent = info.innermost.get(header).copied();
            let depth = parent.map_or(1, |parent| info.loops[parent.0 as usize].depth + 1);
            for &block in &blocks {
                info.innermost.insert(block, id);
            }
            info.loops.push(LoopData {
                header,
                blocks,
                latches,
                entering,
                exit_edges,
                parent,
                depth,
                reducible,
            });
        }
        info
    }

    pub fn ids(&self) -> impl DoubleEndedIterator<Item = LoopId> + use<> {
        (0..self.loops.len()).map(|i| LoopId(i as u32))
    }

    /// All loops, inner loops always before the loops containing them.
    pub fn inner_to_outer(&self) -> impl Iterator<Item = LoopId> + use<> {
        let mut ids: Vec<_> = self.ids().collect();
        ids.sort_by_key(|&id| std::cmp::Reverse(self[id].depth));
        ids.into_iter()
    }

    pub fn innermost_loop_of(&self, block: Block) -> Option<LoopId> {
        self.innermost.get(block).copied()
    }

    pub fn loop_with_header(&self, header: Block) -> Option<LoopId> {
        self.innermost_loop_of(header).filter(|&id| self[id].header == header)
    }

    pub fn is_loop_header(&self, block: Block) -> bool {
        self.loop_with_header(block).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

impl std::ops::Index<LoopId> for LoopInfo {
    type Output = LoopData;

    fn index(&self, id: LoopId) -> &LoopData {
        &self.loops[id.0 as usize]
    }
}
