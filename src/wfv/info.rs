//! Vectorization regions and the shared per-function vectorization state.

use crate::cf::LoopData;
use crate::wfv::VectorShape;
use crate::{Block, EntityOrientedDenseMap, FuncDefBody, FxIndexSet, Value};
use rustc_hash::FxHashMap;

/// The part of a function being vectorized: an entry [`Block`], and every
/// block reachable from it without going through one of the region's exits.
#[derive(Clone, Debug)]
pub struct Region {
    entry: Block,
    blocks: FxIndexSet<Block>,
}

impl Region {
    /// Region of all the blocks reachable from `entry` without passing
    /// through any of `exits` (which are themselves excluded).
    pub fn new(func: &FuncDefBody, entry: Block, exits: impl IntoIterator<Item = Block>) -> Self {
        let exits: FxIndexSet<Block> = exits.into_iter().collect();

        let mut blocks = FxIndexSet::default();
        let mut queue = vec![entry];
        while let Some(block) = queue.pop() {
            if exits.contains(&block) || !blocks.insert(block) {
                continue;
            }
            queue.extend(func.blocks[block].terminator.targets.iter().rev().copied());
        }
        Self { entry, blocks }
    }

    pub fn whole_function(func: &FuncDefBody) -> Self {
        Self::new(func, func.entry, [])
    }

    /// The body of a loop (e.g. the outer loop being vectorized).
    pub fn for_loop(loop_data: &LoopData) -> Self {
        Self { entry: loop_data.header, blocks: loop_data.blocks.clone() }
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    pub fn contains(&self, block: Block) -> bool {
        self.blocks.contains(&block)
    }

    pub fn blocks(&self) -> impl ExactSizeIterator<Item = Block> + '_ {
        self.blocks.iter().copied()
    }

    /// Register a block created inside the region (e.g. by scalarization).
    pub fn add_block(&mut self, block: Block) {
        self.blocks.insert(block);
    }
}

/// Shapes of values, divergence of blocks, and block predicates, for the
/// function (or [`Region`]) being vectorized with a given vector width.
///
/// Values without a recorded shape read as [`VectorShape::Undef`] (which is
/// never uniform), constants are always uniform, and blocks without a
/// recorded divergence are divergent. That is, missing information is always
/// the conservatively correct answer.
#[derive(Clone, Debug)]
pub struct VectorizationInfo {
    vector_width: u32,

    /// `None` means whole-function vectorization.
    region: Option<Region>,

    shapes: FxHashMap<Value, VectorShape>,
    divergent_blocks: EntityOrientedDenseMap<Block, bool>,

    /// Final per-block predicates, once materialized by the mask expander.
    predicates: EntityOrientedDenseMap<Block, Value>,
}

impl VectorizationInfo {
    pub fn new(vector_width: u32, region: Option<Region>) -> Self {
        Self {
            vector_width,
            region,
            shapes: FxHashMap::default(),
            divergent_blocks: EntityOrientedDenseMap::new(),
            predicates: EntityOrientedDenseMap::new(),
        }
    }

    pub fn vector_width(&self) -> u32 {
        self.vector_width
    }

    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn region_mut(&mut self) -> Option<&mut Region> {
        self.region.as_mut()
    }

    /// The entry of the region, or of the whole function.
    pub fn entry(&self, func: &FuncDefBody) -> Block {
        self.region.as_ref().map_or(func.entry, |region| region.entry)
    }

    pub fn in_region(&self, block: Block) -> bool {
        self.region.as_ref().is_none_or(|region| region.contains(block))
    }

    /// Whether `v` is an instruction output defined inside the region.
    pub fn defined_in_region(&self, func: &FuncDefBody, v: Value) -> bool {
        match v {
            Value::InstOutput(inst) => self.in_region(func.insts[inst].block),
            Value::Const(_) | Value::Param(_) => false,
        }
    }

    pub fn shape(&self, v: Value) -> VectorShape {
        match v {
            Value::Const(_) => VectorShape::uni(),
            _ => self.shapes.get(&v).copied().unwrap_or_default(),
        }
    }

    pub fn set_shape(&mut self, v: Value, shape: VectorShape) {
        self.shapes.insert(v, shape);
    }

    /// Forget the shape of `v` (making it [`VectorShape::Undef`] again).
    pub fn drop_shape(&mut self, v: Value) {
        self.shapes.remove(&v);
    }

    pub fn is_uniform(&self, v: Value) -> bool {
        self.shape(v).is_uniform()
    }

    pub fn is_divergent(&self, block: Block) -> bool {
        self.divergent_blocks.get(block).copied().unwrap_or(true)
    }

    pub fn set_divergent(&mut self, block: Block, divergent: bool) {
        self.divergent_blocks.insert(block, divergent);
    }

    pub fn predicate(&self, block: Block) -> Option<Value> {
        self.predicates.get(block).copied()
    }

    pub fn set_predicate(&mut self, block: Block, mask: Value) {
        self.predicates.insert(block, mask);
    }

    /// Update predicates after `old` was replaced with `new` in the IR.
    pub fn remap_predicates(&mut self, blocks: impl IntoIterator<Item = Block>, old: Value, new: Value) {
        for block in blocks {
            if let Some(pred) = self.predicates.get_mut(block).filter(|pred| **pred == old) {
                *pred = new;
            }
        }
    }
}
