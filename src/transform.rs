//! Mutable IR traversal.

use crate::visit::{UseMap, User};
use crate::{Block, ControlInst, FuncDefBody, InstDef, InstKind, Value};
use rustc_hash::FxHashMap;

/// The result of a transformation (which is not in-place).
#[must_use]
#[derive(Copy, Clone)]
pub enum Transformed<T> {
    /// The original `T` value remains as it was, at no cost.
    Unchanged,

    /// Some part of the original `T` value was transformed, and a new `T` value
    /// had to be constructed. This change will propagate in any "outer" value.
    Changed(T),
}

impl<T> Transformed<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Transformed<U> {
        match self {
            Transformed::Unchanged => Transformed::Unchanged,
            Transformed::Changed(new) => Transformed::Changed(f(new)),
        }
    }

    pub fn apply_to(self, dest: &mut T) {
        match self {
            Transformed::Unchanged => {}
            Transformed::Changed(new) => *dest = new,
        }
    }
}

// FIXME `Sized` bound shouldn't be needed but removing it requires
// writing `impl Transformer + ?Sized` in `fn inner_transform_with` signatures.
pub trait Transformer: Sized {
    // Leaves (noop default behavior).
    fn transform_value_use(&mut self, _v: &Value) -> Transformed<Value> {
        Transformed::Unchanged
    }
    fn transform_block_use(&mut self, _block: Block) -> Transformed<Block> {
        Transformed::Unchanged
    }
}

/// Trait implemented on "deeply transformable" types, to further "explore" a
/// type by transforming its "interior" (i.e. variants and/or fields), in place.
pub trait InnerInPlaceTransform {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer);
}

impl InnerInPlaceTransform for InstDef {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        let Self { kind, inputs, output_type: _, mask, block: _ } = self;

        if let InstKind::Phi { incoming } = kind {
            for pred in incoming {
                transformer.transform_block_use(*pred).apply_to(pred);
            }
        }
        for v in inputs {
            transformer.transform_value_use(v).apply_to(v);
        }
        if let Some(mask) = mask {
            transformer.transform_value_use(mask).apply_to(mask);
        }
    }
}

impl InnerInPlaceTransform for ControlInst {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        let Self { kind: _, inputs, targets } = self;

        for v in inputs {
            transformer.transform_value_use(v).apply_to(v);
        }
        for target in targets {
            transformer.transform_block_use(*target).apply_to(target);
        }
    }
}

impl InnerInPlaceTransform for FuncDefBody {
    fn inner_in_place_transform_with(&mut self, transformer: &mut impl Transformer) {
        for i in 0..self.layout.len() {
            let block = self.layout[i];
            self.transform_user_with(User::Terminator(block), transformer);
            for j in 0..self.blocks[block].insts.len() {
                let inst = self.blocks[block].insts[j];
                self.insts[inst].inner_in_place_transform_with(transformer);
            }
        }
    }
}

/// [`Transformer`] replacing [`Value`]s according to a map (values not in the
/// map are left unchanged).
pub struct ReplaceValues<'a>(pub &'a FxHashMap<Value, Value>);

impl Transformer for ReplaceValues<'_> {
    fn transform_value_use(&mut self, v: &Value) -> Transformed<Value> {
        match self.0.get(v) {
            Some(&new) => Transformed::Changed(new),
            None => Transformed::Unchanged,
        }
    }
}

/// [`Transformer`] replacing [`Value`]s and [`Block`]s according to maps,
/// e.g. to retarget a cloned instruction to the clones of its operands.
pub struct Remap<'a> {
    pub values: &'a FxHashMap<Value, Value>,
    pub blocks: &'a FxHashMap<Block, Block>,
}

impl Transformer for Remap<'_> {
    fn transform_value_use(&mut self, v: &Value) -> Transformed<Value> {
        ReplaceValues(self.values).transform_value_use(v)
    }
    fn transform_block_use(&mut self, block: Block) -> Transformed<Block> {
        match self.blocks.get(&block) {
            Some(&new) => Transformed::Changed(new),
            None => Transformed::Unchanged,
        }
    }
}

/// [`Transformer`] replacing a single [`Value`].
pub struct ReplaceValue {
    pub old: Value,
    pub new: Value,
}

impl Transformer for ReplaceValue {
    fn transform_value_use(&mut self, v: &Value) -> Transformed<Value> {
        if *v == self.old { Transformed::Changed(self.new) } else { Transformed::Unchanged }
    }
}

impl FuncDefBody {
    pub fn transform_user_with(&mut self, user: User, transformer: &mut impl Transformer) {
        match user {
            User::Inst(inst) => self.insts[inst].inner_in_place_transform_with(transformer),
            User::Terminator(block) => {
                self.blocks[block].terminator.inner_in_place_transform_with(transformer);
            }
        }
    }

    /// Rewrite all current uses of `old` to `new`, for which `filter` returns
    /// `true` (use sites are snapshotted before anything is rewritten).
    pub fn replace_uses_where(
        &mut self,
        old: Value,
        new: Value,
        mut filter: impl FnMut(&FuncDefBody, User) -> bool,
    ) {
        let this = &*self;
        let users: Vec<User> = UseMap::compute(this)
            .users_of(old)
            .iter()
            .copied()
            .filter(|&user| filter(this, user))
            .collect();
        for user in users {
            self.transform_user_with(user, &mut ReplaceValue { old, new });
        }
    }

    /// Rewrite all current uses of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) {
        self.inner_in_place_transform_with(&mut ReplaceValue { old, new });
    }
}
