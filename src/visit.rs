//! Immutable IR traversal.

use crate::func_at::FuncAt;
use crate::{Block, ControlInst, FuncDefBody, FxIndexMap, Inst, InstDef, InstKind, Value};
use smallvec::SmallVec;

// FIXME `Sized` bound shouldn't be needed but removing it requires
// writing `impl Visitor<'a> + ?Sized` in `fn inner_visit_with` signatures.
pub trait Visitor<'a>: Sized {
    // Leaves (no default provided).
    fn visit_value_use(&mut self, v: &'a Value);

    // Leaves (noop default behavior).
    fn visit_block_use(&mut self, _block: Block) {}

    // Non-leaves (defaulting to calling `.inner_visit_with(self)`).
    fn visit_block_def(&mut self, func_at_block: FuncAt<'a, Block>) {
        func_at_block.inner_visit_with(self);
    }
    fn visit_inst_def(&mut self, func_at_inst: FuncAt<'a, Inst>) {
        func_at_inst.def().inner_visit_with(self);
    }
    fn visit_control_inst(&mut self, func_at_block: FuncAt<'a, Block>) {
        func_at_block.def().terminator.inner_visit_with(self);
    }
}

/// Trait implemented on "deeply visitable" types, to further "explore" a type
/// by visiting its "interior" (i.e. variants and/or fields).
pub trait InnerVisit {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>);
}

impl InnerVisit for FuncDefBody {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        for &block in &self.layout {
            visitor.visit_block_def(self.at(block));
        }
    }
}

impl<'a> FuncAt<'a, Block> {
    pub fn inner_visit_with(self, visitor: &mut impl Visitor<'a>) {
        for func_at_inst in self.at_insts() {
            visitor.visit_inst_def(func_at_inst);
        }
        visitor.visit_control_inst(self);
    }
}

impl InnerVisit for InstDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { kind, inputs, output_type: _, mask, block: _ } = self;

        if let InstKind::Phi { incoming } = kind {
            for &pred in incoming {
                visitor.visit_block_use(pred);
            }
        }
        for v in inputs {
            visitor.visit_value_use(v);
        }
        if let Some(mask) = mask {
            visitor.visit_value_use(mask);
        }
    }
}

impl InnerVisit for ControlInst {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { kind: _, inputs, targets } = self;

        for v in inputs {
            visitor.visit_value_use(v);
        }
        for &target in targets {
            visitor.visit_block_use(target);
        }
    }
}

/// Something that can use a [`Value`]: an instruction (through its inputs or
/// its mask), or a block's terminator.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum User {
    Inst(Inst),
    Terminator(Block),
}

impl User {
    /// The block the use happens in (for phis, this is the phi's own block,
    /// not the incoming predecessor).
    pub fn block(self, func: &FuncDefBody) -> Block {
        match self {
            User::Inst(inst) => func.insts[inst].block,
            User::Terminator(block) => block,
        }
    }
}

/// Snapshot of all the uses of every [`Value`] in a function, collected in one
/// traversal (in layout order), and not kept up to date by later mutation.
#[derive(Default)]
pub struct UseMap {
    pub users: FxIndexMap<Value, SmallVec<[User; 4]>>,
}

impl UseMap {
    pub fn compute(func: &FuncDefBody) -> Self {
        struct UseCollector {
            current_user: Option<User>,
            uses: UseMap,
        }

        impl<'a> Visitor<'a> for UseCollector {
            fn visit_value_use(&mut self, v: &'a Value) {
                let Some(user) = self.current_user else { return };
                let users = self.uses.users.entry(*v).or_default();
                // NOTE a user that uses the same value several times is
                // only recorded once (rewriting it handles all of its uses).
                if users.last() != Some(&user) {
                    users.push(user);
                }
            }
            fn visit_inst_def(&mut self, func_at_inst: FuncAt<'a, Inst>) {
                self.current_user = Some(User::Inst(func_at_inst.position));
                func_at_inst.def().inner_visit_with(self);
            }
            fn visit_control_inst(&mut self, func_at_block: FuncAt<'a, Block>) {
                self.current_user = Some(User::Terminator(func_at_block.position));
                func_at_block.def().terminator.inner_visit_with(self);
            }
        }

        let mut collector = UseCollector { current_user: None, uses: UseMap::default() };
        func.inner_visit_with(&mut collector);
        collector.uses
    }

    pub fn users_of(&self, v: Value) -> &[User] {
        self.users.get(&v).map_or(&[][..], |users| &users[..])
    }

    pub fn num_users(&self, v: Value) -> usize {
        self.users_of(v).len()
    }
}
