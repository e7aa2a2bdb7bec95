//! [`Context`](struct.Context.html) and related types/traits.

use crate::{ConstDef, TypeDef};
use elsa::FrozenIndexSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Context object with global resources for the IR.
///
/// Those resources currently are:
/// * interners, for anything without an identity, and which can be deduplicated
///   (i.e. [`Type`]s, [`Const`]s and [`InternedStr`]s)
///
/// Entities ([`Func`](crate::Func), [`Block`](crate::Block), [`Inst`](crate::Inst))
/// are instead allocated by their owners (see [`EntityDefs`]), as their handles
/// are only meaningful within those owners.
//
// NOTE `Context: !Sync` because of the interners, sharing between
// modules is done through `Rc<Context>`.
#[derive(Default)]
pub struct Context {
    interners: Interners,
}

struct Interners {
    strs: FrozenIndexSet<Box<str>>,
    types: FrozenIndexSet<Box<TypeDef>>,
    consts: FrozenIndexSet<Box<ConstDef>>,
}

impl Default for Interners {
    fn default() -> Self {
        Self {
            strs: FrozenIndexSet::new(),
            types: FrozenIndexSet::new(),
            consts: FrozenIndexSet::new(),
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern<T: InternInCx<Output = I>, I>(&self, x: T) -> I {
        x.intern_in_cx(self)
    }
}

/// Values which can be interned in a [`Context`], producing a handle.
pub trait InternInCx {
    type Output;

    fn intern_in_cx(self, cx: &Context) -> Self::Output;
}

macro_rules! interners {
    ($($field:ident: $name:ident => $def:ty),+ $(,)?) => {
        $(
            #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
            pub struct $name(u32);

            impl Index<$name> for Context {
                type Output = $def;

                fn index(&self, interned: $name) -> &Self::Output {
                    &self.interners.$field[interned.0 as usize]
                }
            }
        )+
    };
}

interners! {
    strs: InternedStr => str,
    types: Type => TypeDef,
    consts: Const => ConstDef,
}

impl InternInCx for &'_ str {
    type Output = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        let (idx, _) = cx.interners.strs.insert_full(self.into());
        InternedStr(idx.try_into().unwrap())
    }
}

impl InternInCx for String {
    type Output = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        cx.intern(&self[..])
    }
}

impl InternInCx for TypeDef {
    type Output = Type;

    fn intern_in_cx(self, cx: &Context) -> Type {
        let (idx, _) = cx.interners.types.insert_full(Box::new(self));
        Type(idx.try_into().unwrap())
    }
}

impl InternInCx for ConstDef {
    type Output = Const;

    fn intern_in_cx(self, cx: &Context) -> Const {
        let (idx, _) = cx.interners.consts.insert_full(Box::new(self));
        Const(idx.try_into().unwrap())
    }
}

/// Dense entity handles, i.e. a `u32` index into some [`EntityDefs`].
pub trait Entity: Copy + Eq + Hash + 'static {
    type Def;

    fn from_idx(idx: usize) -> Self;
    fn idx(self) -> usize;
}

macro_rules! entities {
    ($($(#[$attr:meta])* $name:ident => $def:ty, $prefix:literal;)+) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
            pub struct $name(u32);

            impl Entity for $name {
                type Def = $def;

                fn from_idx(idx: usize) -> Self {
                    Self(idx.try_into().unwrap())
                }
                fn idx(self) -> usize {
                    self.0 as usize
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        )+
    };
}

entities! {
    /// Function handle, owned by a [`Module`](crate::Module).
    Func => crate::FuncDecl, "func";
    /// Basic block handle, owned by a [`FuncDefBody`](crate::FuncDefBody).
    Block => crate::BlockDef, "block";
    /// Instruction handle, owned by a [`FuncDefBody`](crate::FuncDefBody).
    Inst => crate::InstDef, "v";
}

/// Definitions for all the entities of one type (`E`), owned by the same parent.
///
/// Entities are never removed, only detached from whatever refers to them
/// (e.g. an [`Inst`] removed from its block's list stays defined here).
pub struct EntityDefs<E: Entity> {
    defs: Vec<E::Def>,
}

impl<E: Entity> Clone for EntityDefs<E>
where
    E::Def: Clone,
{
    fn clone(&self) -> Self {
        Self { defs: self.defs.clone() }
    }
}

impl<E: Entity> Default for EntityDefs<E> {
    fn default() -> Self {
        Self { defs: vec![] }
    }
}

impl<E: Entity> EntityDefs<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: E::Def) -> E {
        let entity = E::from_idx(self.defs.len());
        self.defs.push(def);
        entity
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// All entities defined so far, in definition order.
    pub fn keys(&self) -> impl DoubleEndedIterator<Item = E> + use<E> {
        (0..self.defs.len()).map(E::from_idx)
    }
}

impl<E: Entity> Index<E> for EntityDefs<E> {
    type Output = E::Def;

    fn index(&self, entity: E) -> &E::Def {
        &self.defs[entity.idx()]
    }
}

impl<E: Entity> IndexMut<E> for EntityDefs<E> {
    fn index_mut(&mut self, entity: E) -> &mut E::Def {
        &mut self.defs[entity.idx()]
    }
}

/// Map with `K` keys and `V` values, that is:
/// * "entity-oriented" `K` keys, i.e. dense entity handles
/// * "dense" in the sense of storing values in a `Vec` indexed by the entity,
///   which works best when most entities get a value
///
/// There is no iteration, callers that need an order keep their own list of
/// keys (e.g. a CFG's reverse post-order).
#[derive(Clone, Debug)]
pub struct EntityOrientedDenseMap<K: Entity, V> {
    values: Vec<Option<V>>,
    _marker: PhantomData<K>,
}

impl<K: Entity, V> Default for EntityOrientedDenseMap<K, V> {
    fn default() -> Self {
        Self { values: vec![], _marker: PhantomData }
    }
}

impl<K: Entity, V> EntityOrientedDenseMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `key`, growing the map if needed.
    pub fn entry(&mut self, key: K) -> &mut Option<V> {
        let idx = key.idx();
        if idx >= self.values.len() {
            self.values.resize_with(idx + 1, || None);
        }
        &mut self.values[idx]
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entry(key).replace(value)
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.values.get(key.idx())?.as_ref()
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.values.get_mut(key.idx())?.as_mut()
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        self.values.get_mut(key.idx())?.take()
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }
}

impl<K: Entity, V> Index<K> for EntityOrientedDenseMap<K, V> {
    type Output = V;

    fn index(&self, key: K) -> &V {
        self.get(key).expect("no entry found for key")
    }
}

impl<K: Entity, V> IndexMut<K> for EntityOrientedDenseMap<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        self.get_mut(key).expect("no entry found for key")
    }
}
