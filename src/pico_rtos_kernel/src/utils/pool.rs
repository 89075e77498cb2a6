//! Provides `Pool`, an arena of kernel objects addressed by generational
//! identifiers.
use core::{fmt, marker::PhantomData};
use slab::Slab;

/// The untyped payload of an object identifier.
///
/// `gen` distinguishes objects that happen to reuse the same slot, so a
/// stale identifier is rejected instead of silently referring to a newer
/// object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawId {
    index: u32,
    gen: u32,
}

impl fmt::Debug for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.gen)
    }
}

/// Implemented by the typed identifiers defined by [`define_id!`].
pub(crate) trait PoolId: Copy {
    fn from_raw(raw: RawId) -> Self;
    fn raw(self) -> RawId;
}

/// Define a typed object identifier.
macro_rules! define_id {
    (
        $( #[$meta:meta] )*
        $vis:vis struct $name:ident;
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name($crate::utils::pool::RawId);

        impl $crate::utils::pool::PoolId for $name {
            #[inline]
            fn from_raw(raw: $crate::utils::pool::RawId) -> Self {
                Self(raw)
            }

            #[inline]
            fn raw(self) -> $crate::utils::pool::RawId {
                self.0
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }
    };
}

struct Slot<T> {
    gen: u32,
    value: T,
}

/// An arena of `T` addressed by `I`.
pub(crate) struct Pool<I, T> {
    slab: Slab<Slot<T>>,
    next_gen: u32,
    _id: PhantomData<fn() -> I>,
}

impl<I: PoolId, T> Pool<I, T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            next_gen: 0,
            _id: PhantomData,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> I {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1);
        let index = self.slab.insert(Slot { gen, value });
        I::from_raw(RawId {
            index: index as u32,
            gen,
        })
    }

    pub(crate) fn get(&self, id: I) -> Option<&T> {
        let raw = id.raw();
        match self.slab.get(raw.index as usize) {
            Some(slot) if slot.gen == raw.gen => Some(&slot.value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: I) -> Option<&mut T> {
        let raw = id.raw();
        match self.slab.get_mut(raw.index as usize) {
            Some(slot) if slot.gen == raw.gen => Some(&mut slot.value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: I) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        Some(self.slab.remove(id.raw().index as usize).value)
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.slab.iter().map(|(index, slot)| {
            (
                I::from_raw(RawId {
                    index: index as u32,
                    gen: slot.gen,
                }),
                &slot.value,
            )
        })
    }
}

impl<I: PoolId + fmt::Debug, T: fmt::Debug> fmt::Debug for Pool<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<I, T> core::ops::Index<I> for Pool<I, T>
where
    I: PoolId + fmt::Debug,
{
    type Output = T;

    #[track_caller]
    fn index(&self, id: I) -> &T {
        match self.get(id) {
            Some(x) => x,
            None => panic!("dangling object id {:?}", id),
        }
    }
}

impl<I, T> core::ops::IndexMut<I> for Pool<I, T>
where
    I: PoolId + fmt::Debug,
{
    #[track_caller]
    fn index_mut(&mut self, id: I) -> &mut T {
        // `get_mut` borrows `self` for the whole function if it succeeds, so
        // check first
        if !self.contains(id) {
            panic!("dangling object id {:?}", id);
        }
        let index = id.raw().index as usize;
        &mut self.slab[index].value
    }
}
