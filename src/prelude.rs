//! Shared imports and collection aliases.
//!
//! Hash-based collections use `FxHasher`; keys are script strings and
//! object addresses.

// ═══════════════════════════════════════════════════════════════════════════════
// Shared ownership
// ═══════════════════════════════════════════════════════════════════════════════

pub use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    rc::Rc,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Hash collections
// ═══════════════════════════════════════════════════════════════════════════════

pub use rustc_hash::{FxHashMap, FxHashSet};

/// Insertion-ordered map used for object property storage
pub type IndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Create an empty IndexMap
#[inline]
pub fn index_map_new<K, V>() -> IndexMap<K, V>
where
    K: std::hash::Hash + Eq,
{
    indexmap::IndexMap::with_hasher(Default::default())
}
