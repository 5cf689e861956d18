use std::hash::Hash;

use fxhash::FxBuildHasher;

/// Engine maps are keyed by small integer ids, which FxHash handles well.
pub type Map<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, FxBuildHasher>;

pub trait SortedVec<T> {
    /// Elements in ascending order, for output that has to be deterministic.
    fn to_sorted_vec(&self) -> Vec<T>;
}

impl<T: Eq + Hash + Copy + Ord> SortedVec<T> for Set<T> {
    fn to_sorted_vec(&self) -> Vec<T> {
        let mut result: Vec<T> = self.iter().copied().collect();
        result.sort_unstable();
        result
    }
}
