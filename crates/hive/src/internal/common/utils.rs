use std::fmt::Display;

/// Checks at compile-time that the given type $ty has the corresponding $size.
///
/// It can be used to prevent performance-critical data structures to grow in size unexpectedly.
#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: [(); $size] = [(); ::std::mem::size_of::<$ty>()];
    };
}

pub fn format_comma_delimited<I: IntoIterator<Item = T>, T: Display>(items: I) -> String {
    let mut result = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            result.push(',');
        }
        result.push_str(&item.to_string());
    }
    result
}

pub fn has_unique_elements<T: Eq + std::hash::Hash>(items: impl IntoIterator<Item = T>) -> bool {
    let mut seen = crate::Set::default();
    items.into_iter().all(|item| seen.insert(item))
}
