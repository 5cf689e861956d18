pub mod env;
pub mod resources;
pub mod schedule;
pub mod task;

pub fn sorted_vec<T: Ord>(mut vec: Vec<T>) -> Vec<T> {
    vec.sort();
    vec
}

pub fn enable_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
