pub mod common;
pub mod worker;
