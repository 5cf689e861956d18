pub mod core;
pub mod resources;
pub mod scheduler;
