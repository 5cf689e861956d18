pub mod multinode;
pub mod queue;
pub mod state;
