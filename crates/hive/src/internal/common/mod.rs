#[macro_use]
pub(crate) mod trace;

pub(crate) mod data_structures;
pub(crate) mod error;
pub(crate) mod ids;
pub(crate) mod index;
pub mod resources;
pub(crate) mod taskgroup;
pub(crate) mod utils;
pub(crate) mod wrapped;

pub use data_structures::{Map, Set, SortedVec};
pub use wrapped::WrappedRcRefCell;
