//! Task output received from workers, buffered for clients that attach to it.

pub mod hub;

pub use hub::{AttachedStream, StreamHubRef, StreamKey};
