use hive::server::ServerRef;

use crate::server::event::streamer::EventStreamer;
use crate::stream::StreamHubRef;

pub mod autoalloc;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod engine_events;
pub mod event;
pub mod job;
pub(crate) mod restore;
pub mod state;
pub mod worker;

#[derive(Clone)]
pub struct Senders {
    pub server_ref: ServerRef,
    pub events: EventStreamer,
    pub streams: StreamHubRef,
}
