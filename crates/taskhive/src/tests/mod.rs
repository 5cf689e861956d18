pub mod server;
pub mod utils;
