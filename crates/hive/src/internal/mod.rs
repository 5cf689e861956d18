#[macro_use]
pub(crate) mod common;
pub mod messages;
pub mod scheduler;
pub mod server;
pub(crate) mod transfer;
pub mod worker;

#[cfg(test)]
pub mod tests;
