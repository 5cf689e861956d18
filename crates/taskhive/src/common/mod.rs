pub mod access;
pub mod arraydef;
pub mod env;
pub mod error;
pub mod parser;
pub mod serialization;
pub mod setup;
pub mod timeutils;
