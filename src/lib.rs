pub mod config;
pub mod env;
pub mod envexec;
pub mod filestore;
pub mod queue;
pub mod worker;
