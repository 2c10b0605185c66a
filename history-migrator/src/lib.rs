pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod emit;
pub mod error;
pub mod job;
pub mod mapping;
pub mod metrics_consts;
pub mod source;
