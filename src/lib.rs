pub mod batch;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod converter;
pub mod detect;
pub mod error;
pub mod executor;
pub mod extract;
pub mod format;
pub mod job;
pub mod util;
pub mod validate;
