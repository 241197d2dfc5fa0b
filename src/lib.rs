#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod channels;
pub mod cli;
pub mod config;
pub mod data;
pub mod debounce;
pub mod entries;
pub mod feeds;
pub mod models;
pub mod preview;
pub mod session;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use cli::run;
