#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod checker;
pub mod constants;
pub mod db;
pub mod engine;
pub mod failover;
pub mod history_pruning;
pub mod i18n;
pub mod logging;
pub mod main_helper;
pub mod projections;
pub mod redaction;
pub mod session;
pub mod specs;
pub mod sse;
pub mod store;
pub mod str_utils;
pub mod streaming;
pub mod token_counting;
pub mod transport;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
