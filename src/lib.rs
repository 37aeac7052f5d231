pub mod api;
pub mod backend;
pub mod chunks;
pub mod constants;
pub mod disconnect;
pub mod executor;
pub mod fallback;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod metrics;
pub mod rate_limit;
pub mod recovery_cache;
pub mod redaction;
pub mod registry;
pub mod resolver;
pub mod retention;
pub mod str_utils;
pub mod summary;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
