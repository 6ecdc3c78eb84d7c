//! Spectre CLI: configuration resolution, event parsing and operator commands.

pub mod commands;
pub mod config;
pub mod events;

pub use config::{load_config, resolve_config_path};
