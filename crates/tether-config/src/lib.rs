//! Configuration for the tether service and its clients.
//!
//! Settings persist to disk as RON files, can be overridden from the command
//! line via clap, and support reload detection. Unknown or missing fields fall
//! back to defaults so older and newer files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE_NAME, Config, ContentConfig, DebugConfig, NetworkConfig, ServiceConfig};
pub use error::ConfigError;
