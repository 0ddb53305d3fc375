//! # llmbot configuration
//!
//! Type-safe configuration for the llmbot chat relay.
//!
//! ## Features
//!
//! - TOML file at `$XDG_CONFIG_HOME/llmbot/config.toml` (or an explicit path)
//! - Environment overrides for credentials (`BING_COOKIE`, `POE_COOKIE`, ...)
//! - Per-backend sections with defaults resolved through accessor methods
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llmbot_config::RelayConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::load(None)?;
//!     println!("default model: {}", config.dispatcher.default_model());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod components;
mod loader;

pub use components::*;
pub use loader::*;
