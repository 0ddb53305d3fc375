//! # llmbot relay
//!
//! Relays chat prompts to several third-party chat services behind one
//! serialized entry point.
//!
//! ## Layers
//!
//! - [`transport`]: WebSocket framing per backend dialect, keepalive
//! - [`bootstrap`] and [`session`]: conversation setup with retry, expiring
//!   session handles
//! - [`reconciler`]: folds streamed fragments into one [`ChatExchange`]
//! - [`backends`]: one adapter per service
//! - [`dispatcher`]: FIFO turn, slash commands, routing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llmbot_config::RelayConfig;
//! use llmbot_relay::{ChatOptions, Dispatcher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::from_config(&RelayConfig::load(None)?)?;
//! let reply = dispatcher.chat("hello", ChatOptions::default()).await;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backends;
pub mod bootstrap;
pub mod command;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod html;
pub mod imaging;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod transport;
pub mod turn;

pub use backends::{ChatBackend, ChatRequest, NetworkSettings};
pub use command::SlashCommand;
pub use context::RelayContext;
pub use dispatcher::{ChatOptions, Dispatcher, RelayState};
pub use error::{RelayError, Result};
pub use reconciler::{ChatExchange, Fragment, Observer, Phase, Reconciler, NO_RESPONSE};
pub use registry::BackendRegistry;
pub use session::{SessionHandle, SessionSlot};
