//! # votifier-protocol
//!
//! Vote-reception engine for server-list "vote" notifications.
//!
//! A [`VoteListener`] accepts TCP connections, greets each one, reads a
//! single vote frame in either wire protocol, authenticates it and hands the
//! resulting [`Vote`] to a [`VoteSink`] (usually an [`EventDispatcher`]).
//!
//! ## Protocols
//! - **V1**: one RSA PKCS#1 v1.5 block holding newline-separated fields
//! - **V2**: length-prefixed JSON signed with HMAC-SHA256 under a named
//!   token, answering a per-connection challenge
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use votifier_protocol::{EventDispatcher, VoteListener, VotifierConfig};
//!
//! # async fn run() -> votifier_protocol::Result<()> {
//! let dispatcher = Arc::new(EventDispatcher::new());
//! dispatcher.register_handler(|vote| {
//!     println!("{vote}");
//!     Ok(())
//! })?;
//!
//! let mut config = VotifierConfig::from_file("votifier.toml")?;
//! let listener = VoteListener::from_config(&mut config, dispatcher).await?;
//! // ...
//! listener.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure handling
//! A failed exchange ends only its own connection. The peer sees a closed
//! socket; the failure kind ([`DecodeError`]) goes to the listener's
//! [`Metrics`](utils::metrics::Metrics) and the `tracing` log.

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use crate::config::VotifierConfig;
pub use crate::core::vote::Vote;
pub use crate::error::{DecodeError, HandlerError, ProtocolError, Result};
pub use crate::protocol::dispatcher::{
    EventDispatcher, ForwardingSink, HandlerId, VoteQueue, VoteSink,
};
pub use crate::protocol::ProtocolVersion;
pub use crate::service::VoteListener;
pub use crate::utils::keys::KeyMaterial;
