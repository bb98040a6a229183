//! # Service Layer
//!
//! The TCP side of the engine.
//!
//! ## Components
//! - **Server**: [`VoteListener`] binds, applies admission control and owns
//!   the shared listener context
//! - **Connection**: drives one session per accepted socket
//! - **Client**: sender side, for tests and relaying

pub mod client;
pub(crate) mod connection;
pub mod server;

pub use client::{send_v1_vote, send_v2_vote, VoteClient};
pub use server::VoteListener;
