//! # Core Components
//!
//! Message models and the framing codec.
//!
//! ## Components
//! - **Vote**: the normalized vote record handed to downstream handlers
//! - **Envelope**: V2 envelope/payload structures and their canonical form
//! - **Codec**: Tokio codec that negotiates the protocol and extracts one frame
//!
//! ## Wire Format
//! ```text
//! V1: [RSA block (modulus bytes)]
//! V2: [Magic 0x73 0x3A] [Length u16 BE] [JSON envelope (Length)]
//! ```
//!
//! ## Security
//! - V2 frame length is checked against the configured ceiling before any
//!   body bytes are buffered
//! - Exactly one frame is read per connection

pub mod codec;
pub mod envelope;
pub mod vote;
