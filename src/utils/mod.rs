//! # Utility Modules
//!
//! Supporting utilities for cryptography, key handling, flood protection,
//! logging and timing.
//!
//! ## Components
//! - **Crypto**: RSA block codec and HMAC-SHA256 token verification
//! - **Keys**: Key pair persistence and the V2 token table
//! - **Rate Limit**: Per-address connection/vote ceilings
//! - **Replay Cache**: TTL-based ledger of retired challenges
//! - **Metrics**: Thread-safe per-listener counters
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (OS source via getrandom/rand_core)
//! - Constant-time signature comparison (subtle)
//! - Memory zeroing for token secrets (zeroize crate)

pub mod crypto;
pub mod keys;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod replay_cache;
pub mod timeout;

// Re-export public types for advanced users
pub use keys::{KeyMaterial, RsaKeyPair};
pub use rate_limit::{Admission, RateLimitState};
pub use replay_cache::ReplayCache;
