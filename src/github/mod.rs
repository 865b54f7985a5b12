//! Upstream Actions service client module
//!
//! Provides an HTTP client for the GitHub Actions service: scale-set
//! registration, just-in-time runner configs, and the long-poll message
//! session the scaler consumes, with automatic retry and exponential
//! backoff on transient failures.

mod client;
mod errors;
mod session;
mod types;

pub use client::ActionsClient;
pub use errors::{ApiError, ApiResult};
pub use session::MessageSession;
pub use types::*;
