//! Shared domain library for the refund orchestrator
//!
//! Pure, non-async building blocks used by `refund-server` and its tests:
//! error kinds and the API error envelope, exact money arithmetic, and the
//! refund quote algorithm.

pub mod error;
pub mod money;
pub mod quote;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};
