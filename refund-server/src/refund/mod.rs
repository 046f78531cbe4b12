//! Refund computation and execution
//!
//! `quote` normalizes history into the pure algorithm's inputs, `engine`
//! derives batch amounts and drives the per-leg protocol, `legacy` is the
//! single-top-up full refund, `trace` records the forensic computation trail.

pub mod engine;
pub mod legacy;
pub mod quote;
pub mod trace;
