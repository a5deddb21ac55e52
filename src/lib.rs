//! Durable, resumable workflows that drive AI coding agents.
//!
//! A run moves through named steps (implement, review, fix, pr) under a
//! transition table, checkpointing after every transition. Agents are
//! external CLIs run as subprocesses, throttled by a shared rate-limit
//! coordinator and fanned out by a bounded executor.

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod ratelimit;
pub mod steps;
pub mod workflow;

pub use error::{BatonError, Result};
