//! Core orchestration engine for RepoPilot.
//!
//! This module contains the scheduling and execution core: the task model,
//! the persistent state layer, the rate limiter, the multi-project queue,
//! the per-project pollers, the worker pool, the result handler, and the
//! supervisor that wires them together.

pub mod queue;
pub mod rate_limit;
pub mod result_handler;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod worker;
