//! External services integration for RepoPilot.
//!
//! This module contains integrations with the two upstream collaborators:
//! the GitHub REST API the daemon polls and reports back to, and the AI
//! command-line tool that executes each task in a child process.

pub mod ai;
pub mod github;
