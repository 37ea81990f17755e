//! Integration tests driving the public API with fake collaborators.

mod common;
mod parallel_execution;
mod run_lifecycle;
