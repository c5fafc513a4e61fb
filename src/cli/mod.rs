//! Command-line interface for chat-queue.
//!
//! Provides the `serve` command plus small store clients for submitting
//! tasks and inspecting the queue.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, Cli, Commands, RetryArgs, ServeArgs, StatsArgs, StatusArgs,
    StoreArgs, SubmitArgs,
};
