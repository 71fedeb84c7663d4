//! Command-line interface for scopewire
//!
//! This module contains CLI argument parsing and configuration

pub mod args;

pub use args::{Args, Command, ConfigureArgs, DemoArgs, RecordArgs, ServerArgs, Switch};
