//! os-explode CLI - controller entry point and operator commands.

pub mod args;
pub mod commands;
pub mod logging;
