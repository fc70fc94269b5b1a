//! buildmesh node library.
//!
//! This library provides the components of the `buildmesh-node` binary:
//! argument parsing, configuration loading, signal handling and the
//! subcommand runners. It is also used by tests.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
