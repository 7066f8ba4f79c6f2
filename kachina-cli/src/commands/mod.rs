//! Subcommand implementations

pub mod extract;
pub mod gen;
pub mod install;
pub mod pack;
