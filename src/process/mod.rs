//! Remote process management: tree inspection, cascading kill and
//! command launching.

pub mod runner;
pub mod tree;

pub use runner::{parse_command, CommandRunner, ParsedCommand, Role};
pub use tree::{default_inspector, kill_tree, ProcessInspector, ProcessNode};
