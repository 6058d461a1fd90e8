//! Desktop automation assistant: built-in agents, the composition root that
//! wires the orchestration backbone together, and the CLI.

pub mod agents;
pub mod app;
pub mod cli;

pub use app::App;
