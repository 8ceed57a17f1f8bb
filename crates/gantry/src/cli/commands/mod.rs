//! CLI commands

mod publish;

pub use publish::PublishCommand;
