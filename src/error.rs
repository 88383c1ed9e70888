#[cfg(feature = "live")]
use std::sync::mpsc::RecvError;

pub use anyhow::Error as ActionError;
use thiserror::Error;

/// Errors reported while declaring tasks or resolving the task graph.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task '{0}' is already registered")]
    DuplicateName(Box<str>),

    #[error("Task '{0}' would create a dependency cycle")]
    Cycle(Box<str>),

    #[error("Parallel group '{0}' contains tasks that depend on one another")]
    GroupCycle(Box<str>),

    #[error("Unknown task '{0}'")]
    UnknownTask(Box<str>),
}

#[derive(Debug, Error)]
pub enum KumadeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error while clearing the output directory:\n{0}")]
    Clear(#[from] ClearError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

#[derive(Debug, Error)]
pub enum ClearError {
    #[error("Couldn't remove the old output directory.\n{0}")]
    Remove(std::io::Error),

    #[error("Couldn't create the output directory.\n{0}")]
    Create(std::io::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't reserve a port for the live reload socket.\n{0}")]
    Bind(std::io::Error),

    #[error(transparent)]
    Recv(#[from] RecvError),
}
