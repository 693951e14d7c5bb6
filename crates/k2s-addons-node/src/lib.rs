//! Node-side collaborators for addon export and import.
//!
//! The packaging engine never talks to a container runtime or package
//! manager itself. It goes through three narrow traits: `ImageArchiver`
//! (export: save images to archive files), `ImageLoader` (import: load those
//! archives on a node), and `PackageInstaller` (import: install OS packages).
//! `CommandNode` drives them through configurable command templates;
//! `MockNode` records calls for tests.

pub mod backend;
pub mod command;
pub mod mock;

pub use backend::{
    archive_file_name, ImageArchiver, ImageLoader, LinuxPackages, NodeOs, PackageInstaller,
    PackageSet, WindowsPackages,
};
pub use command::{CommandNode, NodeCommands};
pub use mock::MockNode;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command '{command}' failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("invalid command template '{0}'")]
    InvalidTemplate(String),
    #[error("no {0} command configured")]
    NotConfigured(&'static str),
    #[error("no archive for image '{image}' at {}", path.display())]
    MissingArchive { image: String, path: PathBuf },
    #[error("{0}")]
    Rejected(String),
}
