//! Build step of a Slipway deployment.
//!
//! [`select_builder`] inspects a working copy and picks the first matching
//! builder; [`Builder::build`] turns the working copy into an artifact tree in
//! an output directory, streaming tool output to a deployment [`Logger`].
//!
//! [`Logger`]: slipway_store::Logger

pub mod builder;
pub mod command;
pub mod copy;
pub mod detect;

pub use builder::{
    BuildOutcome, BuildProperties, Builder, BuilderKind, CompiledProjectBuilder, CopyBuilder,
    CustomBuilder, NodeBuilder, PythonBuilder, BUILD_TARGETS_PATH, COMMIT_ID, DEPLOYER,
};
pub use copy::copy_tree;
pub use detect::{select_builder, BuildSettings, DeploymentFile, DEPLOYMENT_FILE};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with code {}", code.map_or_else(|| "signal".to_owned(), |c| c.to_string()))]
    ExitCode { command: String, code: Option<i32> },
    #[error("invalid {DEPLOYMENT_FILE} file: {0}")]
    InvalidDeploymentFile(String),
    #[error("project path not found: {}", .0.display())]
    ProjectNotFound(PathBuf),
    #[error("more than one project file in {}: {}", dir.display(), candidates.join(", "))]
    AmbiguousProject {
        dir: PathBuf,
        candidates: Vec<String>,
    },
}
