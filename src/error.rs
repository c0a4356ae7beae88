use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the configuration surface. All of these are fatal before any work starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'{0}' is required and cannot be empty")]
    Missing(&'static str),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Failed to parse command template: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),
}

/// Failures talking to a single remote host.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("unable to reach node: {0}")]
    Unreachable(String),
    #[error("failed to copy script: {0}")]
    Copy(String),
    #[error("ssh cmd failed: {status}: {output}")]
    Execute { status: String, output: String },
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommand(#[from] io::Error),
}

/// Anything that ends one host's attempt for the current round.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("failed to render remote command: {0}")]
    Render(#[from] Box<handlebars::RenderError>),
    #[error("log writer went away before acknowledging")]
    WriterGone,
}

/// Errors that abort the whole run.
#[derive(Error, Debug)]
pub enum RolloutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Malformed record at {}:{line}: {record:?}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        record: String,
    },
    #[error("Failed to {action} {}: {source}", path.display())]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Writer task died: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

impl RolloutError {
    pub(crate) fn storage(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            action,
            path: path.into(),
            source,
        }
    }
}
