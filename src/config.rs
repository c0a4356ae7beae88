//! Configuration for Rollout.
//!
//! Settings come from command line flags, optionally layered on top of a YAML config file.
//! Flags win over the file, and the file wins over built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// Runs `sudo bash` with the host's logical name exported as `NODENAME`.
pub const DEFAULT_COMMAND: &str = "sudo bash -c 'export NODENAME={{name}}; ./{{script}}'";

#[derive(Parser, Debug, Default)]
#[command(version, about)]
pub struct Config {
    /// Script to copy to and execute on every host
    #[arg(long, short)]
    pub script: Option<String>,

    /// Remote SSH user
    #[arg(long, short)]
    pub user: Option<String>,

    /// Private key file used for SSH authentication
    #[arg(long, short)]
    pub key_file: Option<String>,

    /// Pending-host list, one `address,name` per line. Defaults to `hosts.txt`
    #[arg(long)]
    pub hosts_file: Option<PathBuf>,

    /// Append-only status log. Defaults to `status.log`
    #[arg(long)]
    pub status_log: Option<PathBuf>,

    /// Append-only log of completed hosts. Defaults to `done.log`
    #[arg(long)]
    pub done_log: Option<PathBuf>,

    /// SSH port to probe and connect to. Defaults to 22
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds to wait for the reachability probe. Defaults to 5
    #[arg(long)]
    pub probe_timeout: Option<u64>,

    /// Seconds to wait for SSH/SCP connections. Defaults to 30
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Seconds to sleep between rounds. Defaults to 5
    #[arg(long)]
    pub round_delay: Option<u64>,

    /// Upper bound on hosts handled at once. Unbounded if not given
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Remote command template ({{address}}, {{name}}, {{user}}, {{script}})
    #[arg(long)]
    pub command: Option<String>,

    /// YAML file with any of the settings above
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    pub verbose: bool,
}

/// The YAML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub script: Option<String>,
    pub user: Option<String>,
    pub key_file: Option<String>,
    pub hosts_file: Option<PathBuf>,
    pub status_log: Option<PathBuf>,
    pub done_log: Option<PathBuf>,
    pub port: Option<u16>,
    pub probe_timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub round_delay: Option<u64>,
    pub max_parallel: Option<usize>,
    pub command: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

/// Validated settings for a run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub script: PathBuf,
    pub user: String,
    pub key_file: PathBuf,
    pub hosts_file: PathBuf,
    pub status_log: PathBuf,
    pub done_log: PathBuf,
    pub port: u16,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub round_delay: Duration,
    pub max_parallel: Option<usize>,
    pub command: String,
}

impl Settings {
    /// Settings with every optional value at its default.
    pub fn new(
        script: impl Into<PathBuf>,
        user: impl Into<String>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            script: script.into(),
            user: user.into(),
            key_file: key_file.into(),
            hosts_file: "hosts.txt".into(),
            status_log: "status.log".into(),
            done_log: "done.log".into(),
            port: 22,
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            round_delay: Duration::from_secs(5),
            max_parallel: None,
            command: DEFAULT_COMMAND.to_string(),
        }
    }

    /// Merges the command line with the config file it names and validates the result.
    pub fn resolve(cli: Config) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    fn merge(cli: Config, file: FileConfig) -> Result<Self, ConfigError> {
        let script = required("script", cli.script.or(file.script))?;
        let user = required("user", cli.user.or(file.user))?;
        let key_file = required("key_file", cli.key_file.or(file.key_file))?;

        let mut settings = Self::new(script, user, key_file);
        if let Some(path) = cli.hosts_file.or(file.hosts_file) {
            settings.hosts_file = path;
        }
        if let Some(path) = cli.status_log.or(file.status_log) {
            settings.status_log = path;
        }
        if let Some(path) = cli.done_log.or(file.done_log) {
            settings.done_log = path;
        }
        if let Some(port) = cli.port.or(file.port) {
            settings.port = port;
        }
        if let Some(secs) = cli.probe_timeout.or(file.probe_timeout) {
            settings.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.connect_timeout.or(file.connect_timeout) {
            settings.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.round_delay.or(file.round_delay) {
            settings.round_delay = Duration::from_secs(secs);
        }
        settings.max_parallel = cli.max_parallel.or(file.max_parallel);
        if let Some(command) = cli.command.or(file.command) {
            settings.command = command;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the settings that cannot be expressed in their types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(n) = self.max_parallel {
            if n == 0 || n > Semaphore::MAX_PERMITS {
                return Err(ConfigError::Invalid {
                    field: "max_parallel",
                    reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
                });
            }
        }
        if self.script.file_name().is_none() {
            return Err(ConfigError::Invalid {
                field: "script",
                reason: format!("{} does not name a file", self.script.display()),
            });
        }
        self.command_registry()?;
        Ok(())
    }

    /// The script's file name, which is where `scp` puts it in the remote home directory.
    pub fn script_name(&self) -> String {
        self.script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// A Handlebars registry with the remote command template registered as [`COMMAND_TEMPLATE`].
    pub fn command_registry(&self) -> Result<Handlebars<'static>, ConfigError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        handlebars_misc_helpers::register(&mut registry);
        registry
            .register_template_string(COMMAND_TEMPLATE, &self.command)
            .map_err(Box::new)?;
        Ok(registry)
    }
}

/// Name of the remote command template inside [`Settings::command_registry`].
pub const COMMAND_TEMPLATE: &str = "command";

/// Parameters available to the remote command template.
#[derive(Debug, Serialize)]
pub struct CommandParams<'a> {
    pub address: &'a str,
    pub name: &'a str,
    pub user: &'a str,
    pub script: &'a str,
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(field)),
    }
}
