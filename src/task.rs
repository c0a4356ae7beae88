//! One host's trip through a round.
//!
//! A host task probes the host, copies the script over, runs it, and reports. Every milestone is written
//! to the status log before the task moves on. Only a fully successful run is sent to the done log, which
//! is what takes the host off the pending list.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::ColoredString;
use colourado::Color;
use handlebars::Handlebars;
use tracing::{debug, error, info};

use crate::config::{CommandParams, Settings, COMMAND_TEMPLATE};
use crate::error::HostError;
use crate::host::Host;
use crate::journal::EventSender;
use crate::session::Remote;

/// Where a host task currently is.
#[derive(Debug)]
enum Stage {
    Init,
    Probing,
    Reachable,
    Copying,
    /// Carries the transfer output.
    Copied(String),
    Executing,
    /// Carries the remote output, one line per entry joined by commas.
    Executed(String),
}

/// How a host task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Completed,
    Failed(String),
}

/// Settings shared by every host task of a round.
pub struct TaskContext {
    pub remote: Arc<dyn Remote>,
    pub registry: Handlebars<'static>,
    pub script: PathBuf,
    pub script_name: String,
    pub user: String,
    pub probe_timeout: Duration,
}

impl TaskContext {
    pub fn new(settings: &Settings, remote: Arc<dyn Remote>, registry: Handlebars<'static>) -> Self {
        Self {
            remote,
            registry,
            script: settings.script.clone(),
            script_name: settings.script_name(),
            user: settings.user.clone(),
            probe_timeout: settings.probe_timeout,
        }
    }

    fn render_command(&self, host: &Host) -> Result<String, HostError> {
        let params = CommandParams {
            address: &host.address,
            name: &host.name,
            user: &self.user,
            script: &self.script_name,
        };
        Ok(self
            .registry
            .render(COMMAND_TEMPLATE, &params)
            .map_err(Box::new)?)
    }
}

pub struct HostTask {
    host: Host,
    colorhost: ColoredString,
    ctx: Arc<TaskContext>,
    status: EventSender,
    done: EventSender,
}

impl HostTask {
    pub fn new(
        host: Host,
        color: Color,
        ctx: Arc<TaskContext>,
        status: EventSender,
        done: EventSender,
    ) -> Self {
        let colorhost = host.prettify(color);
        Self {
            host,
            colorhost,
            ctx,
            status,
            done,
        }
    }

    /// Drives the host to completion or failure. A failure is recorded in the status log.
    pub async fn run(self) -> HostOutcome {
        match self.drive().await {
            Ok(()) => HostOutcome::Completed,
            Err(HostError::WriterGone) => {
                // Nothing left to report to; the orchestrator surfaces the writer's own error.
                error!("{} log writer went away", self.colorhost);
                HostOutcome::Failed(HostError::WriterGone.to_string())
            }
            Err(e) => {
                let detail = e.to_string();
                error!("{} {}", self.colorhost, detail);
                if self
                    .status
                    .send(&self.host, format!("error: {}", detail))
                    .await
                    .is_err()
                {
                    error!("{} failed to record the error above", self.colorhost);
                }
                HostOutcome::Failed(detail)
            }
        }
    }

    async fn drive(&self) -> Result<(), HostError> {
        let mut stage = Stage::Init;
        loop {
            debug!("{} {:?}", self.colorhost, stage);
            stage = match stage {
                Stage::Init => Stage::Probing,
                Stage::Probing => {
                    info!("{} trying to connect", self.colorhost);
                    self.ctx
                        .remote
                        .probe(&self.host, self.ctx.probe_timeout)
                        .await?;
                    Stage::Reachable
                }
                Stage::Reachable => {
                    info!("{} got ack for connection", self.colorhost);
                    Stage::Copying
                }
                Stage::Copying => {
                    info!("{} trying to copy script", self.colorhost);
                    let output = self.ctx.remote.copy(&self.host, &self.ctx.script).await?;
                    Stage::Copied(output)
                }
                Stage::Copied(output) => {
                    info!("{} script copied", self.colorhost);
                    self.status
                        .send(&self.host, format!("info: script copied: {}", output))
                        .await?;
                    Stage::Executing
                }
                Stage::Executing => {
                    let command = self.ctx.render_command(&self.host)?;
                    info!("{} trying to execute script", self.colorhost);
                    let lines = self
                        .ctx
                        .remote
                        .execute(&self.host, &self.colorhost, &command)
                        .await?;
                    Stage::Executed(lines.join(","))
                }
                Stage::Executed(output) => {
                    info!("{} script executed", self.colorhost);
                    self.status
                        .send(&self.host, format!("info: script ok: {}", output))
                        .await?;
                    self.done.send(&self.host, output).await?;
                    return Ok(());
                }
            };
        }
    }
}
