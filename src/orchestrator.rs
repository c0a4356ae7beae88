//! The round loop.
//!
//! Each round reads the pending-host list, spawns the two log owners and one task per pending host,
//! and waits for every host task before closing the logs. Rounds repeat until the list is empty.

use std::sync::Arc;

use colourado::{ColorPalette, PaletteType};
use futures::future::{join_all, try_join};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::RolloutError;
use crate::host::HostList;
use crate::journal::{self, AppendLog};
use crate::session::Remote;
use crate::task::{HostOutcome, HostTask, TaskContext};

/// What a single round did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The pending-host list was empty; nothing was started.
    Drained,
    Ran(RoundSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub completed: usize,
    pub failed: usize,
}

pub struct Rollout {
    settings: Settings,
    hosts: HostList,
    ctx: Arc<TaskContext>,
}

impl Rollout {
    pub fn new(settings: Settings, remote: Arc<dyn Remote>) -> Result<Self, RolloutError> {
        settings.validate()?;
        let registry = settings.command_registry()?;
        let ctx = Arc::new(TaskContext::new(&settings, remote, registry));
        let hosts = HostList::new(&settings.hosts_file);
        Ok(Self {
            settings,
            hosts,
            ctx,
        })
    }

    /// Runs rounds until every host is done. Returns the number of rounds that did work.
    pub async fn run(&self) -> Result<usize, RolloutError> {
        let mut round = 1;
        loop {
            match self.run_round(round).await? {
                RoundOutcome::Drained => {
                    info!("[Rollout] all hosts done after {} round(s)", round - 1);
                    return Ok(round - 1);
                }
                RoundOutcome::Ran(summary) => {
                    info!(
                        "[Rollout] round {} finished: {} completed, {} failed",
                        round, summary.completed, summary.failed
                    );
                }
            }
            // Don't spam unreachable hosts with reconnects.
            tokio::time::sleep(self.settings.round_delay).await;
            round += 1;
        }
    }

    /// Runs one round over whatever is currently pending.
    pub async fn run_round(&self, round: usize) -> Result<RoundOutcome, RolloutError> {
        let hosts = self.hosts.load_all()?;
        if hosts.is_empty() {
            return Ok(RoundOutcome::Drained);
        }
        info!("[Rollout] round {}: {} host(s) pending", round, hosts.len());

        let status_log = AppendLog::open(&self.settings.status_log)?;
        let done_log = AppendLog::open(&self.settings.done_log)?;

        // Each channel closes once the last host task drops its sender, which ends the owner loop.
        let (status_tx, status_rx) = journal::channel();
        let (done_tx, done_rx) = journal::channel();
        let status_writer = tokio::spawn(journal::status_writer(status_log, status_rx));
        let done_writer =
            tokio::spawn(journal::done_writer(done_log, self.hosts.clone(), done_rx));

        let limit = self.settings.max_parallel.map(|n| Arc::new(Semaphore::new(n)));
        let colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false).colors;
        let mut tasks: Vec<JoinHandle<HostOutcome>> = Vec::with_capacity(hosts.len());
        for (host, color) in hosts.into_iter().zip(colors) {
            let task = HostTask::new(
                host,
                color,
                Arc::clone(&self.ctx),
                status_tx.clone(),
                done_tx.clone(),
            );
            let limit = limit.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = match limit {
                    Some(limit) => limit.acquire_owned().await.ok(),
                    None => None,
                };
                task.run().await
            }));
        }
        drop(status_tx);
        drop(done_tx);

        // Resolves early only if an owner fails. Otherwise it finishes once every sender is gone.
        let owners = try_join(owned(status_writer), owned(done_writer));
        tokio::pin!(owners);
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        let hosts_done = join_all(tasks);
        tokio::pin!(hosts_done);

        let mut owners_finished = false;
        let outcomes = tokio::select! {
            biased;
            outcomes = &mut hosts_done => outcomes,
            result = &mut owners => match result {
                Err(e) => {
                    error!("[Rollout] aborting round {}: {}", round, e);
                    aborts.iter().for_each(|task| task.abort());
                    return Err(e);
                }
                Ok(_) => {
                    owners_finished = true;
                    hosts_done.await
                }
            },
        };
        if !owners_finished {
            owners.await?;
        }

        let mut summary = RoundSummary::default();
        for outcome in outcomes {
            match outcome {
                Ok(HostOutcome::Completed) => summary.completed += 1,
                Ok(HostOutcome::Failed(_)) => summary.failed += 1,
                Err(e) => {
                    error!("[Rollout] host task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }
        Ok(RoundOutcome::Ran(summary))
    }
}

async fn owned(handle: JoinHandle<Result<(), RolloutError>>) -> Result<(), RolloutError> {
    handle.await?
}
