//! Append-only logs and the tasks that own them.
//!
//! Every mutable file has exactly one owner task per round. Host tasks never touch the files; they send
//! an [`Event`] to the owner and wait for its acknowledgment, which arrives only after the line has been
//! appended (and, for completions, after the host has been dropped from the pending list).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{HostError, RolloutError};
use crate::host::{Host, HostList};

/// One line to record, plus the handle used to acknowledge it.
#[derive(Debug)]
pub struct Event {
    pub host: Host,
    pub text: String,
    ack: oneshot::Sender<()>,
}

/// The sending half of an owner task's inbox.
#[derive(Debug, Clone)]
pub struct EventSender(flume::Sender<Event>);

pub type EventReceiver = flume::Receiver<Event>;

/// Creates the inbox of an owner task.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = flume::unbounded();
    (EventSender(tx), rx)
}

impl EventSender {
    /// Queues an event and blocks until the owner has durably written it.
    pub async fn send(&self, host: &Host, text: impl Into<String>) -> Result<(), HostError> {
        let (ack, acked) = oneshot::channel();
        let event = Event {
            host: host.clone(),
            text: text.into(),
            ack,
        };
        self.0
            .send_async(event)
            .await
            .map_err(|_| HostError::WriterGone)?;
        acked.await.map_err(|_| HostError::WriterGone)
    }
}

/// An append-only `address,name,text` log file.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: File,
}

impl AppendLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RolloutError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RolloutError::storage("open log file", &path, e))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line with a single write and syncs it to disk.
    pub fn append(&mut self, host: &Host, text: &str) -> Result<(), RolloutError> {
        let line = format!("{},{},{}\n", host.address, host.name, one_line(text));
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| RolloutError::storage("append to", &self.path, e))
    }
}

/// Keeps a record on a single line.
fn one_line(text: &str) -> String {
    text.trim_end()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

/// Owner loop for the status log. Runs until every sender has been dropped.
pub async fn status_writer(mut log: AppendLog, inbox: EventReceiver) -> Result<(), RolloutError> {
    while let Ok(event) = inbox.recv_async().await {
        log.append(&event.host, &event.text)?;
        let _ = event.ack.send(());
    }
    debug!("exiting status writer for {}", log.path().display());
    Ok(())
}

/// Owner loop for the done log. Also owns the pending-host list: a completed host is recorded as done
/// strictly before it is removed from the list, and only then acknowledged.
pub async fn done_writer(
    mut log: AppendLog,
    hosts: HostList,
    inbox: EventReceiver,
) -> Result<(), RolloutError> {
    while let Ok(event) = inbox.recv_async().await {
        log.append(&event.host, &event.text)?;
        let removed = hosts.remove_host(&event.host)?;
        debug!(
            "removed {} record(s) for {} from {}",
            removed,
            event.host,
            hosts.path().display()
        );
        let _ = event.ack.send(());
    }
    debug!("exiting done writer for {}", log.path().display());
    Ok(())
}
