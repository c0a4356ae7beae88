use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use colored::ColoredString;
use futures::future::join;
use openssh::{KnownHosts, SessionBuilder, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::RemoteError;
use crate::host::Host;

/// Everything a host task needs from the outside world.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Checks that the host's SSH port accepts connections within `timeout`.
    async fn probe(&self, host: &Host, timeout: Duration) -> Result<(), RemoteError>;

    /// Copies the script into the remote user's home directory. Returns the combined output.
    async fn copy(&self, host: &Host, script: &Path) -> Result<String, RemoteError>;

    /// Runs `command` on the host and returns its output, one entry per line.
    /// Log lines about the session are prefixed with `tag`.
    async fn execute(
        &self,
        host: &Host,
        tag: &ColoredString,
        command: &str,
    ) -> Result<Vec<String>, RemoteError>;
}

/// Talks to hosts with the system's OpenSSH client.
pub struct SshRemote {
    user: String,
    key_file: PathBuf,
    port: u16,
    connect_timeout: Duration,
}

impl SshRemote {
    pub fn new(settings: &Settings) -> Self {
        Self {
            user: settings.user.clone(),
            key_file: settings.key_file.clone(),
            port: settings.port,
            connect_timeout: settings.connect_timeout,
        }
    }
}

#[async_trait]
impl Remote for SshRemote {
    async fn probe(&self, host: &Host, timeout: Duration) -> Result<(), RemoteError> {
        let target = (host.address.as_str(), self.port);
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RemoteError::Unreachable(e.to_string())),
            Err(_) => Err(RemoteError::Unreachable(format!(
                "no answer on port {} within {:?}",
                self.port, timeout
            ))),
        }
    }

    async fn copy(&self, host: &Host, script: &Path) -> Result<String, RemoteError> {
        let output = Command::new("scp")
            .arg("-p")
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-i")
            .arg(&self.key_file)
            .arg(script)
            .arg(format!("{}@{}:", self.user, host.address))
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(RemoteError::Copy(format!("{}: {}", output.status, combined.trim_end())))
        }
    }

    async fn execute(
        &self,
        host: &Host,
        tag: &ColoredString,
        command: &str,
    ) -> Result<Vec<String>, RemoteError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(self.user.clone())
            .port(self.port)
            .keyfile(&self.key_file)
            .connect_timeout(self.connect_timeout)
            .known_hosts_check(KnownHosts::Accept);
        let session = builder.connect_mux(&host.address).await?;
        debug!("{} Connected to host.", tag);

        let result = run_captured(&session, tag, command).await;

        if let Err(e) = session.close().await {
            warn!("{} Error while terminating: {}", tag, e);
        }
        result
    }
}

async fn run_captured(
    session: &openssh::Session,
    tag: &ColoredString,
    command: &str,
) -> Result<Vec<String>, RemoteError> {
    let mut cmd = session.raw_command(command);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().await?;

    let (stdout, stderr) = match (child.stdout().take(), child.stderr().take()) {
        (Some(stdout), Some(stderr)) => join(stream(tag, stdout), stream(tag, stderr)).await,
        _ => (Ok(vec![]), Ok(vec![])),
    };
    let status = child.wait().await?;

    let mut lines = stdout?;
    lines.extend(stderr?);
    if status.success() {
        Ok(lines)
    } else {
        Err(RemoteError::Execute {
            status: status.to_string(),
            output: lines.join(","),
        })
    }
}

/// Logs every line of `stream` as it arrives and collects them.
async fn stream<B: AsyncRead + Unpin>(
    tag: &ColoredString,
    stream: B,
) -> Result<Vec<String>, RemoteError> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(reader.buffer().len());
    let mut lines = vec![];
    loop {
        read_until2(&mut reader, b'\r', b'\n', &mut buf).await?;
        // An empty buffer means that EOF was reached.
        if buf.is_empty() {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            info!("{} {}", tag, line);
            lines.push(line.to_string());
        }
        buf.clear();
    }
    Ok(lines)
}

/// Reads into `buf` until either delimiter (inclusive) or EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}
