//! End-to-end tests for the round loop.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colored::ColoredString;
use tempfile::TempDir;
use tokio::sync::Mutex;

use rollout_ssh::{
    ConfigError, Host, HostList, Remote, RemoteError, Rollout, RolloutError, RoundOutcome,
    RoundSummary, Settings,
};

/// Mock remote that never leaves the machine.
#[derive(Default)]
pub struct MockRemote {
    /// Address -> how many more probes should fail.
    unreachable: Mutex<HashMap<String, usize>>,
    copy_fails: HashSet<String>,
    execute_fails: HashSet<String>,
    /// Deleted on first execute to break the pending list mid-round.
    sabotage: Option<PathBuf>,
    delay_ms: u64,
    probed: Mutex<Vec<String>>,
    executed: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable_for(self, address: &str, probes: usize) -> Self {
        self.unreachable
            .try_lock()
            .unwrap()
            .insert(address.to_string(), probes);
        self
    }

    pub fn failing_copy(mut self, address: &str) -> Self {
        self.copy_fails.insert(address.to_string());
        self
    }

    pub fn failing_execute(mut self, address: &str) -> Self {
        self.execute_fails.insert(address.to_string());
        self
    }

    pub fn sabotaging(mut self, path: &Path) -> Self {
        self.sabotage = Some(path.to_path_buf());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    async fn probed(&self) -> Vec<String> {
        self.probed.lock().await.clone()
    }

    async fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl Remote for MockRemote {
    async fn probe(&self, host: &Host, _timeout: Duration) -> Result<(), RemoteError> {
        self.probed.lock().await.push(host.address.clone());
        let mut unreachable = self.unreachable.lock().await;
        match unreachable.get_mut(&host.address) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RemoteError::Unreachable("connection refused".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn copy(&self, host: &Host, script: &Path) -> Result<String, RemoteError> {
        if self.copy_fails.contains(&host.address) {
            return Err(RemoteError::Copy("exit status: 1: Permission denied".to_string()));
        }
        Ok(format!("copied {}", script.display()))
    }

    async fn execute(
        &self,
        host: &Host,
        _tag: &ColoredString,
        command: &str,
    ) -> Result<Vec<String>, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.executed
            .lock()
            .await
            .push((host.address.clone(), command.to_string()));
        if let Some(path) = &self.sabotage {
            let _ = fs::remove_file(path);
        }
        if self.execute_fails.contains(&host.address) {
            return Err(RemoteError::Execute {
                status: "exit status: 2".to_string(),
                output: "apt-get: not found".to_string(),
            });
        }
        Ok(vec![format!("hello from {}", host.name), "done".to_string()])
    }
}

struct Fixture {
    dir: TempDir,
    settings: Settings,
}

impl Fixture {
    fn new(hosts: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::new("scripts/deploy.sh", "admin", "/keys/id_rsa");
        settings.hosts_file = dir.path().join("hosts.txt");
        settings.status_log = dir.path().join("status.log");
        settings.done_log = dir.path().join("done.log");
        settings.round_delay = Duration::ZERO;
        fs::write(&settings.hosts_file, hosts).unwrap();
        Self { dir, settings }
    }

    fn rollout(&self, remote: &Arc<MockRemote>) -> Rollout {
        let remote: Arc<dyn Remote> = remote.clone();
        Rollout::new(self.settings.clone(), remote).unwrap()
    }

    fn lines(&self, path: &Path) -> Vec<String> {
        match fs::read_to_string(path) {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(_) => vec![],
        }
    }

    fn status_lines(&self) -> Vec<String> {
        self.lines(&self.settings.status_log)
    }

    fn done_lines(&self) -> Vec<String> {
        self.lines(&self.settings.done_log)
    }

    fn pending(&self) -> Vec<Host> {
        HostList::new(&self.settings.hosts_file).load_all().unwrap()
    }
}

#[tokio::test]
async fn test_e2e_unreachable_host_stays_pending() {
    let fixture = Fixture::new("10.0.0.1,web1\n10.0.0.2,web2\n");
    let remote = Arc::new(MockRemote::new().unreachable_for("10.0.0.1", usize::MAX));
    let rollout = fixture.rollout(&remote);

    let outcome = rollout.run_round(1).await.unwrap();
    assert_eq!(
        outcome,
        RoundOutcome::Ran(RoundSummary {
            completed: 1,
            failed: 1
        })
    );

    // Only web2 is done, and only web1 is still pending.
    assert_eq!(
        fixture.done_lines(),
        vec!["10.0.0.2,web2,hello from web2,done"]
    );
    assert_eq!(fixture.pending(), vec![Host::new("10.0.0.1", "web1")]);

    let status = fixture.status_lines();
    assert_eq!(status.len(), 3);
    let web1: Vec<_> = status.iter().filter(|l| l.starts_with("10.0.0.1,web1,")).collect();
    assert_eq!(web1.len(), 1);
    assert!(web1[0].contains("error: unable to reach node: connection refused"));
    let web2: Vec<_> = status.iter().filter(|l| l.starts_with("10.0.0.2,web2,")).collect();
    assert_eq!(
        web2,
        vec![
            "10.0.0.2,web2,info: script copied: copied scripts/deploy.sh",
            "10.0.0.2,web2,info: script ok: hello from web2,done",
        ]
    );

    // The unreachable host never got as far as execution.
    let executed = remote.executed().await;
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "10.0.0.2");

    // Round two only looks at web1.
    rollout.run_round(2).await.unwrap();
    assert_eq!(
        sorted(remote.probed().await),
        vec!["10.0.0.1", "10.0.0.1", "10.0.0.2"]
    );
    assert_eq!(fixture.pending(), vec![Host::new("10.0.0.1", "web1")]);
    assert_eq!(fixture.done_lines().len(), 1);
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

#[tokio::test]
async fn test_e2e_run_until_drained() {
    let fixture = Fixture::new("10.0.0.1,web1\n10.0.0.2,web2\n10.0.0.3,web3\n");
    let remote = Arc::new(
        MockRemote::new()
            .unreachable_for("10.0.0.1", 2)
            .unreachable_for("10.0.0.3", 1),
    );
    let rollout = fixture.rollout(&remote);

    let rounds = rollout.run().await.unwrap();
    assert_eq!(rounds, 3);
    assert!(fixture.pending().is_empty());

    // Exactly one done line per original host.
    let done = sorted(fixture.done_lines());
    assert_eq!(
        done,
        vec![
            "10.0.0.1,web1,hello from web1,done",
            "10.0.0.2,web2,hello from web2,done",
            "10.0.0.3,web3,hello from web3,done",
        ]
    );
    assert_eq!(remote.executed().await.len(), 3);

    // Three failed probes were recorded along the way.
    let failures = fixture
        .status_lines()
        .into_iter()
        .filter(|line| line.contains(",error: "))
        .count();
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn test_e2e_empty_list_is_drained_immediately() {
    let fixture = Fixture::new("\n\n");
    let remote = Arc::new(MockRemote::new());
    let rollout = fixture.rollout(&remote);

    assert_eq!(rollout.run_round(1).await.unwrap(), RoundOutcome::Drained);
    assert_eq!(rollout.run().await.unwrap(), 0);
    assert!(remote.probed().await.is_empty());
    // No round ran, so the logs were never created.
    assert!(!fixture.settings.status_log.exists());
    assert!(!fixture.settings.done_log.exists());
}

#[tokio::test]
async fn test_e2e_resume_skips_hosts_already_done() {
    let fixture = Fixture::new("10.0.0.2,web2\n");
    // A previous run finished web1 and crashed before finishing web2.
    fs::write(&fixture.settings.done_log, "10.0.0.1,web1,hello from web1,done\n").unwrap();
    let remote = Arc::new(MockRemote::new());
    let rollout = fixture.rollout(&remote);

    assert_eq!(rollout.run().await.unwrap(), 1);
    assert_eq!(remote.probed().await, vec!["10.0.0.2"]);
    assert_eq!(
        fixture.done_lines(),
        vec![
            "10.0.0.1,web1,hello from web1,done",
            "10.0.0.2,web2,hello from web2,done",
        ]
    );
    assert!(fixture.pending().is_empty());
}

#[tokio::test]
async fn test_e2e_copy_and_execute_failures_are_recorded() {
    let fixture = Fixture::new("10.0.0.1,web1\n10.0.0.2,web2\n10.0.0.3,web3\n");
    let remote = Arc::new(
        MockRemote::new()
            .failing_copy("10.0.0.1")
            .failing_execute("10.0.0.2"),
    );
    let rollout = fixture.rollout(&remote);

    let outcome = rollout.run_round(1).await.unwrap();
    assert_eq!(
        outcome,
        RoundOutcome::Ran(RoundSummary {
            completed: 1,
            failed: 2
        })
    );
    assert_eq!(
        fixture.pending(),
        vec![Host::new("10.0.0.1", "web1"), Host::new("10.0.0.2", "web2")]
    );
    assert_eq!(
        fixture.done_lines(),
        vec!["10.0.0.3,web3,hello from web3,done"]
    );

    let status = fixture.status_lines();
    assert!(status.contains(
        &"10.0.0.1,web1,error: failed to copy script: exit status: 1: Permission denied"
            .to_string()
    ));
    assert!(status.contains(
        &"10.0.0.2,web2,error: ssh cmd failed: exit status: 2: apt-get: not found".to_string()
    ));
    // The copy milestone for web2 was recorded before its execution failed.
    assert!(status.contains(
        &"10.0.0.2,web2,info: script copied: copied scripts/deploy.sh".to_string()
    ));

    // A failed copy means the script was never run.
    let executed: Vec<_> = remote.executed().await.into_iter().map(|(a, _)| a).collect();
    assert_eq!(sorted(executed), vec!["10.0.0.2", "10.0.0.3"]);
}

#[tokio::test]
async fn test_e2e_remote_command_carries_node_name() {
    let fixture = Fixture::new("10.0.0.7,db-primary\n");
    let remote = Arc::new(MockRemote::new());
    let rollout = fixture.rollout(&remote);

    rollout.run_round(1).await.unwrap();
    assert_eq!(
        remote.executed().await,
        vec![(
            "10.0.0.7".to_string(),
            "sudo bash -c 'export NODENAME=db-primary; ./deploy.sh'".to_string()
        )]
    );
}

#[tokio::test]
async fn test_e2e_custom_command_template() {
    let mut fixture = Fixture::new("10.0.0.7,db-primary\n");
    fixture.settings.command = "NODE={{name}} ADDR={{address}} sh ~{{user}}/{{script}}".to_string();
    let remote = Arc::new(MockRemote::new());
    let rollout = fixture.rollout(&remote);

    rollout.run_round(1).await.unwrap();
    assert_eq!(
        remote.executed().await[0].1,
        "NODE=db-primary ADDR=10.0.0.7 sh ~admin/deploy.sh"
    );
}

#[tokio::test]
async fn test_e2e_unbounded_fan_out() {
    let hosts: String = (1..=6).map(|i| format!("10.0.0.{i},web{i}\n")).collect();
    let fixture = Fixture::new(&hosts);
    let remote = Arc::new(MockRemote::new().with_delay_ms(500));
    let rollout = fixture.rollout(&remote);

    rollout.run_round(1).await.unwrap();
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 6);
    assert!(fixture.pending().is_empty());
}

#[tokio::test]
async fn test_e2e_bounded_fan_out() {
    let hosts: String = (1..=6).map(|i| format!("10.0.0.{i},web{i}\n")).collect();
    let mut fixture = Fixture::new(&hosts);
    fixture.settings.max_parallel = Some(2);
    let remote = Arc::new(MockRemote::new().with_delay_ms(500));
    let rollout = fixture.rollout(&remote);

    let outcome = rollout.run_round(1).await.unwrap();
    assert_eq!(
        outcome,
        RoundOutcome::Ran(RoundSummary {
            completed: 6,
            failed: 0
        })
    );
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.done_lines().len(), 6);
}

#[tokio::test]
async fn test_e2e_oversized_parallelism_is_rejected() {
    let mut fixture = Fixture::new("10.0.0.1,web1\n");
    fixture.settings.max_parallel = Some(usize::MAX);
    let remote: Arc<dyn Remote> = Arc::new(MockRemote::new());

    assert!(matches!(
        Rollout::new(fixture.settings.clone(), remote),
        Err(RolloutError::Config(ConfigError::Invalid {
            field: "max_parallel",
            ..
        }))
    ));
}

#[tokio::test]
async fn test_e2e_malformed_pending_list_is_fatal() {
    let fixture = Fixture::new("10.0.0.1,web1\n10.0.0.2\n");
    let remote = Arc::new(MockRemote::new());
    let rollout = fixture.rollout(&remote);

    match rollout.run().await {
        Err(RolloutError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected MalformedRecord, got {:?}", other),
    }
    assert!(remote.probed().await.is_empty());
}

#[tokio::test]
async fn test_e2e_unwritable_log_is_fatal() {
    let mut fixture = Fixture::new("10.0.0.1,web1\n");
    // A directory cannot be opened as an append-only log.
    fixture.settings.status_log = fixture.dir.path().to_path_buf();
    let remote = Arc::new(MockRemote::new());
    let rollout = fixture.rollout(&remote);

    assert!(matches!(
        rollout.run().await,
        Err(RolloutError::Storage { .. })
    ));
    assert!(remote.probed().await.is_empty());
}

#[tokio::test]
async fn test_e2e_pending_list_failure_mid_round_aborts() {
    let fixture = Fixture::new("10.0.0.1,web1\n");
    let remote = Arc::new(MockRemote::new().sabotaging(&fixture.settings.hosts_file));
    let rollout = fixture.rollout(&remote);

    // The host is recorded as done, but removing it from the vanished list fails.
    assert!(matches!(
        rollout.run_round(1).await,
        Err(RolloutError::Storage { .. })
    ));
    assert_eq!(
        fixture.done_lines(),
        vec!["10.0.0.1,web1,hello from web1,done"]
    );
}
