//! Supervision of the relay node process.
//!
//! A [`NodeSupervisor`] owns one node process and the local channel to it.
//! Both are created by [`start`](NodeSupervisor::start) and torn down
//! together by [`stop`](NodeSupervisor::stop), so the channel never outlives
//! the process. A watcher task reaps the child; if it exits on its own the
//! supervisor moves to [`NodeState::Crashed`] and closes the channel, but it
//! never restarts the node by itself.

use acn_types::config::NodeConnectionConfig;
use acn_types::{AcnError, AcnResult, AgentRecord, Multiaddr, NodeKey};
use acn_wire::{FrameTransport, IpcChannel};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Log line opening the node's multiaddr list.
pub const MULTIADDRS_LIST_START: &str = "MULTIADDRS_LIST_START";
/// Log line closing the node's multiaddr list.
pub const MULTIADDRS_LIST_END: &str = "MULTIADDRS_LIST_END";
/// Marker of a fatal node error.
pub const NODE_PANIC_ERROR: &str = "LIBP2P_NODE_PANIC_ERROR";
const GO_PANIC: &str = "panic:";

/// Time a node gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

const SUCCESS_MESSAGE: &str = "Peer running in ";

/// Lifecycle of the node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The process exited without being asked to.
    Crashed,
}

struct RunningNode {
    pid: Option<u32>,
    channel: Arc<IpcChannel>,
    stop_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<Option<ExitStatus>>,
}

/// Starts, watches and stops a relay node.
pub struct NodeSupervisor {
    config: NodeConnectionConfig,
    key: NodeKey,
    /// Record of the current or last start.
    record: StdMutex<AgentRecord>,
    state: Arc<StdMutex<NodeState>>,
    running: Mutex<Option<RunningNode>>,
    channel: StdMutex<Option<Arc<IpcChannel>>>,
    multiaddrs: StdMutex<Vec<Multiaddr>>,
    restarts: AtomicU32,
    spawns: AtomicU32,
    /// Set once the restart budget ran out; the node is never started again.
    exhausted: AtomicBool,
    stop_grace: Duration,
}

impl NodeSupervisor {
    /// Validate `config`, load the node key and build the agent record.
    ///
    /// Everything that can be checked without starting the node is checked
    /// here, including that the node binary exists.
    pub fn new(config: NodeConnectionConfig) -> AcnResult<Self> {
        config.validate()?;
        let binary = config.node_binary_path();
        if !binary.is_file() {
            return Err(AcnError::Config(format!(
                "Module {} is not present in {}, build the node first",
                config.node_binary,
                config.build_directory.display()
            )));
        }

        let key = NodeKey::load(&config.data_dir.join(&config.node_key_file))?;
        let record = build_record(&config, &key)?;

        Ok(Self {
            config,
            key,
            record: StdMutex::new(record),
            state: Arc::new(StdMutex::new(NodeState::Stopped)),
            running: Mutex::new(None),
            channel: StdMutex::new(None),
            multiaddrs: StdMutex::new(Vec::new()),
            restarts: AtomicU32::new(0),
            spawns: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            stop_grace: DEFAULT_STOP_GRACE,
        })
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn config(&self) -> &NodeConnectionConfig {
        &self.config
    }

    pub fn record(&self) -> AgentRecord {
        lock(&self.record).clone()
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// Channel to the running node.
    pub fn channel(&self) -> Option<Arc<IpcChannel>> {
        lock(&self.channel).clone()
    }

    /// Multiaddrs the node announced in its log on the last start.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        lock(&self.multiaddrs).clone()
    }

    /// Pid of the running node process.
    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|node| node.pid)
    }

    /// Restarts performed so far.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Processes spawned so far.
    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Whether the restart budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Start the node and connect to it.
    ///
    /// Starting a running node is a no-op. A crashed node is cleaned up
    /// first. Once the restart budget is exhausted this fails with
    /// [`AcnError::RestartLimit`] and spawns nothing.
    pub async fn start(&self) -> AcnResult<()> {
        if self.is_exhausted() {
            return Err(AcnError::RestartLimit(self.config.max_node_restarts));
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            if self.is_running() {
                return Ok(());
            }
            self.stop_locked(&mut running).await;
        }
        self.set_state(NodeState::Starting);

        // The signature file may have been rewritten since the last start.
        let record = match build_record(&self.config, &self.key) {
            Ok(record) => record,
            Err(e) => {
                self.set_state(NodeState::Stopped);
                return Err(e);
            }
        };
        *lock(&self.record) = record;

        let channel = match IpcChannel::create(self.config.ipc).await {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                self.set_state(NodeState::Stopped);
                return Err(e);
            }
        };
        let env = self.env_file_contents(&channel);
        let env_path = self.config.env_file_path();
        let log_path = self.config.log_file_path();

        let child = match self.spawn(&env, &env_path, &log_path).await {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to start libp2p node");
                remove_file(&env_path).await;
                self.set_state(NodeState::Stopped);
                return Err(e);
            }
        };
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_child(
            child,
            stop_rx,
            Arc::clone(&self.state),
            Arc::clone(&channel),
            self.stop_grace,
        ));
        *running = Some(RunningNode {
            pid,
            channel: Arc::clone(&channel),
            stop_tx: Some(stop_tx),
            watcher,
        });

        info!(pid, "Connecting to libp2p node...");
        if !channel.connect(self.config.node_connection_timeout()).await {
            let cause = channel
                .last_error()
                .unwrap_or_else(|| "connect timed out".to_string());
            let log = read_log(&log_path).await;
            let node_error = find_node_error(&log);
            error!(
                error = node_error.as_deref().unwrap_or(&cause),
                "Couldn't connect to libp2p process"
            );
            error!("Libp2p process configuration:\n{}", env.trim());
            if node_error.is_none() {
                error!("Libp2p process log file {}:\n{}", log_path.display(), log);
            }
            self.stop_locked(&mut running).await;
            return Err(AcnError::Process(format!(
                "Couldn't connect to libp2p process within timeout: {}",
                node_error.unwrap_or(cause)
            )));
        }

        info!(pid, "Successfully connected to libp2p node!");
        *lock(&self.multiaddrs) = parse_multiaddrs(&read_log(&log_path).await);
        *lock(&self.channel) = Some(channel);
        {
            let mut state = lock(&self.state);
            if *state == NodeState::Starting {
                *state = NodeState::Running;
            }
        }
        info!("{}", self.describe_configuration());
        Ok(())
    }

    /// Stop the node, close the channel and delete the env file.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await;
    }

    /// Stop and start the node.
    ///
    /// Fails with [`AcnError::RestartLimit`] without touching the process
    /// once `max_node_restarts` restarts have been made.
    pub async fn restart(&self) -> AcnResult<()> {
        let max = self.config.max_node_restarts;
        let done = self.restarts.load(Ordering::SeqCst);
        if done >= max {
            error!(max_restarts = max, "Node restart budget exhausted");
            self.exhausted.store(true, Ordering::SeqCst);
            return Err(AcnError::RestartLimit(max));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        warn!(restart = done + 1, max_restarts = max, "Restarting libp2p node");
        self.stop().await;
        self.start().await
    }

    /// Human readable summary of how the node runs.
    pub fn describe_configuration(&self) -> String {
        let mut msg = SUCCESS_MESSAGE.to_string();
        match &self.config.public_uri {
            Some(public_uri) => {
                msg.push_str("full DHT mode with ");
                match self.config.effective_delegate_uri() {
                    Some(delegate) => msg.push_str(&format!(
                        "delegate service reachable at '{}:{}' and relay service enabled. ",
                        public_uri.host(),
                        delegate.port()
                    )),
                    None => msg.push_str("relay service enabled. "),
                }
                match lock(&self.multiaddrs).first() {
                    Some(maddr) => {
                        msg.push_str(&format!("To join its network use multiaddr '{maddr}'."))
                    }
                    None => msg.push_str("The node did not announce its multiaddrs."),
                }
            }
            None => msg.push_str("relayed mode and cannot be used as entry peer."),
        }
        msg
    }

    fn env_file_contents(&self, channel: &IpcChannel) -> String {
        node_env(
            &self.config,
            &self.key,
            &self.record(),
            &channel.in_path(),
            &channel.out_path(),
        )
        .into_iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
    }

    async fn spawn(&self, env: &str, env_path: &Path, log_path: &Path) -> AcnResult<Child> {
        tokio::fs::write(env_path, env).await?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        let binary = self.config.node_binary_path();
        info!(binary = %binary.display(), "Starting libp2p node...");
        Command::new(&binary)
            .arg(env_path)
            .args(&self.config.node_args)
            .current_dir(&self.config.build_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AcnError::Process(format!("failed to spawn {}: {e}", binary.display())))
    }

    async fn stop_locked(&self, running: &mut Option<RunningNode>) {
        lock(&self.channel).take();
        let Some(mut node) = running.take() else {
            debug!("Called stop when process not set");
            remove_file(&self.config.env_file_path()).await;
            return;
        };
        self.set_state(NodeState::Stopping);
        debug!(pid = node.pid, "Terminating node process...");
        if let Some(stop_tx) = node.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match node.watcher.await {
            Ok(Some(status)) => debug!(pid = node.pid, %status, "Node process terminated"),
            Ok(None) => {}
            Err(e) => warn!(pid = node.pid, error = %e, "Node watcher failed"),
        }
        node.channel.close().await;
        remove_file(&self.config.env_file_path()).await;
        self.set_state(NodeState::Stopped);
    }

    fn set_state(&self, state: NodeState) {
        *lock(&self.state) = state;
    }
}

/// Reap the child. Either it exits by itself (a crash) or `stop_rx` asks
/// for it to be terminated.
async fn watch_child(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    state: Arc<StdMutex<NodeState>>,
    channel: Arc<IpcChannel>,
    grace: Duration,
) -> Option<ExitStatus> {
    let pid = child.id();
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop_rx => None,
    };
    match exited {
        Some(status) => {
            match &status {
                Ok(status) => error!(pid, %status, "Node process was terminated unexpectedly"),
                Err(e) => error!(pid, error = %e, "Lost track of node process"),
            }
            *lock(&state) = NodeState::Crashed;
            channel.close().await;
            status.ok()
        }
        None => terminate(&mut child, grace).await,
    }
}

fn build_record(config: &NodeConnectionConfig, key: &NodeKey) -> AcnResult<AgentRecord> {
    let cert = config
        .cert_requests
        .first()
        .ok_or_else(|| AcnError::Config("missing certificate request".into()))?;
    AgentRecord::from_cert_request(
        cert,
        &config.agent_address,
        &config.agent_public_key,
        &key.public_key_hex(),
        &config.data_dir,
    )
}

/// SIGTERM, then SIGKILL once `grace` has passed.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Failed to wait for node process");
            None
        }
        Err(_) => {
            warn!(pid, "Node process still alive after grace period, force killing");
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "Failed to kill node process");
            }
            child.wait().await.ok()
        }
    }
}

/// The node's env file entries, in the order the node expects them.
pub fn node_env(
    config: &NodeConnectionConfig,
    key: &NodeKey,
    record: &AgentRecord,
    node_to_aea: &str,
    aea_to_node: &str,
) -> Vec<(&'static str, String)> {
    let opt = |uri: Option<&acn_types::Uri>| uri.map(|u| u.to_string()).unwrap_or_default();
    let entry_uris = config
        .entry_peers
        .iter()
        .filter(|maddr| match (maddr.uri(), &config.local_uri) {
            (Some(uri), Some(local)) => &uri != local,
            _ => true,
        })
        .map(|maddr| maddr.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let delay = config.peer_registration_delay.unwrap_or(0.0);

    vec![
        ("AEA_AGENT_ADDR", config.agent_address.clone()),
        ("AEA_P2P_ID", key.private_key_hex()),
        ("AEA_P2P_URI", opt(config.local_uri.as_ref())),
        ("AEA_P2P_ENTRY_URIS", entry_uris),
        ("NODE_TO_AEA", node_to_aea.to_string()),
        ("AEA_TO_NODE", aea_to_node.to_string()),
        ("AEA_P2P_URI_PUBLIC", opt(config.public_uri.as_ref())),
        ("AEA_P2P_DELEGATE_URI", opt(config.effective_delegate_uri())),
        ("AEA_P2P_URI_MONITORING", opt(config.monitoring_uri.as_ref())),
        ("AEA_P2P_POR_ADDRESS", record.address().to_string()),
        ("AEA_P2P_POR_PUBKEY", record.public_key().to_string()),
        (
            "AEA_P2P_POR_PEER_PUBKEY",
            record.representative_public_key().to_string(),
        ),
        ("AEA_P2P_POR_SIGNATURE", record.signature().to_string()),
        ("AEA_P2P_POR_SERVICE_ID", record.service_id().to_string()),
        ("AEA_P2P_POR_LEDGER_ID", record.ledger_id().to_string()),
        ("AEA_P2P_CFG_REGISTRATION_DELAY", format!("{delay:?}")),
        (
            "AEA_P2P_CFG_STORAGE_PATH",
            config
                .storage_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        ("AEA_P2P_MAILBOX_URI", opt(config.mailbox_uri.as_ref())),
    ]
}

/// Multiaddrs from the last list the node logged.
///
/// Each start marker discards earlier entries; the list ends at the end
/// marker or a blank line.
pub fn parse_multiaddrs(log: &str) -> Vec<Multiaddr> {
    let mut multiaddrs = Vec::new();
    let mut in_list = false;
    for line in log.lines() {
        if line.contains(MULTIADDRS_LIST_START) {
            in_list = true;
            multiaddrs.clear();
            continue;
        }
        if !in_list {
            continue;
        }
        let elem = line.trim();
        if elem.is_empty() || elem == MULTIADDRS_LIST_END {
            in_list = false;
            continue;
        }
        match elem.parse::<Multiaddr>() {
            Ok(maddr) => multiaddrs.push(maddr),
            Err(e) => warn!(line = elem, error = %e, "Skipping malformed multiaddr in node log"),
        }
    }
    multiaddrs
}

/// The node's fatal error, preferring the explicit marker over a raw panic.
pub fn find_node_error(log: &str) -> Option<String> {
    let mut critical = None;
    let mut panic = None;
    for line in log.lines() {
        let detail = || {
            line.split_once(':')
                .map(|(_, rest)| rest.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        if line.contains(NODE_PANIC_ERROR) {
            critical = detail().or(critical);
        }
        if line.contains(GO_PANIC) {
            panic = detail().or(panic);
        }
    }
    critical.or(panic)
}

async fn read_log(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot read node log");
            String::new()
        }
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
