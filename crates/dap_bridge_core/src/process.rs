//! Adapter process manager
//!
//! Spawns one debug adapter per session, connects a [`DapClient`] to it,
//! runs the initialize/launch handshake and supervises the child until it
//! exits. The supervisor owns the `Child`; everything else talks to it through
//! a kill signal and a watch channel carrying the [`ProcessState`].

use crate::client::{DapClient, EventListener};
use crate::config::{AdapterLaunchSpec, AdapterTransport, DebugConfig, RequestKind, Timeouts};
use crate::error::HandshakeStage;
use crate::protocol::{Capabilities, CapabilitiesEventBody, Event, InitializeRequestArguments, Response};
use crate::traffic::TrafficLog;
use crate::{DapError, Result};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Exited(Option<i32>),
    Crashed(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Crashed(_))
    }

    pub fn describe(&self) -> String {
        match self {
            ProcessState::Starting => "starting".to_string(),
            ProcessState::Ready => "ready".to_string(),
            ProcessState::Exited(Some(code)) => format!("exited with code {code}"),
            ProcessState::Exited(None) => "exited".to_string(),
            ProcessState::Crashed(cause) => format!("crashed: {cause}"),
        }
    }
}

/// `launch` or `attach` plus its fully merged arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub kind: RequestKind,
    pub arguments: Map<String, Value>,
}

pub struct AdapterProcess {
    language: String,
    spec: AdapterLaunchSpec,
    pid: Option<u32>,
    client: Arc<DapClient>,
    state_tx: Arc<watch::Sender<ProcessState>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    terminating: Arc<AtomicBool>,
    capabilities: Arc<Mutex<Capabilities>>,
    initialized_rx: watch::Receiver<bool>,
    traffic_path: Option<PathBuf>,
}

impl AdapterProcess {
    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn spec(&self) -> &AdapterLaunchSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn client(&self) -> &Arc<DapClient> {
        &self.client
    }

    pub fn state(&self) -> ProcessState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn traffic_log_path(&self) -> Option<&PathBuf> {
        self.traffic_path.as_ref()
    }

    /// True once a stop was requested; exits after this point are not crashes.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    fn merge_capabilities(&self, capabilities: &Capabilities) {
        self.capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(capabilities);
    }

    /// Wait until the child has exited, or `None` after `wait`.
    pub async fn wait_exit(&self, wait: Duration) -> Option<ProcessState> {
        let mut rx = self.state_tx.subscribe();
        let exited = async { rx.wait_for(ProcessState::is_terminal).await.ok().map(|s| s.clone()) };
        tokio::time::timeout(wait, exited).await.ok().flatten()
    }

    /// Signal the supervisor to kill the child. Does not wait.
    pub fn kill(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    pub async fn force_kill(&self, wait: Duration) {
        self.kill();
        if self.wait_exit(wait).await.is_none() {
            warn!(language = %self.language, "Adapter did not report exit after kill");
        }
    }

    /// Graceful `terminate`/`disconnect`, then kill after the grace period.
    /// Calling this on an exited or already stopping adapter only waits.
    pub async fn terminate(&self, timeouts: &Timeouts) {
        if self.terminating.swap(true, Ordering::SeqCst) || self.state().is_terminal() {
            self.wait_exit(timeouts.exit_grace()).await;
            return;
        }
        info!(language = %self.language, pid = ?self.pid, "Stopping debug adapter");

        if !self.client.is_closed() {
            if self.capabilities().supports_terminate_request {
                if let Err(e) = self
                    .client
                    .send_request("terminate", Some(json!({ "restart": false })), timeouts.disconnect())
                    .await
                {
                    debug!("terminate request failed: {}", e);
                }
            }
            if let Err(e) = self
                .client
                .send_request(
                    "disconnect",
                    Some(json!({ "restart": false, "terminateDebuggee": true })),
                    timeouts.disconnect(),
                )
                .await
            {
                debug!("disconnect request failed: {}", e);
            }
        }

        if self.wait_exit(timeouts.exit_grace()).await.is_none() {
            warn!(
                language = %self.language,
                "Adapter still running after {}ms grace period, killing",
                timeouts.exit_grace_ms
            );
            self.force_kill(timeouts.exit_grace()).await;
        }
        self.client.shutdown("debug adapter stopped").await;
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        if let Some(sender) = self
            .kill_tx
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = sender.send(());
        }
    }
}

pub struct DebugAdapterManager {
    config: Arc<DebugConfig>,
    active: tokio::sync::Mutex<Option<Arc<AdapterProcess>>>,
}

impl DebugAdapterManager {
    pub fn new(config: Arc<DebugConfig>) -> Self {
        Self {
            config,
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    pub async fn active(&self) -> Option<Arc<AdapterProcess>> {
        self.active.lock().await.clone()
    }

    /// Spawn the adapter for `language` and bring it through the handshake.
    ///
    /// `listeners` are registered before the first request so no event is
    /// missed. Any previously active adapter is terminated first.
    pub async fn launch(
        &self,
        language: &str,
        request: &SessionRequest,
        listeners: Vec<EventListener>,
    ) -> Result<Arc<AdapterProcess>> {
        let spec = self.config.launch_spec(language)?.clone();
        self.terminate().await;

        let process = Arc::new(spawn_adapter(language, spec, &self.config, listeners).await?);
        if let Err(e) = handshake(&process, request, &self.config.timeouts).await {
            warn!(language, "Adapter handshake failed: {}", e);
            process.force_kill(self.config.timeouts.exit_grace()).await;
            process.client.shutdown(e.to_string()).await;
            return Err(e);
        }

        process.state_tx.send_if_modified(|state| {
            if *state == ProcessState::Starting {
                *state = ProcessState::Ready;
                true
            } else {
                false
            }
        });
        info!(language, pid = ?process.pid, "Debug adapter ready");
        *self.active.lock().await = Some(process.clone());
        Ok(process)
    }

    /// Stop the active adapter, if any.
    pub async fn terminate(&self) {
        let previous = self.active.lock().await.take();
        if let Some(process) = previous {
            process.terminate(&self.config.timeouts).await;
        }
    }
}

async fn spawn_adapter(
    language: &str,
    spec: AdapterLaunchSpec,
    config: &DebugConfig,
    listeners: Vec<EventListener>,
) -> Result<AdapterProcess> {
    let tcp_target = match &spec.transport {
        AdapterTransport::Stdio => None,
        AdapterTransport::Tcp { host, port } => {
            let port = match port {
                Some(port) => *port,
                None => free_port(host).await?,
            };
            Some((host.clone(), port))
        }
    };
    let args = match &tcp_target {
        Some((_, port)) => spec.substitute_port(*port),
        None => spec.args.clone(),
    };

    let mut command = Command::new(&spec.command);
    command
        .args(&args)
        .envs(&spec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if tcp_target.is_some() {
        command.stdin(Stdio::null());
    } else {
        command.stdin(Stdio::piped());
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let spawn_failed = |cause: String| DapError::SpawnFailed {
        command: spec.command.clone(),
        cause,
    };
    let mut child = command.spawn().map_err(|e| spawn_failed(e.to_string()))?;
    let pid = child.id();
    info!(language, pid = ?pid, command = %spec.command, ?args, "Spawned debug adapter");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, language.to_string(), "stderr"));
    }

    let traffic = match &config.traffic_log_dir {
        Some(dir) => match TrafficLog::create(dir, language).await {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => {
                warn!("Traffic transcript disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let client = match tcp_target {
        None => {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| spawn_failed("missing stdin pipe".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| spawn_failed("missing stdout pipe".to_string()))?;
            DapClient::new(stdout, stdin, traffic.clone())
        }
        Some((host, port)) => {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_output(stdout, language.to_string(), "stdout"));
            }
            let stream =
                match connect_with_retry(&host, port, config.timeouts.startup(), &mut child).await {
                    Ok(stream) => stream,
                    Err(cause) => {
                        let _ = child.start_kill();
                        return Err(DapError::handshake(HandshakeStage::Connect, cause));
                    }
                };
            let (reader, writer) = stream.into_split();
            DapClient::new(reader, writer, traffic.clone())
        }
    };
    let client = Arc::new(client);

    let (initialized_tx, initialized_rx) = watch::channel(false);
    let capabilities = Arc::new(Mutex::new(Capabilities::default()));
    {
        let capabilities = capabilities.clone();
        client.on_event(Arc::new(move |event: &Event| {
            match event.event.as_str() {
                "initialized" => {
                    initialized_tx.send_replace(true);
                }
                "capabilities" => {
                    let body: CapabilitiesEventBody = event.body_as()?;
                    capabilities
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .merge(&body.capabilities);
                }
                _ => {}
            }
            Ok(())
        }));
    }
    for listener in listeners {
        client.on_event(listener);
    }

    let (state_tx, _) = watch::channel(ProcessState::Starting);
    let state_tx = Arc::new(state_tx);
    let (kill_tx, kill_rx) = oneshot::channel();
    let terminating = Arc::new(AtomicBool::new(false));

    tokio::spawn(supervise(
        child,
        language.to_string(),
        kill_rx,
        state_tx.clone(),
        terminating.clone(),
        client.clone(),
    ));

    Ok(AdapterProcess {
        language: language.to_string(),
        spec,
        pid,
        client,
        state_tx,
        kill_tx: Mutex::new(Some(kill_tx)),
        terminating,
        capabilities,
        initialized_rx,
        traffic_path: traffic.map(|log| log.path().to_path_buf()),
    })
}

/// `initialize`, then `launch`/`attach` without awaiting its answer, then
/// `configurationDone` once the adapter reports `initialized`.
async fn handshake(
    process: &AdapterProcess,
    request: &SessionRequest,
    timeouts: &Timeouts,
) -> Result<()> {
    let client = process.client();
    let init_args = InitializeRequestArguments::new(process.spec.adapter_id_for(&process.language));
    let response = client
        .send_request(
            "initialize",
            Some(serde_json::to_value(init_args)?),
            timeouts.startup(),
        )
        .await
        .map_err(|e| DapError::handshake(HandshakeStage::Initialize, e))?;
    let capabilities: Capabilities = response
        .body_as()
        .map_err(|e| DapError::handshake(HandshakeStage::Initialize, e))?;
    debug!(?capabilities, "Adapter capabilities");
    process.merge_capabilities(&capabilities);

    let stage = match request.kind {
        RequestKind::Launch => HandshakeStage::Launch,
        RequestKind::Attach => HandshakeStage::Attach,
    };
    let command = request.kind.as_str();
    let (seq, mut reply_rx) = client
        .send_request_begin(command, Some(Value::Object(request.arguments.clone())))
        .await
        .map_err(|e| DapError::handshake(stage, e))?;

    // Some adapters answer launch before `initialized`, most only after configurationDone.
    let mut initialized_rx = process.initialized_rx.clone();
    let wait_initialized = async { initialized_rx.wait_for(|seen| *seen).await.is_ok() };
    let early_reply = tokio::select! {
        seen = tokio::time::timeout(timeouts.initialized_wait(), wait_initialized) => {
            if !matches!(seen, Ok(true)) {
                warn!(
                    "No 'initialized' event within {}ms, sending configurationDone anyway",
                    timeouts.initialized_wait_ms
                );
            }
            None
        }
        reply = &mut reply_rx => Some(reply),
    };

    let answered = match early_reply {
        Some(reply) => {
            let response = reply
                .map_err(|_| client_closed(client))
                .and_then(|result| result)
                .and_then(Response::into_result)
                .map_err(|e| DapError::handshake(stage, e))?;
            Some(response)
        }
        None => None,
    };

    if capabilities.supports_configuration_done_request {
        client
            .send_request("configurationDone", None, timeouts.request())
            .await
            .map_err(|e| DapError::handshake(HandshakeStage::ConfigurationDone, e))?;
    }

    if answered.is_none() {
        client
            .await_response(command, seq, reply_rx, timeouts.startup())
            .await
            .map_err(|e| DapError::handshake(stage, e))?;
    }
    Ok(())
}

fn client_closed(client: &DapClient) -> DapError {
    client
        .closure()
        .map(|closure| closure.to_error())
        .unwrap_or_else(|| DapError::transport_closed("response channel dropped"))
}

async fn supervise(
    mut child: Child,
    language: String,
    kill_rx: oneshot::Receiver<()>,
    state_tx: Arc<watch::Sender<ProcessState>>,
    terminating: Arc<AtomicBool>,
    client: Arc<DapClient>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            debug!(%language, "Killing debug adapter");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill adapter process: {}", e);
            }
            child.wait().await
        }
    };

    let requested = terminating.load(Ordering::SeqCst);
    let next = match status {
        Ok(status) if requested || status.success() => ProcessState::Exited(status.code()),
        Ok(status) => ProcessState::Crashed(format!("adapter exited unexpectedly ({status})")),
        Err(e) => ProcessState::Crashed(format!("failed to wait for adapter: {e}")),
    };
    if matches!(next, ProcessState::Crashed(_)) {
        warn!(%language, "Debug adapter {}", next.describe());
    } else {
        info!(%language, "Debug adapter {}", next.describe());
    }

    let reason = format!("adapter process {}", next.describe());
    state_tx.send_replace(next);
    client.shutdown(reason).await;
}

async fn forward_output<R>(stream: R, language: String, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%language, stream = name, "{}", line);
    }
}

async fn free_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).await?;
    Ok(listener.local_addr()?.port())
}

async fn connect_with_retry(
    host: &str,
    port: u16,
    wait: Duration,
    child: &mut Child,
) -> std::result::Result<TcpStream, String> {
    let deadline = Instant::now() + wait;
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                debug!(host, port, "Connected to debug adapter");
                return Ok(stream);
            }
            Err(e) => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(format!("adapter exited before accepting connections ({status})"));
                }
                if Instant::now() >= deadline {
                    return Err(format!("could not connect to {host}:{port}: {e}"));
                }
            }
        }
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}
