//! Single-instance lifecycle of the embedded runtime.
//!
//! [`NodeEngine::start`] latches synchronously, then does all provisioning and
//! path resolution on a dedicated worker thread which finally blocks inside
//! the runtime until it exits. Start completion is reported once through a
//! [`StartHandle`]; readiness arrives later as an `APP_CHANNEL` `ready` event.

use crate::channel::{self, ChannelName, DecodedMessage};
use crate::error::LaunchError;
use crate::provision::AssetProvisioner;
use crate::ready::ReadyGate;
use crate::transport::{NodeProcess, TransportFrame};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MAIN_SCRIPT: &str = "index.js";
pub const PACKAGE_MANIFEST_FILE: &str = "package.json";
pub const DEFAULT_RUNTIME_NAME: &str = "node";

pub const ENV_DATA_DIR: &str = "DATADIR";
pub const ENV_NODE_PATH: &str = "NODE_PATH";
pub const ENV_TMP_DIR: &str = "TMPDIR";

pub const ENGINE_THREAD_NAME: &str = "NodeJS-Engine";
pub const ENGINE_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

pub type ReceiveCallback = Arc<dyn Fn(DecodedMessage) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Starting,
    ProvisioningFailed,
    LaunchFailed,
    Running,
    Ready,
    Exited,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub project_dir: String,
    pub main_file: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl StartRequest {
    pub fn new(project_dir: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }
}

/// What was handed to the runtime by a successful start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub arguments: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Resolves exactly once with the outcome of a [`NodeEngine::start`] call.
pub struct StartHandle {
    rx: Receiver<Result<(), LaunchError>>,
}

impl StartHandle {
    fn pending() -> (StartCompletion, Self) {
        let (tx, rx) = mpsc::channel();
        (StartCompletion { tx }, Self { rx })
    }

    fn resolved(result: Result<(), LaunchError>) -> Self {
        let (completion, handle) = Self::pending();
        completion.resolve(result);
        handle
    }

    pub fn wait(self) -> Result<(), LaunchError> {
        self.rx.recv().unwrap_or_else(|_| Err(worker_vanished()))
    }

    /// `None` while the worker has not reported yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), LaunchError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_vanished())),
        }
    }
}

fn worker_vanished() -> LaunchError {
    LaunchError::WorkerSpawnFailed("engine worker exited before reporting".to_string())
}

struct StartCompletion {
    tx: Sender<Result<(), LaunchError>>,
}

impl StartCompletion {
    fn resolve(self, result: Result<(), LaunchError>) {
        let _ = self.tx.send(result);
    }
}

struct EngineInner {
    process: Arc<dyn NodeProcess>,
    provisioner: AssetProvisioner,
    runtime_name: String,
    started: AtomicBool,
    gate: ReadyGate,
    state: Mutex<EngineState>,
    receiver: Mutex<Option<ReceiveCallback>>,
    launch: Mutex<Option<LaunchSpec>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NodeEngine {
    inner: Arc<EngineInner>,
}

impl NodeEngine {
    pub fn new(
        provisioner: AssetProvisioner,
        process: Arc<dyn NodeProcess>,
        runtime_name: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                process,
                provisioner,
                runtime_name: runtime_name.into(),
                started: AtomicBool::new(false),
                gate: ReadyGate::new(),
                state: Mutex::new(EngineState::NotStarted),
                receiver: Mutex::new(None),
                launch: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.gate.is_ready()
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.inner.state)
    }

    pub fn launch_spec(&self) -> Option<LaunchSpec> {
        lock(&self.inner.launch).clone()
    }

    pub fn start(&self, request: StartRequest, on_receive: ReceiveCallback) -> StartHandle {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return StartHandle::resolved(Err(LaunchError::AlreadyStarted));
        }

        *lock(&self.inner.receiver) = Some(on_receive);
        self.inner.set_state(EngineState::Starting);

        let (completion, handle) = StartHandle::pending();
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .stack_size(ENGINE_THREAD_STACK_SIZE)
            .spawn(move || inner.run_worker(request, completion));

        match spawned {
            Ok(worker) => {
                *lock(&self.inner.worker) = Some(worker);
                handle
            }
            Err(err) => {
                warn!(reason = %err, "failed to spawn engine thread");
                self.inner.set_state(EngineState::LaunchFailed);
                self.inner.close_gate();
                StartHandle::resolved(Err(LaunchError::WorkerSpawnFailed(err.to_string())))
            }
        }
    }

    pub fn set_ready(&self) {
        self.inner.set_ready();
    }

    pub fn resolve_when_ready(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.gate.resolve_when_ready(callback);
    }

    pub fn send_message(&self, channel: ChannelName, event_name: &str, args: &[Value]) {
        self.inner.send_message(channel, event_name, args);
    }

    pub fn did_receive_message(&self, channel: &str, raw_message: &str) {
        self.inner.did_receive_message(channel, raw_message);
    }

    /// Blocks until the engine thread has finished, i.e. the runtime exited.
    /// Returns `false` if no engine thread was ever spawned.
    pub fn join(&self) -> bool {
        let worker = lock(&self.inner.worker).take();
        match worker {
            Some(worker) => worker.join().is_ok(),
            None => false,
        }
    }
}

impl EngineInner {
    fn set_state(&self, state: EngineState) {
        *lock(&self.state) = state;
    }

    fn run_worker(&self, request: StartRequest, completion: StartCompletion) {
        match self.prepare_launch(&request) {
            Ok(spec) => {
                *lock(&self.launch) = Some(spec.clone());
                self.set_state(EngineState::Running);
                completion.resolve(Ok(()));
                self.launch(spec);
                self.close_gate();
            }
            Err(err) => {
                warn!(project_dir = %request.project_dir, reason = %err, "engine start failed");
                self.set_state(if err == LaunchError::ProvisioningFailed {
                    EngineState::ProvisioningFailed
                } else {
                    EngineState::LaunchFailed
                });
                completion.resolve(Err(err));
                self.close_gate();
            }
        }
    }

    /// Pending `resolve_when_ready` callbacks are dropped once the engine can
    /// no longer become ready.
    fn close_gate(&self) {
        let dropped = self.gate.close();
        if dropped > 0 {
            debug!(dropped, "runtime stopped before ready, dropping waiters");
        }
    }

    fn prepare_launch(&self, request: &StartRequest) -> Result<LaunchSpec, LaunchError> {
        if let Err(err) = self.provisioner.provision(&request.project_dir) {
            warn!(reason = %err, "asset provisioning failed");
            return Err(LaunchError::ProvisioningFailed);
        }

        // Provisioning keeps an existing destination when the build is
        // unchanged, even if it is not a directory.
        let sandbox = self.provisioner.sandbox();
        let project_path = sandbox.project_dir();
        if !project_path.is_dir() {
            return Err(LaunchError::ProjectDirMissing);
        }

        for dir in [sandbox.data_dir().as_path(), sandbox.cache_dir()] {
            if let Err(err) = fs::create_dir_all(dir) {
                warn!(path = %dir.display(), reason = %err, "failed to create runtime directory");
            }
        }

        let main_script = resolve_entry_script(&project_path, request.main_file.as_deref());
        let main_path = project_path.join(&main_script);
        if !main_path.is_file() {
            return Err(LaunchError::MainScriptMissing);
        }

        let mut env = request.env.clone();
        env.insert(
            ENV_DATA_DIR.to_string(),
            sandbox.data_dir().to_string_lossy().into_owned(),
        );
        env.insert(ENV_NODE_PATH.to_string(), sandbox.module_search_path());
        env.insert(
            ENV_TMP_DIR.to_string(),
            sandbox.cache_dir().to_string_lossy().into_owned(),
        );

        let mut arguments = vec![
            self.runtime_name.clone(),
            main_path.to_string_lossy().into_owned(),
        ];
        arguments.extend(request.args.iter().cloned());

        Ok(LaunchSpec { arguments, env })
    }

    fn launch(&self, spec: LaunchSpec) {
        info!(main = %spec.arguments[1], "launching runtime");
        let mut inbound = |frame: TransportFrame| {
            self.did_receive_message(&frame.channel, &frame.message);
        };
        match self.process.start(&spec.arguments, &spec.env, &mut inbound) {
            Ok(exit) => info!(code = ?exit.code, "runtime exited"),
            Err(err) => warn!(reason = %err, "runtime terminated with error"),
        }
        self.set_state(EngineState::Exited);
    }

    fn set_ready(&self) {
        if self.gate.set_ready() {
            let mut state = lock(&self.state);
            if *state == EngineState::Running {
                *state = EngineState::Ready;
            }
            drop(state);
            info!("runtime signalled ready");
        }
    }

    fn send_message(&self, channel: ChannelName, event_name: &str, args: &[Value]) {
        let envelope = channel::encode(channel, event_name, args);
        if let Err(err) = self
            .process
            .send_to_channel(envelope.channel.as_wire(), &envelope.payload)
        {
            debug!(%channel, event_name, reason = %err, "dropping message for runtime");
        }
    }

    fn did_receive_message(&self, channel: &str, raw_message: &str) {
        let message = match channel::decode(channel, raw_message) {
            Ok(message) => message,
            Err(err) => {
                warn!(channel, reason = %err, "failed to deserialize message from runtime");
                return;
            }
        };

        if message.is_ready_signal() {
            self.set_ready();
            return;
        }

        let receiver = lock(&self.receiver).clone();
        match receiver {
            Some(receiver) => receiver(message),
            None => debug!(channel, event_name = %message.event_name, "no receiver registered"),
        }
    }
}

/// Entry script precedence: explicit name, then `main` from `package.json`,
/// then [`DEFAULT_MAIN_SCRIPT`].
pub fn resolve_entry_script(project_path: &Path, main_file: Option<&str>) -> String {
    if let Some(main_file) = main_file.filter(|name| !name.is_empty()) {
        return main_file.to_string();
    }
    manifest_main(&project_path.join(PACKAGE_MANIFEST_FILE))
        .unwrap_or_else(|| DEFAULT_MAIN_SCRIPT.to_string())
}

fn manifest_main(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let manifest: Value = serde_json::from_str(&raw).ok()?;
    manifest
        .get("main")
        .and_then(Value::as_str)
        .filter(|main| !main.is_empty())
        .map(str::to_string)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
