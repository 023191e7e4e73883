//! Host-facing operation surface: `start`, `send`, `whenReady`, event
//! listeners and app lifecycle hooks.

use crate::channel::{ChannelName, DecodedMessage};
use crate::config::{BridgeConfig, StartMode};
use crate::engine::{NodeEngine, ReceiveCallback, StartHandle, StartRequest};
use crate::error::{ConfigError, SendError, StartError};
use crate::lifecycle::{BackgroundTaskHost, GraceWindow, LifecycleSignal};
use crate::paths::{PackageLayout, SandboxLayout};
use crate::provision::{AssetProvisioner, FileBuildStampStore};
use crate::transport::NodeProcess;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

pub type EventListener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Where the host keeps the package and the runtime's private directories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEnvironment {
    pub package_root: PathBuf,
    pub sandbox_base: PathBuf,
    pub cache_dir: PathBuf,
    /// Changes whenever the host application is rebuilt or updated.
    pub build_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub node_dir: Option<String>,
    pub script: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

pub struct ReadyHandle {
    rx: Receiver<()>,
}

impl ReadyHandle {
    /// Returns `false` if the engine stopped without becoming ready.
    pub fn wait(self) -> bool {
        self.rx.recv().is_ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, String, EventListener)>>,
}

impl ListenerRegistry {
    fn add(&self, event_name: &str, listener: EventListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().push((id, event_name.to_string(), listener));
        ListenerHandle(id)
    }

    fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(id, _, _)| *id != handle.0);
        entries.len() != before
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn notify(&self, event_name: &str, args: &[Value]) {
        let matching = self
            .lock()
            .iter()
            .filter(|(_, name, _)| name == event_name)
            .map(|(_, _, listener)| listener.clone())
            .collect::<Vec<_>>();
        if matching.is_empty() {
            debug!(event_name, "no listener for runtime event");
        }
        for listener in matching {
            listener(args);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, String, EventListener)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct NodeJsBridge {
    config: BridgeConfig,
    engine: NodeEngine,
    signal: LifecycleSignal,
    listeners: Arc<ListenerRegistry>,
}

impl NodeJsBridge {
    pub fn new(
        config: BridgeConfig,
        host: HostEnvironment,
        process: Arc<dyn NodeProcess>,
        task_host: Arc<dyn BackgroundTaskHost>,
    ) -> Self {
        let sandbox = SandboxLayout::new(host.sandbox_base, host.cache_dir);
        let stamps = Arc::new(FileBuildStampStore::in_sandbox(&sandbox));
        let provisioner = AssetProvisioner::new(
            PackageLayout::new(host.package_root),
            sandbox,
            host.build_id,
            stamps,
        )
        .with_force_refresh(config.force_asset_refresh);
        let engine = NodeEngine::new(provisioner, process, config.runtime_name());
        Self::with_engine(config, engine, task_host)
    }

    pub fn with_engine(
        config: BridgeConfig,
        engine: NodeEngine,
        task_host: Arc<dyn BackgroundTaskHost>,
    ) -> Self {
        let signal = LifecycleSignal::new(engine.clone(), task_host, config.grace_window());
        Self {
            config,
            engine,
            signal,
            listeners: Arc::new(ListenerRegistry::default()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &NodeEngine {
        &self.engine
    }

    /// Starts the engine with the configured project when `startMode` is
    /// `auto`. Failures are logged by the engine.
    pub fn load(&self) -> Option<StartHandle> {
        if self.config.start_mode() != StartMode::Auto {
            return None;
        }
        Some(self.launch(StartRequest::new(self.config.node_dir())))
    }

    pub fn start(&self, options: StartOptions) -> Result<StartHandle, ConfigError> {
        if self.config.start_mode() != StartMode::Manual {
            return Err(ConfigError::ManualStartNotEnabled);
        }

        let project_dir = options
            .node_dir
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| self.config.node_dir().to_string());
        Ok(self.launch(StartRequest {
            project_dir,
            main_file: options.script,
            args: options.args,
            env: options.env,
        }))
    }

    /// Manual start that blocks until the engine thread reports.
    pub fn start_and_wait(&self, options: StartOptions) -> Result<(), StartError> {
        self.start(options)?.wait()?;
        Ok(())
    }

    pub fn send(&self, event_name: &str, args: &[Value]) -> Result<(), SendError> {
        if !self.engine.is_started() {
            return Err(SendError::NotStarted);
        }
        if !self.engine.is_ready() {
            return Err(SendError::NotReady);
        }
        if event_name.is_empty() {
            return Err(SendError::MissingEventName);
        }
        self.engine.send_message(ChannelName::Event, event_name, args);
        Ok(())
    }

    pub fn when_ready(&self) -> Result<ReadyHandle, SendError> {
        if !self.engine.is_started() {
            return Err(SendError::NotStarted);
        }
        let (tx, rx) = mpsc::channel();
        self.engine.resolve_when_ready(move || {
            let _ = tx.send(());
        });
        Ok(ReadyHandle { rx })
    }

    pub fn add_listener(
        &self,
        event_name: &str,
        listener: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(event_name, Arc::new(listener))
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.clear();
    }

    pub fn app_did_become_active(&self) -> bool {
        self.signal.on_foreground()
    }

    pub fn app_will_resign_active(&self) -> Option<GraceWindow> {
        self.signal.on_background()
    }

    fn launch(&self, request: StartRequest) -> StartHandle {
        let listeners = self.listeners.clone();
        let on_receive: ReceiveCallback =
            Arc::new(move |message: DecodedMessage| route_message(&listeners, message));
        self.engine.start(request, on_receive)
    }
}

fn route_message(listeners: &ListenerRegistry, message: DecodedMessage) {
    match ChannelName::from_wire(&message.channel) {
        Some(ChannelName::Event) => listeners.notify(&message.event_name, &message.args),
        Some(ChannelName::App) => {
            debug!(event_name = %message.event_name, "ignoring control event from runtime")
        }
        None => debug!(channel = %message.channel, "ignoring message on unknown channel"),
    }
}
