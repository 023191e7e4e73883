use crate::channel::{self, ChannelName, READY_EVENT};
use crate::engine::{NodeEngine, DEFAULT_RUNTIME_NAME};
use crate::paths::{PackageLayout, SandboxLayout};
use crate::provision::{AssetProvisioner, MemoryBuildStampStore};
use crate::transport::{NodeProcess, RuntimeExit, TransportFrame};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type Launch = (Vec<String>, HashMap<String, String>);

/// Replays scripted frames on `start` and records everything sent to it.
pub struct MemoryProcess {
    frames: Mutex<Vec<TransportFrame>>,
    launches: Mutex<Vec<Launch>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryProcess {
    pub fn new(frames: Vec<TransportFrame>) -> Self {
        Self {
            frames: Mutex::new(frames),
            launches: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().expect("launches lock").clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_events(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .map(|(channel, raw)| {
                let decoded = channel::decode(&channel, &raw).expect("decode sent message");
                (channel, decoded.event_name)
            })
            .collect()
    }
}

impl NodeProcess for MemoryProcess {
    fn start(
        &self,
        arguments: &[String],
        env: &HashMap<String, String>,
        inbound: &mut dyn FnMut(TransportFrame),
    ) -> Result<RuntimeExit, String> {
        self.launches
            .lock()
            .expect("launches lock")
            .push((arguments.to_vec(), env.clone()));
        let frames = std::mem::take(&mut *self.frames.lock().expect("frames lock"));
        for frame in frames {
            inbound(frame);
        }
        Ok(RuntimeExit { code: Some(0) })
    }

    fn send_to_channel(&self, channel: &str, message: &str) -> Result<(), String> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

pub fn ready_frame() -> TransportFrame {
    TransportFrame {
        channel: ChannelName::App.as_wire().to_string(),
        message: channel::encode(ChannelName::App, READY_EVENT, &[]).payload,
    }
}

/// A package with a `nodejs` project and built-in modules, an empty sandbox
/// and an engine wired to a [`MemoryProcess`].
pub struct EngineFixture {
    pub root: PathBuf,
    pub engine: NodeEngine,
    pub process: Arc<MemoryProcess>,
}

impl EngineFixture {
    pub fn new(name: &str, process: MemoryProcess) -> Self {
        Self::with_build_stamp(name, process, None)
    }

    /// `stamp` seeds the build id recorded by a previous run.
    pub fn with_build_stamp(name: &str, process: MemoryProcess, stamp: Option<&str>) -> Self {
        let root = std::env::temp_dir().join(format!(
            "nodebridge_fixture_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let package = root.join("package");
        fs::create_dir_all(package.join("public/nodejs")).expect("create project");
        fs::write(package.join("public/nodejs/index.js"), "").expect("write main");
        fs::create_dir_all(package.join("builtin_modules/bridge")).expect("create modules");
        fs::write(package.join("builtin_modules/bridge/index.js"), "").expect("write module");

        let process = Arc::new(process);
        let provisioner = AssetProvisioner::new(
            PackageLayout::new(&package),
            Self::sandbox_at(&root),
            "1.0",
            Arc::new(MemoryBuildStampStore::new(stamp)),
        );
        let engine = NodeEngine::new(provisioner, process.clone(), DEFAULT_RUNTIME_NAME);

        Self {
            root,
            engine,
            process,
        }
    }

    fn sandbox_at(root: &Path) -> SandboxLayout {
        SandboxLayout::new(root.join("sandbox/nodejs"), root.join("sandbox/cache"))
    }

    pub fn sandbox(&self) -> SandboxLayout {
        Self::sandbox_at(&self.root)
    }

    pub fn write_project_file(&self, name: &str, contents: &str) {
        fs::write(self.root.join("package/public/nodejs").join(name), contents)
            .expect("write project file");
    }
}

impl Drop for EngineFixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
