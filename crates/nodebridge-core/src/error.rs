use thiserror::Error;

/// Failures reported through a [`crate::engine::StartHandle`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("The Node.js engine has already been started.")]
    AlreadyStarted,
    #[error("Unable to copy the Node.js project from bundle.")]
    ProvisioningFailed,
    #[error("Unable to access the Node.js project. (No such directory)")]
    ProjectDirMissing,
    #[error("Unable to access main script of the Node.js project. (No such file)")]
    MainScriptMissing,
    #[error("Unable to spawn the Node.js engine thread: {0}")]
    WorkerSpawnFailed(String),
}

impl LaunchError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyStarted => "already_started",
            Self::ProvisioningFailed => "provisioning_failed",
            Self::ProjectDirMissing => "project_dir_missing",
            Self::MainScriptMissing => "main_script_missing",
            Self::WorkerSpawnFailed(_) => "worker_spawn_failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("The Node.js engine has not been started yet.")]
    NotStarted,
    #[error("The Node.js engine is not ready yet.")]
    NotReady,
    #[error("Required parameter 'eventName' was not specified.")]
    MissingEventName,
}

impl SendError {
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::NotReady => "not_ready",
            Self::MissingEventName => "missing_event_name",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Manual startup of the Node.js engine is not enabled.")]
    ManualStartNotEnabled,
}

impl ConfigError {
    pub const fn code(self) -> &'static str {
        match self {
            Self::ManualStartNotEnabled => "manual_start_not_enabled",
        }
    }
}

/// Error returned by [`crate::bridge::NodeJsBridge::start`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl StartError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(err) => err.code(),
            Self::Launch(err) => err.code(),
        }
    }
}
