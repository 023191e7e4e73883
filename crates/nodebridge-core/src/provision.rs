//! Version-gated copying of runtime assets from the read-only package into the
//! sandbox.
//!
//! Each step (project files, built-in modules) replaces its destination only
//! when the host build identifier differs from the one recorded by the last
//! run. With an unchanged identifier an existing destination is left exactly
//! as the runtime last wrote it.

use crate::paths::{PackageLayout, SandboxLayout};
use anyhow::{Context as _, Result};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const BUILD_STAMP_FILE_NAME: &str = "provision_state.json";

/// Persists the host build identifier seen by the last provisioning run.
pub trait BuildStampStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, build_id: &str) -> Result<()>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct BuildStamp {
    app_build_id: String,
}

#[derive(Clone, Debug)]
pub struct FileBuildStampStore {
    path: PathBuf,
}

impl FileBuildStampStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_sandbox(sandbox: &SandboxLayout) -> Self {
        Self::new(sandbox.base().join(BUILD_STAMP_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BuildStampStore for FileBuildStampStore {
    fn load(&self) -> Option<String> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<BuildStamp>(&raw) {
            Ok(stamp) => Some(stamp.app_build_id),
            Err(err) => {
                warn!(path = %self.path.display(), reason = %err, "ignoring unreadable build stamp");
                None
            }
        }
    }

    fn save(&self, build_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create build stamp dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&BuildStamp {
            app_build_id: build_id.to_string(),
        })?;
        fs::write(&self.path, json)
            .with_context(|| format!("write build stamp: {}", self.path.display()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBuildStampStore {
    value: Mutex<Option<String>>,
}

impl MemoryBuildStampStore {
    pub fn new(initial: Option<&str>) -> Self {
        Self {
            value: Mutex::new(initial.map(str::to_string)),
        }
    }
}

impl BuildStampStore for MemoryBuildStampStore {
    fn load(&self) -> Option<String> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, build_id: &str) -> Result<()> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(build_id.to_string());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionStep {
    Project,
    BuiltinModules,
}

impl ProvisionStep {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::BuiltinModules => "builtin_modules",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Copied,
    Replaced,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepFailure {
    pub step: ProvisionStep,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionReport {
    pub project: StepOutcome,
    pub builtin_modules: StepOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("provisioning failed ({})", describe_failures(.failures))]
pub struct ProvisionError {
    pub failures: Vec<StepFailure>,
}

impl ProvisionError {
    pub fn failed_step(&self, step: ProvisionStep) -> bool {
        self.failures.iter().any(|failure| failure.step == step)
    }
}

fn describe_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.step.as_tag(), failure.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct AssetProvisioner {
    package: PackageLayout,
    sandbox: SandboxLayout,
    build_id: String,
    stamps: Arc<dyn BuildStampStore>,
    force_refresh: bool,
    guard: Mutex<()>,
}

impl AssetProvisioner {
    pub fn new(
        package: PackageLayout,
        sandbox: SandboxLayout,
        build_id: impl Into<String>,
        stamps: Arc<dyn BuildStampStore>,
    ) -> Self {
        Self {
            package,
            sandbox,
            build_id: build_id.into(),
            stamps,
            force_refresh: false,
            guard: Mutex::new(()),
        }
    }

    /// Replace destinations on every run, even with an unchanged build id.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn sandbox(&self) -> &SandboxLayout {
        &self.sandbox
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn is_app_updated(&self) -> bool {
        self.stamps.load().unwrap_or_default() != self.build_id
    }

    pub fn provision(&self, project_dir: &str) -> Result<ProvisionReport, ProvisionError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let refresh = self.force_refresh || self.is_app_updated();
        let mut failures = Vec::new();

        let project_source = self.package.project_source(project_dir);
        if project_source.is_none() {
            warn!(
                project_dir,
                package = %self.package.root().display(),
                "project directory not found in package public/"
            );
        }
        let project = run_step(
            ProvisionStep::Project,
            project_source,
            &self.sandbox.project_dir(),
            refresh,
        )
        .unwrap_or_else(|failure| {
            failures.push(failure);
            StepOutcome::Skipped
        });

        let modules_source = self.package.builtin_modules_source();
        if modules_source.is_none() {
            warn!(
                package = %self.package.root().display(),
                "builtin_modules not found in any bundle"
            );
        }
        let builtin_modules = run_step(
            ProvisionStep::BuiltinModules,
            modules_source,
            &self.sandbox.builtin_modules_dir(),
            refresh,
        )
        .unwrap_or_else(|failure| {
            failures.push(failure);
            StepOutcome::Skipped
        });

        if let Err(err) = self.stamps.save(&self.build_id) {
            warn!(build_id = %self.build_id, reason = %err, "failed to persist build stamp");
        }

        if failures.is_empty() {
            info!(
                build_id = %self.build_id,
                ?project,
                ?builtin_modules,
                "runtime assets provisioned"
            );
            Ok(ProvisionReport {
                project,
                builtin_modules,
            })
        } else {
            Err(ProvisionError { failures })
        }
    }
}

fn run_step(
    step: ProvisionStep,
    source: Option<PathBuf>,
    destination: &Path,
    refresh: bool,
) -> Result<StepOutcome, StepFailure> {
    let fail = |reason: String| StepFailure { step, reason };
    let Some(source) = source else {
        return Err(fail("source not found in package".to_string()));
    };

    let mut replaced = false;
    if destination.exists() && refresh {
        if let Err(err) = remove_path(destination) {
            warn!(step = step.as_tag(), reason = %err, "failed to remove old destination");
            return Err(fail(format!("{err:#}")));
        }
        replaced = true;
    }

    if destination.exists() {
        debug!(step = step.as_tag(), path = %destination.display(), "build unchanged, keeping assets");
        return Ok(StepOutcome::Skipped);
    }

    if let Err(err) = copy_dir_recursive(&source, destination) {
        warn!(step = step.as_tag(), reason = %err, "failed to copy assets from package");
        return Err(fail(format!("{err:#}")));
    }

    Ok(if replaced {
        StepOutcome::Replaced
    } else {
        StepOutcome::Copied
    })
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("remove dir: {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("remove file: {}", path.display()))
    }
}

pub(crate) fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent dir: {}", parent.display()))?;
    }

    let mut builder = WalkBuilder::new(source);
    builder.standard_filters(false).hidden(false).follow_links(true);

    for entry in builder.build() {
        let entry = entry.with_context(|| format!("walk source: {}", source.display()))?;
        let path = entry.path();
        let rel = path.strip_prefix(source).unwrap_or(path);
        let target = destination.join(rel);

        if entry.file_type().is_some_and(|t| t.is_dir()) {
            fs::create_dir_all(&target)
                .with_context(|| format!("create dir: {}", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        fs::copy(path, &target).with_context(|| {
            format!("copy {} -> {}", path.display(), target.display())
        })?;
    }

    Ok(())
}
