use anyhow::{bail, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const PROJECT_DIR_NAME: &str = "public";
pub const BUILTIN_MODULES_DIR_NAME: &str = "builtin_modules";
pub const DATA_DIR_NAME: &str = "data";
const RESOURCE_BUNDLE_SUFFIX: &str = ".bundle";

/// Normalizes the logical project folder name (`nodeDir`), which may contain
/// nested segments but must stay inside the package `public/` directory.
pub fn normalize_project_dir(input: &str) -> Result<String> {
  let mut trimmed = input.trim().replace('\\', "/");
  trimmed = trimmed.trim_matches('/').to_string();
  while let Some(rest) = trimmed.strip_prefix("./") {
    trimmed = rest.to_string();
  }
  if trimmed.is_empty() {
    bail!("project directory is required");
  }
  if trimmed
    .split('/')
    .any(|p| p.is_empty() || p == "." || p == "..")
  {
    bail!("invalid project directory: {input}");
  }
  Ok(trimmed)
}

fn join_inside(root: &Path, rel_posix: &str) -> Result<PathBuf> {
  let mut out = PathBuf::from(root);
  for part in rel_posix.split('/') {
    out.push(part);
  }
  for c in out.strip_prefix(root).unwrap_or(&out).components() {
    if matches!(c, Component::ParentDir) {
      bail!("invalid path");
    }
  }
  Ok(out)
}

/// Read-only package the project and built-in modules are copied from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageLayout {
  root: PathBuf,
}

impl PackageLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// `<package>/public/<project_dir>`, if it exists.
  pub fn project_source(&self, project_dir: &str) -> Option<PathBuf> {
    let normalized = normalize_project_dir(project_dir).ok()?;
    let path = join_inside(&self.root.join(PROJECT_DIR_NAME), &normalized).ok()?;
    path.is_dir().then_some(path)
  }

  /// Searches the package root, then `public/`, then every `*.bundle`
  /// directory at the package root in name order.
  pub fn builtin_modules_source(&self) -> Option<PathBuf> {
    let candidates = [
      self.root.join(BUILTIN_MODULES_DIR_NAME),
      self.root.join(PROJECT_DIR_NAME).join(BUILTIN_MODULES_DIR_NAME),
    ];
    if let Some(found) = candidates.into_iter().find(|path| path.is_dir()) {
      return Some(found);
    }

    let mut bundles = fs::read_dir(&self.root)
      .ok()?
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| {
        path.is_dir()
          && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(RESOURCE_BUNDLE_SUFFIX))
      })
      .collect::<Vec<_>>();
    bundles.sort();

    bundles
      .into_iter()
      .map(|bundle| bundle.join(BUILTIN_MODULES_DIR_NAME))
      .find(|path| path.is_dir())
  }
}

/// Mutable, application-private locations handed to the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxLayout {
  base: PathBuf,
  cache: PathBuf,
}

impl SandboxLayout {
  pub fn new(base: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
    Self {
      base: base.into(),
      cache: cache.into(),
    }
  }

  pub fn base(&self) -> &Path {
    &self.base
  }

  pub fn project_dir(&self) -> PathBuf {
    self.base.join(PROJECT_DIR_NAME)
  }

  pub fn builtin_modules_dir(&self) -> PathBuf {
    self.base.join(BUILTIN_MODULES_DIR_NAME)
  }

  pub fn data_dir(&self) -> PathBuf {
    self.base.join(DATA_DIR_NAME)
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache
  }

  /// `NODE_PATH` value: project directory first, then built-in modules.
  pub fn module_search_path(&self) -> String {
    join_path_list(&[self.project_dir(), self.builtin_modules_dir()])
  }
}

fn join_path_list(paths: &[PathBuf]) -> String {
  match std::env::join_paths(paths) {
    Ok(joined) => os_to_string(joined),
    Err(_) => {
      #[cfg(windows)]
      let separator = ";";
      #[cfg(not(windows))]
      let separator = ":";
      paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(separator)
    }
  }
}

fn os_to_string(value: OsString) -> String {
  value
    .into_string()
    .unwrap_or_else(|raw| raw.to_string_lossy().into_owned())
}
