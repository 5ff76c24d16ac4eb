use std::path::{Component, Path, PathBuf};

use crate::fingerprint::{FileCollection, PathSensitivity};

/// A unit of work whose execution the engine may skip
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    /// Stable identity, e.g. a task path like `:app:compile`
    pub identity: String,
    /// Anything that changes what the work does (command line, tool version)
    pub implementation: String,
    pub base_dir: PathBuf,
    pub inputs: FileCollection,
    pub sensitivity: PathSensitivity,
    /// Declared outputs, relative to `base_dir`
    pub outputs: Vec<String>,
    pub cacheable: bool,
}

impl UnitOfWork {
    pub fn new(
        identity: impl Into<String>,
        implementation: impl Into<String>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        let base_dir = base_dir.into();
        Self {
            identity: identity.into(),
            implementation: implementation.into(),
            inputs: FileCollection::new(base_dir.clone()),
            base_dir,
            sensitivity: PathSensitivity::default(),
            outputs: Vec::new(),
            cacheable: true,
        }
    }

    /// Add an input path, directory or glob (relative to the base dir)
    pub fn with_input(mut self, spec: &str) -> Self {
        self.inputs = self.inputs.with_spec(spec);
        self
    }

    pub fn with_inputs(mut self, inputs: FileCollection) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: PathSensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Declared outputs as clean relative paths, or None if any leaves the base dir
    pub fn relative_outputs(&self) -> Option<Vec<String>> {
        self.outputs
            .iter()
            .map(|output| relative_output(&self.base_dir, output))
            .collect()
    }

    /// Marked cacheable, declares outputs, and all of them are inside the base dir
    pub fn is_effectively_cacheable(&self) -> bool {
        self.cacheable && !self.outputs.is_empty() && self.relative_outputs().is_some()
    }
}

/// `out/./a` -> `out/a`; absolute paths under `base_dir` become relative
fn relative_output(base_dir: &Path, output: &str) -> Option<String> {
    let path = Path::new(output);
    let relative = if path.is_absolute() {
        path.strip_prefix(base_dir).ok()?
    } else {
        path
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    // The base dir itself is not an output
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
