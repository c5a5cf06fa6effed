//! Code injection into sandboxes

use crate::runtime::{FileEntry, Sandbox, SandboxRuntime};
use crate::{Result, SandboxConfig, SandpitError};
use std::collections::BTreeMap;

/// Document helper shipped into every new sandbox
pub const HELPER_SOURCE: &str = include_str!("../resources/playground.py");

/// Writes user code and support files at their well-known locations
pub struct CodeInjector<'a> {
    runtime: &'a dyn SandboxRuntime,
    config: &'a SandboxConfig,
}

impl<'a> CodeInjector<'a> {
    pub fn new(runtime: &'a dyn SandboxRuntime, config: &'a SandboxConfig) -> Self {
        Self { runtime, config }
    }

    /// Overwrite the canonical script with `code`
    pub async fn inject_script(&self, sandbox: &Sandbox, code: &str) -> Result<()> {
        tracing::debug!(sandbox = %sandbox.name, code_len = code.len(), "injecting script");
        self.runtime
            .push_file(sandbox, &self.config.script_path(), code.as_bytes())
            .await
            .map_err(as_injection_failure)
    }

    /// One-time push of the document helper after creation
    pub async fn install_helper(&self, sandbox: &Sandbox) -> Result<()> {
        tracing::debug!(sandbox = %sandbox.name, "installing playground helper");
        self.runtime
            .push_file(sandbox, &self.config.helper_path(), HELPER_SOURCE.as_bytes())
            .await
            .map_err(as_injection_failure)
    }

    /// Push editor tabs as one bundle into the tabs directory
    pub async fn save_tabs(&self, sandbox: &Sandbox, tabs: &BTreeMap<String, String>) -> Result<()> {
        let files: Vec<FileEntry> = tabs
            .iter()
            .map(|(name, text)| FileEntry::new(name.clone(), text.as_bytes()))
            .collect();
        for file in &files {
            crate::runtime::archive::validate_file_name(&file.name)?;
        }
        tracing::debug!(sandbox = %sandbox.name, tabs = files.len(), "saving tabs");
        self.runtime
            .push_files(sandbox, &self.config.tabs_dir(), &files)
            .await
            .map_err(as_injection_failure)
    }
}

/// Keep not-found and request errors as they are; anything else is an injection failure
fn as_injection_failure(error: SandpitError) -> SandpitError {
    match error {
        SandpitError::SandboxNotFound(_)
        | SandpitError::InvalidRequest(_)
        | SandpitError::InjectionFailure(_) => error,
        other => SandpitError::InjectionFailure(other.to_string()),
    }
}
