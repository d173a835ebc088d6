//! Settings store: load/save the settings document and resolve job configs
//!
//! Resolution walks four levels, first match wins per field:
//! per-source override, per-kind default (`"*"`), document default, and
//! finally the run-wide [`RunConfig`].

use super::schema::{JobConfig, RunConfig, SettingsDocument, SourceSettings, KIND_DEFAULT_KEY};
use super::ConfigError;
use crate::source::{SourceDescriptor, SourceKind};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hierarchical settings store
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    document: SettingsDocument,
    base: RunConfig,
    /// Cleared when no probe is available; never persisted
    restarts_available: bool,
}

impl ConfigStore {
    /// Store that is never persisted
    pub fn in_memory(document: SettingsDocument, base: RunConfig) -> Self {
        Self {
            path: None,
            document,
            base,
            restarts_available: true,
        }
    }

    /// Load the document at `path`, writing the built-in document there if
    /// the file does not exist yet.
    pub fn load(path: &Path, base: RunConfig) -> Result<Self, ConfigError> {
        if !path.exists() {
            let store = Self {
                path: Some(path.to_path_buf()),
                document: SettingsDocument::default(),
                base,
                restarts_available: true,
            };
            store.save()?;
            tracing::info!("Created default settings at {:?}", path);
            return Ok(store);
        }

        let content = fs::read_to_string(path)?;
        let document: SettingsDocument = serde_json::from_str(&content)?;
        validate_settings("default", &document.default)?;
        for (section, entries) in [("users", &document.users), ("rooms", &document.rooms)] {
            for (id, settings) in entries {
                validate_settings(&format!("{}.{}", section, id), settings)?;
            }
        }

        tracing::debug!("Loaded settings from {:?}", path);

        Ok(Self {
            path: Some(path.to_path_buf()),
            document,
            base,
            restarts_available: true,
        })
    }

    /// Write the document back to its file, atomically
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(&self.document)?;
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(content.as_bytes())?;
        file.persist(path).map_err(|e| ConfigError::Io(e.error))?;

        tracing::debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn document(&self) -> &SettingsDocument {
        &self.document
    }

    pub fn base(&self) -> &RunConfig {
        &self.base
    }

    /// Resolve every job with resolution restarts off, whatever the
    /// document says. Used when resolution probing cannot work on this host.
    pub fn disable_resolution_restarts(&mut self) {
        self.restarts_available = false;
    }

    /// Effective configuration for one source
    pub fn resolve(&self, source: &SourceDescriptor) -> Result<JobConfig, ConfigError> {
        let mut layers: Vec<&SourceSettings> = Vec::with_capacity(3);
        if let Some((section, id)) = self.section_for(source) {
            if let Some(own) = id.as_deref().and_then(|id| section.get(id)) {
                layers.push(own);
            }
            if let Some(kind_default) = section.get(KIND_DEFAULT_KEY) {
                layers.push(kind_default);
            }
        }
        layers.push(&self.document.default);

        let check_secs = layers.iter().find_map(|layer| layer.resolution_check_interval);
        let poll_secs = layers.iter().find_map(|layer| layer.poll_interval);
        let max_secs = layers.iter().find_map(|layer| layer.max_duration);

        let config = JobConfig {
            mode: layers
                .iter()
                .find_map(|layer| layer.mode)
                .unwrap_or(self.base.mode),
            poll_interval: poll_secs
                .map(Duration::from_secs)
                .unwrap_or(self.base.poll_interval),
            max_duration: max_secs.map(Duration::from_secs).or(self.base.max_duration),
            restart_on_resolution_change: layers
                .iter()
                .find_map(|layer| layer.restart_on_resolution_change)
                .unwrap_or(self.base.restart_on_resolution_change)
                && self.restarts_available,
            resolution_check_interval: check_secs
                .map(Duration::from_secs)
                .unwrap_or(self.base.resolution_check_interval),
            output_directory: layers
                .iter()
                .find_map(|layer| layer.output_directory.clone())
                .unwrap_or_else(|| self.base.output_directory.clone()),
        };

        if config.resolution_check_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "resolution check interval for {} must be at least 1 second",
                source
            )));
        }
        if config.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "poll interval for {} must be positive",
                source
            )));
        }

        Ok(config)
    }

    /// Merge `patch` into the per-source override for `source`
    pub fn set_override(
        &mut self,
        source: &SourceDescriptor,
        patch: &SourceSettings,
    ) -> Result<(), ConfigError> {
        validate_settings(&source.to_string(), patch)?;
        let (section, id) = match source.kind() {
            SourceKind::Handle => (&mut self.document.users, Some(source.value().to_string())),
            SourceKind::Room => (&mut self.document.rooms, Some(source.value().to_string())),
            SourceKind::Url => (&mut self.document.users, source.url_handle()),
        };
        let id = id.ok_or_else(|| ConfigError::NoSection(source.to_string()))?;
        section.entry(id).or_default().merge(patch);
        tracing::info!("Updated settings for {}", source);
        Ok(())
    }

    /// Kind section and identifier used to look up `source`
    fn section_for(
        &self,
        source: &SourceDescriptor,
    ) -> Option<(&BTreeMap<String, SourceSettings>, Option<String>)> {
        match source {
            SourceDescriptor::Handle(name) => Some((&self.document.users, Some(name.clone()))),
            SourceDescriptor::Room(id) => Some((&self.document.rooms, Some(id.clone()))),
            SourceDescriptor::Url(_) => {
                let handle = source.url_handle()?;
                Some((&self.document.users, Some(handle)))
            }
        }
    }
}

fn validate_settings(scope: &str, settings: &SourceSettings) -> Result<(), ConfigError> {
    if settings.resolution_check_interval == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "{}: resolution check interval must be at least 1 second",
            scope
        )));
    }
    if settings.poll_interval == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "{}: poll interval must be positive",
            scope
        )));
    }
    Ok(())
}
