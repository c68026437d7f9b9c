//! Declarative service definitions and the snapshot they are loaded into.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;

pub const DEFAULT_STARTUP_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_CONTROL_PORT: u16 = 3300;
pub const DEFAULT_LOG_DIRECTORY: &str = "logs";

const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// One supervised service as declared in the definition file.
/// Replaced wholesale on update, never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECONDS
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECONDS
}

impl ServiceDefinition {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_owned(),
            command: command.to_owned(),
            args: Vec::new(),
            working_directory: None,
            port: None,
            url: None,
            ready_pattern: None,
            environment: BTreeMap::new(),
            startup_timeout_seconds: DEFAULT_STARTUP_TIMEOUT_SECONDS,
            shutdown_timeout_seconds: DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ready_pattern(mut self, pattern: &str) -> Self {
        self.ready_pattern = Some(pattern.to_owned());
        self
    }

    pub fn with_startup_timeout(mut self, seconds: u64) -> Self {
        self.startup_timeout_seconds = seconds;
        self
    }

    pub fn with_shutdown_timeout(mut self, seconds: u64) -> Self {
        self.shutdown_timeout_seconds = seconds;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Full validation applied to definitions submitted through the API:
    /// name rules, a non-empty command, and a compilable readiness pattern.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        validate_name(&self.name)?;

        if self.command.trim().is_empty() {
            return Err(SupervisorError::Validation(format!(
                "service '{}' has an empty command",
                self.name
            )));
        }

        if let Some(pattern) = &self.ready_pattern {
            Regex::new(pattern).map_err(|e| {
                SupervisorError::Validation(format!("invalid readyPattern '{}': {}", pattern, e))
            })?;
        }

        Ok(())
    }
}

/// Validate a service name against the rules shared by registration and persistence.
/// Uniqueness is checked by the registry, not here.
pub fn validate_name(name: &str) -> Result<(), SupervisorError> {
    let invalid = |reason: &str| {
        Err(SupervisorError::Validation(format!(
            "invalid service name '{}': {}",
            name, reason
        )))
    };

    if name.trim().is_empty() {
        return invalid("name is empty");
    }
    if name == "." || name == ".." {
        return invalid("name is a relative path component");
    }
    if let Some(c) = name
        .chars()
        .find(|c| INVALID_NAME_CHARS.contains(c) || c.is_control())
    {
        return invalid(&format!("contains invalid character {:?}", c));
    }

    let stem = name.split('.').next().unwrap_or(name).trim_end();
    if RESERVED_DEVICE_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return invalid("name is a reserved device name");
    }

    Ok(())
}

/// Key used for case-insensitive name comparisons.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// A whole definition file: global settings plus the ordered service list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIRECTORY)
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            log_directory: default_log_directory(),
            services: Vec::new(),
        }
    }
}

/// Name-set difference between two snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<ServiceDefinition>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl ConfigSnapshot {
    pub fn find(&self, name: &str) -> Option<&ServiceDefinition> {
        let key = name_key(name);
        self.services.iter().find(|s| name_key(&s.name) == key)
    }

    /// Diff by name only. A name present in both snapshots is neither added nor
    /// removed, whatever its definition looks like in `newer`.
    pub fn diff(&self, newer: &ConfigSnapshot) -> SnapshotDiff {
        let old: HashSet<String> = self.services.iter().map(|s| name_key(&s.name)).collect();
        let new: HashSet<String> = newer.services.iter().map(|s| name_key(&s.name)).collect();

        SnapshotDiff {
            added: newer
                .services
                .iter()
                .filter(|s| !old.contains(&name_key(&s.name)))
                .cloned()
                .collect(),
            removed: self
                .services
                .iter()
                .filter(|s| !new.contains(&name_key(&s.name)))
                .map(|s| s.name.clone())
                .collect(),
        }
    }

    /// Copy of this snapshot with `definition` appended.
    pub fn with_service(&self, definition: ServiceDefinition) -> Self {
        let mut next = self.clone();
        next.services.push(definition);
        next
    }

    /// Copy of this snapshot with `name` replaced in place by `definition`.
    pub fn with_replaced(&self, name: &str, definition: ServiceDefinition) -> Self {
        let key = name_key(name);
        let mut next = self.clone();
        match next.services.iter_mut().find(|s| name_key(&s.name) == key) {
            Some(slot) => *slot = definition,
            None => next.services.push(definition),
        }
        next
    }

    /// Copy of this snapshot without `name`.
    pub fn without(&self, name: &str) -> Self {
        let key = name_key(name);
        let mut next = self.clone();
        next.services.retain(|s| name_key(&s.name) != key);
        next
    }
}
