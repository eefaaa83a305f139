//! Instance management - Represents one isolated copy of an application

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::app_type::{AppType, IsolationMethod};
use super::application::Application;

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used to disambiguate shim names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// User-chosen settings for a new instance
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    pub environment: BTreeMap<String, String>,
    pub arguments: Vec<String>,
    pub icon_path: Option<PathBuf>,
    pub isolation_override: Option<IsolationMethod>,
    pub erase_data_on_quit: bool,
    pub show_in_quick_launch: bool,
    pub notes: String,
}

/// A persisted instance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstance {
    /// Unique identifier
    pub id: InstanceId,
    /// Display name
    pub name: String,
    /// Bundle identifier of the target application, captured at creation
    pub target_bundle_id: String,
    /// Path of the target `.app` bundle
    pub target_app_path: PathBuf,
    /// Classification captured at creation
    pub target_app_type: AppType,
    /// Generated launcher bundle
    pub shim_path: PathBuf,
    /// Isolated home container, derived from the id
    pub data_path: PathBuf,
    /// Extra environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Extra command line arguments
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Custom icon
    #[serde(default)]
    pub icon_path: Option<PathBuf>,
    #[serde(default)]
    pub isolation_override: Option<IsolationMethod>,
    /// Reset the container whenever the instance quits
    #[serde(default)]
    pub erase_data_on_quit: bool,
    #[serde(default)]
    pub show_in_quick_launch: bool,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub last_launched_at: Option<DateTime<Utc>>,
}

impl AppInstance {
    /// Build a record for `app`. The data path comes from the fresh id, so two
    /// instances never share one even when their names match.
    pub fn new(
        name: impl Into<String>,
        app: &Application,
        data_root: &Path,
        shim_path: PathBuf,
        options: InstanceOptions,
    ) -> Self {
        let id = InstanceId::new();
        Self::with_id(id, name, app, data_root, shim_path, options)
    }

    pub fn with_id(
        id: InstanceId,
        name: impl Into<String>,
        app: &Application,
        data_root: &Path,
        shim_path: PathBuf,
        options: InstanceOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            target_bundle_id: app.bundle_id.clone(),
            target_app_path: app.bundle_path.clone(),
            target_app_type: app.app_type,
            shim_path,
            data_path: Self::data_path_for(data_root, id),
            environment: options.environment,
            arguments: options.arguments,
            icon_path: options.icon_path,
            isolation_override: options.isolation_override,
            erase_data_on_quit: options.erase_data_on_quit,
            show_in_quick_launch: options.show_in_quick_launch,
            notes: options.notes,
            created_at: now,
            modified_at: now,
            last_launched_at: None,
        }
    }

    /// Container location for an instance id
    pub fn data_path_for(data_root: &Path, id: InstanceId) -> PathBuf {
        data_root.join(id.to_string())
    }

    /// Effective isolation method, honouring the user override
    pub fn isolation_method(&self) -> IsolationMethod {
        self.isolation_override
            .unwrap_or_else(|| self.target_app_type.isolation_method())
    }

    /// User settings carried over by duplicate/export
    pub fn options(&self) -> InstanceOptions {
        InstanceOptions {
            environment: self.environment.clone(),
            arguments: self.arguments.clone(),
            icon_path: self.icon_path.clone(),
            isolation_override: self.isolation_override,
            erase_data_on_quit: self.erase_data_on_quit,
            show_in_quick_launch: self.show_in_quick_launch,
            notes: self.notes.clone(),
        }
    }

    /// Record a modification
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    pub fn mark_launched(&mut self) {
        self.last_launched_at = Some(Utc::now());
    }

    /// Bundle identifier given to this instance's shim
    pub fn shim_bundle_id(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.id.0.simple())
    }
}

/// Turn a display name into something safe for a file name and shell script.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | ':' | '\\' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        "Instance".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether two launcher paths name the same bundle on a case-insensitive volume
pub fn same_shim_path(a: &Path, b: &Path) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

/// Shim location for a name. When `taken` reports the plain path as owned by
/// another instance, the short id is appended.
pub fn shim_path_for(
    shims_dir: &Path,
    name: &str,
    id: InstanceId,
    taken: impl Fn(&Path) -> bool,
) -> PathBuf {
    let base = sanitize_name(name);
    let plain = shims_dir.join(format!("{}.app", base));
    if taken(&plain) {
        shims_dir.join(format!("{} {}.app", base, id.short()))
    } else {
        plain
    }
}
