//! Export/import documents for moving instance definitions between machines

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::app_type::IsolationMethod;
use super::instance::{AppInstance, InstanceOptions};
use crate::error::{InstanceError, Result};

/// Current export document version
pub const EXPORT_VERSION: u32 = 1;

/// One instance definition. Ids, timestamps and generated paths are left out
/// and regenerated on import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedInstance {
    pub name: String,
    pub target_app_path: PathBuf,
    pub target_bundle_id: String,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub isolation_method_override: Option<IsolationMethod>,
    #[serde(default)]
    pub erase_data_on_quit: bool,
    #[serde(default)]
    pub show_in_quick_launch: bool,
    #[serde(default)]
    pub notes: String,
}

impl ExportedInstance {
    pub fn from_instance(instance: &AppInstance) -> Self {
        Self {
            name: instance.name.clone(),
            target_app_path: instance.target_app_path.clone(),
            target_bundle_id: instance.target_bundle_id.clone(),
            environment_variables: instance.environment.clone(),
            arguments: instance.arguments.clone(),
            isolation_method_override: instance.isolation_override,
            erase_data_on_quit: instance.erase_data_on_quit,
            show_in_quick_launch: instance.show_in_quick_launch,
            notes: instance.notes.clone(),
        }
    }

    pub fn options(&self) -> InstanceOptions {
        InstanceOptions {
            environment: self.environment_variables.clone(),
            arguments: self.arguments.clone(),
            icon_path: None,
            isolation_override: self.isolation_method_override,
            erase_data_on_quit: self.erase_data_on_quit,
            show_in_quick_launch: self.show_in_quick_launch,
            notes: self.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub export_date: DateTime<Utc>,
    pub app_version: String,
    pub instances: Vec<ExportedInstance>,
}

impl ExportDocument {
    pub fn new<'a>(instances: impl IntoIterator<Item = &'a AppInstance>) -> Self {
        Self {
            version: EXPORT_VERSION,
            export_date: Utc::now(),
            app_version: crate::APP_VERSION.to_string(),
            instances: instances
                .into_iter()
                .map(ExportedInstance::from_instance)
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Accepted import shapes: the full document, or a bare array of instances
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportShape {
    Document(ExportDocument),
    Bare(Vec<ExportedInstance>),
}

/// Parse an import document into instance definitions
pub fn parse_import(json: &str) -> Result<Vec<ExportedInstance>> {
    let shape: ImportShape = serde_json::from_str(json).map_err(|_| {
        InstanceError::Format(
            "Import file is neither an export document nor a list of instances".to_string(),
        )
    })?;

    match shape {
        ImportShape::Document(doc) if doc.version > EXPORT_VERSION => {
            Err(InstanceError::Format(format!(
                "Export version {} is newer than supported version {}",
                doc.version, EXPORT_VERSION
            )))
        }
        ImportShape::Document(doc) => Ok(doc.instances),
        ImportShape::Bare(instances) => Ok(instances),
    }
}
