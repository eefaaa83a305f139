//! Application descriptor - Identity of an installed application bundle

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::app_type::{self, AppType};
use crate::error::{InstanceError, Result};
use crate::platform;

/// Immutable description of an installed application bundle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Bundle identifier (identity key)
    pub bundle_id: String,
    /// Display name
    pub name: String,
    /// Path to the `.app` bundle
    pub bundle_path: PathBuf,
    /// Absolute path of the real binary, resolved through `CFBundleExecutable`
    pub executable_path: PathBuf,
    pub version: Option<String>,
    /// `CFBundleIconFile`, if the bundle declares one
    pub icon_file: Option<String>,
    pub is_sandboxed: bool,
    pub app_type: AppType,
}

impl Application {
    /// Read a bundle without rejecting protected or sandboxed applications.
    pub fn inspect(bundle_path: impl AsRef<Path>) -> Result<Self> {
        let bundle_path = bundle_path.as_ref();
        if !bundle_path.is_dir() {
            return Err(InstanceError::NotFound(format!(
                "Application not found: {}",
                bundle_path.display()
            )));
        }

        let info = read_info_plist(bundle_path)?;

        let bundle_id = non_empty(&info, "CFBundleIdentifier")
            .cloned()
            .ok_or_else(|| {
                InstanceError::InvalidInput(format!(
                    "{} has no bundle identifier",
                    bundle_path.display()
                ))
            })?;

        let executable_name = non_empty(&info, "CFBundleExecutable")
            .cloned()
            .ok_or_else(|| {
                InstanceError::InvalidInput(format!(
                    "{} has no executable",
                    bundle_path.display()
                ))
            })?;

        let executable_path = bundle_path
            .join("Contents")
            .join("MacOS")
            .join(&executable_name);
        if !executable_path.is_file() {
            return Err(InstanceError::InvalidInput(format!(
                "Executable {} is missing from {}",
                executable_name,
                bundle_path.display()
            )));
        }

        let name = non_empty(&info, "CFBundleDisplayName")
            .or_else(|| non_empty(&info, "CFBundleName"))
            .cloned()
            .or_else(|| {
                bundle_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| bundle_id.clone());

        let version = non_empty(&info, "CFBundleShortVersionString")
            .or_else(|| non_empty(&info, "CFBundleVersion"))
            .cloned();

        let is_sandboxed = app_type::is_sandboxed_bundle(bundle_path);
        let app_type = app_type::classify(&bundle_id, bundle_path, is_sandboxed);

        Ok(Self {
            bundle_id,
            name,
            bundle_path: bundle_path.to_path_buf(),
            executable_path,
            version,
            icon_file: non_empty(&info, "CFBundleIconFile").cloned(),
            is_sandboxed,
            app_type,
        })
    }

    /// Read a bundle that is about to be isolated; protected and sandboxed
    /// applications are rejected.
    pub fn resolve(bundle_path: impl AsRef<Path>) -> Result<Self> {
        let app = Self::inspect(bundle_path)?;
        match app.app_type {
            AppType::System => Err(InstanceError::InvalidInput(format!(
                "{} is a protected system application",
                app.name
            ))),
            AppType::Sandboxed => Err(InstanceError::InvalidInput(format!(
                "{} is sandboxed and cannot be isolated",
                app.name
            ))),
            _ => Ok(app),
        }
    }

    /// Name of the real binary inside `Contents/MacOS`
    pub fn executable_name(&self) -> &str {
        self.executable_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Icon shipped inside the bundle, if present
    pub fn icon_path(&self) -> Option<PathBuf> {
        let file = self.icon_file.as_ref()?;
        let resources = self.bundle_path.join("Contents").join("Resources");
        let direct = resources.join(file);
        if direct.extension().is_some() && direct.is_file() {
            return Some(direct);
        }
        let with_ext = resources.join(format!("{}.icns", file));
        with_ext.is_file().then_some(with_ext)
    }
}

/// Read `Contents/Info.plist` into a flat key/string map.
pub fn read_info_plist(bundle_path: &Path) -> Result<HashMap<String, String>> {
    let plist_path = bundle_path.join("Contents").join("Info.plist");
    let bytes = std::fs::read(&plist_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            InstanceError::InvalidInput(format!(
                "{} has no Info.plist",
                bundle_path.display()
            ))
        } else {
            InstanceError::environment("Failed to read", &plist_path, e)
        }
    })?;

    let xml = if bytes.starts_with(b"bplist") {
        debug!("Converting binary plist {:?}", plist_path);
        platform::convert_plist_to_xml(&plist_path)?
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };

    Ok(parse_plist_strings(&xml))
}

/// Extract `<key>..</key><string>..</string>` pairs from an XML plist.
/// Empty `<string/>` elements read as "" and CDATA sections are taken verbatim.
/// The first occurrence of a key wins, which keeps top-level keys ahead of
/// same-named keys in nested dictionaries that follow them.
pub fn parse_plist_strings(xml: &str) -> HashMap<String, String> {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    let pair = PAIR.get_or_init(|| {
        Regex::new(
            r"<key>([^<]*)</key>\s*(?:<string>(?:<!\[CDATA\[((?s:.*?))\]\]>|([^<]*))</string>|<string\s*/>)",
        )
        .unwrap_or_else(|e| panic!("invalid plist pattern: {}", e))
    });

    let mut values = HashMap::new();
    for caps in pair.captures_iter(xml) {
        let value = match (caps.get(2), caps.get(3)) {
            (Some(cdata), _) => cdata.as_str().to_string(),
            (None, Some(text)) => unescape_xml(text.as_str()),
            (None, None) => String::new(),
        };
        values.entry(unescape_xml(&caps[1])).or_insert(value);
    }
    values
}

fn non_empty<'a>(info: &'a HashMap<String, String>, key: &str) -> Option<&'a String> {
    info.get(key).filter(|value| !value.trim().is_empty())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
